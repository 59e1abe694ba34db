//! Minimal Service Bus REST client.
//!
//! Covers what a competing consumer needs: queue provisioning, send, and
//! peek-lock receive with complete / abandon / renew-lock on the locked
//! message. Every request carries a fresh SAS token scoped to the namespace.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::sas;
use crate::{
    //
    log_debug,
    Address,
    BusUri,
    Credentials,
    Envelope,
    RelayError,
    Result,
    TransportTuningProfile,
    JSON_CONTENT_TYPE,
};

const API_VERSION: &str = "2017-04";
const BROKER_PROPERTIES: &str = "BrokerProperties";
const ATOM_ENTRY: &str = "application/atom+xml;type=entry;charset=utf-8";
const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Slack on top of the long-poll timeout before the HTTP request gives up.
const REQUEST_SLACK: Duration = Duration::from_secs(30);

/// Broker properties travelling in the `BrokerProperties` header.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct BrokerProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
}

impl From<&Envelope> for BrokerProperties {
    fn from(env: &Envelope) -> Self {
        Self {
            message_id: env.message_id.as_deref().map(str::to_string),
            correlation_id: env.correlation_id.as_deref().map(str::to_string),
            reply_to: env.reply_to.as_ref().map(|a| a.0.to_string()),
            ..Self::default()
        }
    }
}

/// A message held under a peek-lock.
#[derive(Debug, Clone)]
pub(crate) struct LockedMessage {
    /// URI of the locked message; target of complete/abandon/renew.
    pub location: String,
    pub properties: BrokerProperties,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl LockedMessage {
    pub fn delivery_count(&self) -> u32 {
        self.properties.delivery_count.unwrap_or(1).max(1)
    }

    pub fn envelope(&self) -> Envelope {
        // ---
        let props = &self.properties;
        Envelope {
            message_id: props.message_id.as_deref().map(Arc::from),
            correlation_id: props.correlation_id.as_deref().map(Arc::from),
            reply_to: props.reply_to.as_deref().map(Address::from),
            content_type: self.content_type.as_deref().map(Arc::from),
            payload: self.body.clone(),
        }
    }
}

/// Queue description for provisioning, in the management API's Atom format.
///
/// `QueueDescription` elements must appear in schema order.
pub(crate) fn queue_description(tuning: &TransportTuningProfile) -> String {
    // ---
    let mut fields = String::new();
    if let Some(lock) = tuning.lock_duration {
        fields.push_str(&format!("<LockDuration>PT{}S</LockDuration>", lock.as_secs()));
    }
    if let Some(ttl) = tuning.message_ttl {
        fields.push_str(&format!(
            "<DefaultMessageTimeToLive>PT{}S</DefaultMessageTimeToLive>",
            ttl.as_secs()
        ));
    }
    fields.push_str("<DeadLetteringOnMessageExpiration>false</DeadLetteringOnMessageExpiration>");
    if let Some(count) = tuning.max_delivery_count {
        fields.push_str(&format!("<MaxDeliveryCount>{count}</MaxDeliveryCount>"));
    }

    format!(
        concat!(
            r#"<entry xmlns="http://www.w3.org/2005/Atom">"#,
            r#"<content type="application/xml">"#,
            r#"<QueueDescription xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect" "#,
            r#"xmlns:i="http://www.w3.org/2001/XMLSchema-instance">"#,
            "{}",
            "</QueueDescription></content></entry>"
        ),
        fields
    )
}

pub(crate) struct ServiceBusClient {
    http: reqwest::Client,
    base_url: String,
    resource: String,
    credentials: Credentials,
}

impl ServiceBusClient {
    /// Client for the namespace at `endpoint` (`sb://{ns}.servicebus.windows.net`).
    pub fn new(endpoint: &BusUri, credentials: Credentials, poll_timeout: Duration) -> Result<Self> {
        // ---
        let authority = match endpoint.port {
            Some(port) => format!("{}:{port}", endpoint.host),
            None => endpoint.host.clone(),
        };
        let base_url = format!("https://{authority}");

        let http = reqwest::Client::builder()
            .timeout(poll_timeout + REQUEST_SLACK)
            .build()
            .map_err(|e| RelayError::Transport(format!("servicebus: http client: {e}")))?;

        Ok(Self {
            http,
            resource: format!("{base_url}/"),
            base_url,
            credentials,
        })
    }

    fn authorization(&self) -> Result<String> {
        sas::token(
            &self.resource,
            &self.credentials.name,
            &self.credentials.secret,
            sas::expiry_in(TOKEN_TTL)?,
        )
    }

    fn request(&self, method: Method, url: &str) -> Result<reqwest::RequestBuilder> {
        Ok(self
            .http
            .request(method, url)
            .header(AUTHORIZATION, self.authorization()?))
    }

    async fn send_checked(&self, op: &str, request: reqwest::RequestBuilder) -> Result<Response> {
        // ---
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("servicebus: {op}: {e}")))?;
        check(op, response).await
    }

    /// Create `queue` with the tuned settings; an existing queue is left as is.
    pub async fn ensure_queue(&self, queue: &str, tuning: &TransportTuningProfile) -> Result<()> {
        // ---
        let url = format!("{}/{queue}?api-version={API_VERSION}", self.base_url);
        let request = self
            .request(Method::PUT, &url)?
            .header(CONTENT_TYPE, ATOM_ENTRY)
            .body(queue_description(tuning));

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("servicebus: create queue: {e}")))?;

        if response.status() == StatusCode::CONFLICT {
            log_debug!("servicebus: queue {queue} already exists");
            return Ok(());
        }
        check("create queue", response).await.map(|_| ())
    }

    /// Send `env` to `queue`.
    pub async fn send(&self, queue: &str, env: &Envelope) -> Result<()> {
        // ---
        let url = format!("{}/{queue}/messages", self.base_url);
        let properties = serde_json::to_string(&BrokerProperties::from(env))?;
        let content_type = env.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE);

        let request = self
            .request(Method::POST, &url)?
            .header(BROKER_PROPERTIES, properties)
            .header(CONTENT_TYPE, content_type)
            .body(env.payload.clone());

        self.send_checked("send", request).await.map(|_| ())
    }

    /// Peek-lock the head of `queue`, long-polling up to `timeout`.
    ///
    /// Returns `None` when no message arrived in time.
    pub async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<LockedMessage>> {
        // ---
        let url = format!(
            "{}/{queue}/messages/head?timeout={}",
            self.base_url,
            timeout.as_secs().max(1)
        );
        let response = self
            .send_checked("receive", self.request(Method::POST, &url)?)
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let location = header(LOCATION.as_str()).ok_or_else(|| {
            RelayError::Transport("servicebus: locked message without Location".into())
        })?;
        let properties = match header(BROKER_PROPERTIES) {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BrokerProperties::default(),
        };
        let content_type = header(CONTENT_TYPE.as_str());

        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Transport(format!("servicebus: read body: {e}")))?;

        Ok(Some(LockedMessage {
            location,
            properties,
            content_type,
            body,
        }))
    }

    /// Delete a locked message.
    pub async fn complete(&self, message: &LockedMessage) -> Result<()> {
        let request = self.request(Method::DELETE, &message.location)?;
        self.send_checked("complete", request).await.map(|_| ())
    }

    /// Release the lock so the message can be delivered again.
    pub async fn abandon(&self, message: &LockedMessage) -> Result<()> {
        let request = self.request(Method::PUT, &message.location)?;
        self.send_checked("abandon", request).await.map(|_| ())
    }

    /// Extend the lock by the queue's lock duration.
    pub async fn renew_lock(&self, message: &LockedMessage) -> Result<()> {
        let request = self.request(Method::POST, &message.location)?;
        self.send_checked("renew lock", request).await.map(|_| ())
    }
}

async fn check(op: &str, response: Response) -> Result<Response> {
    // ---
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RelayError::Transport(format!(
        "servicebus: {op} failed with {status}: {body}"
    )))
}
