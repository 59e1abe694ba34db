// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the transport-independent vocabulary shared by the
//! receive pipeline, the gate and the concrete transports under
//! `src/transport/`. It intentionally avoids any reference to AMQP, Service Bus
//! or other client libraries.
//!
//! A transport owns delivery and acknowledgement. For every inbound message it
//! builds a [`ReceiveContext`], hands it to the receive pipeline, and acts on
//! the returned [`Disposition`]. Everything between (admission, consumption,
//! reply construction) is transport-agnostic.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{BusScheme, BusUri, RelayError, Result, TransportTuningProfile};

/// A queue address.
///
/// Plain queue names are used as-is. Bus URIs such as
/// `rabbitmq://host/vhost/replies` are accepted too; the transports route to
/// their last path segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Queue name this address routes to.
    pub fn queue_name(&self) -> &str {
        // ---
        let raw = self.0.as_ref();
        let raw = raw.split(['?', '#']).next().unwrap_or(raw);

        match raw.split_once("://") {
            Some((_, rest)) => rest
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(rest),
            None => raw,
        }
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque message envelope.
///
/// The transport layer does not interpret the payload; the consumer binding
/// decodes it. Metadata fields map onto the native message properties of each
/// transport (AMQP basic properties, Service Bus broker properties).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    // ---
    /// Broker-assigned or sender-assigned message id.
    pub message_id: Option<Arc<str>>,

    /// Correlation identifier linking a reply to its request.
    pub correlation_id: Option<Arc<str>>,

    /// Where the reply to this message must be sent.
    pub reply_to: Option<Address>,

    /// Payload format (e.g. "application/json").
    pub content_type: Option<Arc<str>>,

    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    // ---
    /// Create a request envelope carrying a reply address.
    pub fn request(payload: Bytes, correlation_id: Arc<str>, reply_to: Address) -> Self {
        // ---
        Self {
            message_id: Some(Arc::from(uuid::Uuid::new_v4().to_string())),
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
            payload,
        }
    }

    /// Create a reply envelope for the given correlation id.
    pub fn reply(payload: Bytes, correlation_id: Option<Arc<str>>) -> Self {
        // ---
        Self {
            message_id: Some(Arc::from(uuid::Uuid::new_v4().to_string())),
            correlation_id,
            reply_to: None,
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
            payload,
        }
    }
}

/// Content type of every payload this service produces.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-delivery state handed to every receive observer.
#[derive(Clone, Debug)]
pub struct ReceiveContext {
    /// Queue the message was received from.
    pub queue: Arc<str>,

    /// The delivered message.
    pub envelope: Envelope,

    /// 1 on first delivery; higher on redelivery.
    pub delivery_count: u32,

    /// When the transport handed the message to the pipeline.
    pub received_at: Instant,
}

impl ReceiveContext {
    pub fn new(queue: impl Into<Arc<str>>, envelope: Envelope, delivery_count: u32) -> Self {
        Self {
            queue: queue.into(),
            envelope,
            delivery_count,
            received_at: Instant::now(),
        }
    }
}

/// What a transport must do with a delivery once the pipeline is done.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Consumed. Publish `reply` (if any) to its address, then acknowledge.
    Complete { reply: Option<(Address, Envelope)> },

    /// Not consumed. Return the message to the broker for redelivery.
    Requeue,

    /// Faulted or undeliverable. Drop the message.
    Discard,
}

/// Receive pipeline hooks.
///
/// One observer implementation serves every message type; the message itself
/// is reachable through [`ReceiveContext`]. Hooks run concurrently for
/// different deliveries, up to the transport's concurrency cap.
#[async_trait::async_trait]
pub trait ReceiveObserver: Send + Sync {
    // ---
    /// Called before a delivery is handed to the consumer.
    ///
    /// Returning an error for which [`RelayError::is_transient`] holds asks
    /// the pipeline to suspend and retry this receive; any other error
    /// discards the delivery.
    async fn pre_receive(&self, ctx: &ReceiveContext) -> Result<()>;

    /// Called once a delivery has been admitted.
    async fn post_receive(&self, ctx: &ReceiveContext);

    /// Called after the consumer finished successfully.
    async fn post_consume(&self, ctx: &ReceiveContext, elapsed: Duration);

    /// Called when the consumer failed.
    async fn consume_fault(&self, ctx: &ReceiveContext, err: &RelayError);

    /// Called when admission failed. The pipeline retries a transient fault
    /// only after every observer's `receive_fault` has returned.
    async fn receive_fault(&self, ctx: &ReceiveContext, err: &RelayError);
}

/// Credentials presented to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// RabbitMQ user name or Service Bus SAS key name.
    pub name: String,

    /// RabbitMQ password or Service Bus SAS key.
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Everything a transport factory needs to connect and start consuming.
///
/// Produced by the transport selector; see [`crate::plan_transport`].
#[derive(Clone, Debug, PartialEq)]
pub struct TransportConfig {
    /// Identifier used in logs and consumer tags.
    pub node_id: String,

    /// Selected transport.
    pub scheme: BusScheme,

    /// Host URI normalized to the shape the transport expects.
    pub endpoint: BusUri,

    /// Queue to consume.
    pub queue: String,

    pub credentials: Credentials,

    pub tuning: TransportTuningProfile,
}

/// Shared base state for all transport implementations.
pub struct TransportBase {
    /// Unique identifier for this transport instance (the node_id).
    pub transport_id: String,

    /// Consumed queue.
    pub queue: String,

    /// Tuning applied when the transport was built.
    pub tuning: TransportTuningProfile,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(
        transport_id: impl Into<String>,
        queue: impl Into<String>,
        tuning: TransportTuningProfile,
    ) -> Self {
        Self {
            transport_id: transport_id.into(),
            queue: queue.into(),
            tuning,
        }
    }
}

impl From<&TransportConfig> for TransportBase {
    fn from(config: &TransportConfig) -> Self {
        // ---
        Self {
            transport_id: config.node_id.clone(),
            queue: config.queue.clone(),
            tuning: config.tuning.clone(),
        }
    }
}

/// A started, consuming transport.
///
/// Returned by the transport factories once the receive endpoint is running.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Returns the consumed queue.
    fn queue(&self) -> &str {
        &self.base().queue
    }

    /// Returns the tuning profile in effect.
    fn tuning(&self) -> &TransportTuningProfile {
        &self.base().tuning
    }

    /// Send an envelope to the given address.
    async fn publish(&self, address: &Address, env: Envelope) -> Result<()>;

    /// Stop consuming, release suspended deliveries back to the broker and
    /// close the connection.
    ///
    /// Waits for admitted deliveries to settle.
    async fn stop(&self) -> Result<()>;

    /// Stop without waiting for admitted deliveries.
    ///
    /// Their processing is cancelled and the messages go back to the broker
    /// unsettled, to be redelivered to this or another instance.
    async fn abort(&self) -> Result<()>;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;
