//! Bus configuration.
//!
//! [`BusConfiguration`] is built once at startup through
//! [`BusConfigurationBuilder`] and is read-only afterwards. It is passed
//! explicitly to the transport selector; there is no process-global
//! "current configuration".
//!
//! The host URI is parsed eagerly so a malformed value fails at build time,
//! before any transport is selected or any connection attempted.

use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::{RelayError, Result};

/// Queue consumed when no queue name is configured.
pub const DEFAULT_QUEUE_NAME: &str = "execute-report";

/// Scheme token selecting the RabbitMQ transport.
pub const RABBITMQ_SCHEME: &str = "rabbitmq";

/// Scheme token selecting the Azure Service Bus transport.
pub const SERVICE_BUS_SCHEME: &str = "sb";

/// Supported bus transports, one per scheme token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusScheme {
    /// `rabbitmq://host[:port][/vhost]`
    RabbitMq,

    /// `sb://namespace[.servicebus.windows.net]`
    ServiceBus,
}

impl BusScheme {
    /// Every supported scheme, in the order they are reported to users.
    pub const ALL: [BusScheme; 2] = [BusScheme::RabbitMq, BusScheme::ServiceBus];

    /// The URI scheme token for this transport.
    pub fn token(self) -> &'static str {
        match self {
            BusScheme::RabbitMq => RABBITMQ_SCHEME,
            BusScheme::ServiceBus => SERVICE_BUS_SCHEME,
        }
    }

    /// Select the transport for a parsed host URI.
    ///
    /// Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidScheme`] naming the offending value.
    pub fn from_uri(uri: &BusUri) -> Result<Self> {
        // ---
        uri.scheme.parse().map_err(|_| RelayError::InvalidScheme {
            scheme: uri.scheme.clone(),
            uri: uri.to_string(),
        })
    }
}

impl FromStr for BusScheme {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // ---
        BusScheme::ALL
            .into_iter()
            .find(|scheme| scheme.token().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

impl fmt::Display for BusScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A parsed bus host URI.
///
/// Bus hosts are absolute `scheme://host[:port][/path][?query][#fragment]`
/// URIs; the host may be a bracketed IPv6 literal. User-info is rejected;
/// credentials come from the secret name and secret settings instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusUri {
    /// Scheme, lower-cased.
    pub scheme: String,
    /// Host as written in the URI; IPv6 literals keep their brackets.
    pub host: String,
    pub port: Option<u16>,
    /// Path including the leading `/`, or empty.
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl BusUri {
    /// Parse a host URI.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidUri`] when the value is not an absolute
    /// `scheme://host` URI.
    pub fn parse(raw: &str) -> Result<Self> {
        // ---
        let invalid = |reason: &str| RelayError::InvalidUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
        if !url.has_authority() {
            return Err(invalid("expected 'scheme://host'"));
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid(
                "credentials must be configured through the secret settings, not the host uri",
            ));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("host is empty"))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port(),
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            fragment: url.fragment().map(str::to_string),
        })
    }

    /// Copy of this URI without query and fragment.
    pub fn without_query_and_fragment(&self) -> Self {
        Self {
            query: None,
            fragment: None,
            ..self.clone()
        }
    }
}

impl FromStr for BusUri {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        BusUri::parse(s)
    }
}

impl fmt::Display for BusUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        f.write_str(&self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

/// Bus connection settings.
///
/// Immutable once built. Use [`BusConfiguration::builder`].
#[derive(Clone)]
pub struct BusConfiguration {
    host_uri: BusUri,
    queue_name: String,
    secret_name: Option<String>,
    secret: Option<String>,
}

impl BusConfiguration {
    /// Start building a configuration.
    pub fn builder() -> BusConfigurationBuilder {
        BusConfigurationBuilder::default()
    }

    /// Parsed host URI; its scheme selects the transport.
    pub fn host_uri(&self) -> &BusUri {
        &self.host_uri
    }

    /// Queue consumed by this service; never empty.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Credential name (RabbitMQ user name or Service Bus SAS key name).
    pub fn secret_name(&self) -> Option<&str> {
        self.secret_name.as_deref()
    }

    /// Credential secret (RabbitMQ password or Service Bus SAS key).
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl fmt::Debug for BusConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfiguration")
            .field("host_uri", &self.host_uri.to_string())
            .field("queue_name", &self.queue_name)
            .field("secret_name", &self.secret_name)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Builder for [`BusConfiguration`].
///
/// # Example
///
/// ```
/// use report_relay::BusConfiguration;
///
/// # fn example() -> report_relay::Result<()> {
/// let config = BusConfiguration::builder()
///     .host_uri("rabbitmq://localhost")
///     .queue_name("reports")
///     .build()?;
///
/// assert_eq!(config.queue_name(), "reports");
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct BusConfigurationBuilder {
    host_uri: Option<String>,
    queue_name: Option<String>,
    secret_name: Option<String>,
    secret: Option<String>,
}

impl BusConfigurationBuilder {
    /// Set the bus host URI (required).
    pub fn host_uri(mut self, uri: impl Into<String>) -> Self {
        self.host_uri = Some(uri.into());
        self
    }

    /// Set the queue name. Empty values fall back to [`DEFAULT_QUEUE_NAME`].
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Set the credential name.
    pub fn secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = Some(name.into());
        self
    }

    /// Set the credential secret.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Build the configuration (consumes self).
    ///
    /// # Errors
    ///
    /// - [`RelayError::MissingConfig`] when no host URI was given
    /// - [`RelayError::InvalidUri`] when the host URI is malformed
    pub fn build(self) -> Result<BusConfiguration> {
        // ---
        let raw = self
            .host_uri
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| RelayError::MissingConfig("bus host uri".into()))?;

        let host_uri = BusUri::parse(&raw)?;

        let queue_name = self
            .queue_name
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());

        Ok(BusConfiguration {
            host_uri,
            queue_name,
            secret_name: self.secret_name.filter(|s| !s.is_empty()),
            secret: self.secret.filter(|s| !s.is_empty()),
        })
    }
}
