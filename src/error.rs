use thiserror::Error;

/// Errors raised by the relay.
///
/// Configuration variants are fatal at startup. [`RelayError::ReceiveSuspended`]
/// is an internal backpressure signal that the receive pipeline consumes; it
/// never reaches a consumer or a requester.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Host URI scheme does not name a supported transport.
    #[error("invalid bus scheme '{scheme}' in host uri '{uri}', valid schemes: rabbitmq, sb")]
    InvalidScheme { scheme: String, uri: String },

    /// Host URI could not be parsed.
    #[error("invalid bus host uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// Required configuration value is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// The selected transport was compiled out of this build.
    #[error("transport '{0}' is not enabled in this build")]
    TransportDisabled(&'static str),

    /// Gate is closed; the receive will be retried once it reopens.
    #[error("receive suspended while the receive gate is closed")]
    ReceiveSuspended,

    /// Broker or network failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Report server failed to render.
    #[error("rendering failed: {0}")]
    Rendering(String),

    /// Blob store failed to persist the artifact.
    #[error("storage failed: {0}")]
    Storage(String),

    /// Transport was stopped while the operation was pending.
    #[error("transport stopped")]
    Stopped,
}

impl RelayError {
    /// True for the admission signal the pipeline recovers from locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::ReceiveSuspended)
    }

    /// True for errors that must abort startup.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidScheme { .. }
                | RelayError::InvalidUri { .. }
                | RelayError::MissingConfig(_)
                | RelayError::TransportDisabled(_)
        )
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_only_suspension_is_transient() {
        // ---
        assert!(RelayError::ReceiveSuspended.is_transient());
        assert!(!RelayError::Stopped.is_transient());
        assert!(!RelayError::Transport("down".into()).is_transient());
    }

    #[test]
    fn test_invalid_scheme_names_valid_schemes() {
        // ---
        let err = RelayError::InvalidScheme {
            scheme: "ftp".into(),
            uri: "ftp://x".into(),
        };
        let msg = err.to_string();
        assert!(err.is_config());
        assert!(msg.contains("ftp"));
        assert!(msg.contains("rabbitmq"));
        assert!(msg.contains("sb"));
    }
}
