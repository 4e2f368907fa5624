//! Error types for the broker client library

/// Main error type for broker client operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerClientError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No channel is held and an implicit reconnect did not produce one
    #[error("Not connected to broker: {message}")]
    NotConnected { message: String },

    /// Operation rejected by the endpoint at the channel level
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Outbound payload could not be serialized to JSON text
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consumer tag not present in the local registry
    #[error("Unknown consumer tag '{consumer_tag}'")]
    UnknownConsumer { consumer_tag: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Generic client error
    #[error("{message}")]
    Generic { message: String },
}

impl BrokerClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new not-connected error
    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    /// Create a new channel error
    pub fn channel<S: Into<String>>(message: S) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected { .. } | Self::Io(_)
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected { .. } | Self::Io(_)
        )
    }

    /// Check if this error came from payload serialization
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}
