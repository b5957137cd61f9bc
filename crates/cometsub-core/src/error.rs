//! Error types for the connection and subscription layers.

use thiserror::Error;

/// Invalid or incomplete [`SubscriberConfig`](crate::config::SubscriberConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The node address is missing.
    #[error("address is required")]
    MissingAddress,

    /// A timer option was set to zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    /// The config file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    /// The config document is not valid JSON for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures reported by a [`Transport`](crate::transport::Transport) adapter.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The address cannot be used by this adapter.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The underlying socket is gone.
    #[error("transport closed")]
    Closed,

    /// Any other socket-level failure.
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the connection manager.
///
/// These are delivered as [`ConnectionEvent::Error`](crate::connection::ConnectionEvent::Error)
/// rather than returned, except for [`ConnectionError::Serialization`] and
/// [`ConnectionError::Stopped`] which `send` reports directly.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Socket-level failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// No frame or ack arrived within the window after a heartbeat probe.
    #[error("heartbeat ack timeout after {ms}ms")]
    HeartbeatTimeout { ms: u64 },

    /// No frame or ack arrived for the whole silence window.
    #[error("no messages for {ms}ms")]
    Silence { ms: u64 },

    /// Closing the previous transport failed.
    #[error("failed to close transport: {0}")]
    Close(String),

    /// The outbound envelope could not be encoded.
    #[error("failed to serialize envelope: {0}")]
    Serialization(String),

    /// The connection task has exited.
    #[error("connection manager stopped")]
    Stopped,
}

impl ConnectionError {
    /// Returns `true` if this failure came from liveness monitoring rather
    /// than the socket itself.
    pub fn is_liveness(&self) -> bool {
        matches!(self, Self::HeartbeatTimeout { .. } | Self::Silence { .. })
    }

    /// Returns `true` if a reconnect can reasonably fix this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::HeartbeatTimeout { .. } | Self::Silence { .. }
        )
    }
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Errors from subscribe/unsubscribe operations.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// The query already has a registered handler.
    #[error("already subscribed to query: {query}")]
    Duplicate { query: String },

    /// The node answered the request with an error envelope.
    #[error("{detail}")]
    Remote { query: String, detail: String },

    /// The request was abandoned because its connection generation ended.
    #[error("connection closed before a response to '{query}' arrived")]
    ConnectionClosed { query: String },

    /// No response arrived within the request timeout.
    #[error("request for '{query}' timed out after {ms}ms")]
    Timeout { query: String, ms: u64 },

    /// The request could not be handed to the connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl SubscriptionError {
    /// Returns `true` if the node itself rejected the request.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Errors surfaced to the application by the [`Subscriber`](crate::subscriber::Subscriber).
#[derive(Debug, Clone, Error)]
pub enum SubscriberError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Replaying subscriptions after (re)connect failed; the connection was dropped.
    #[error("failed to restore subscriptions: {0}")]
    Restore(SubscriptionError),
}
