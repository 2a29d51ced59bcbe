//! Error types shared by every bus and transport.

use crate::aggregate::AggregateError;
use crate::envelope::EnvelopeKind;
use thiserror::Error;

/// Boxed application error carried through [`HandlerError::Other`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Why a caller stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancellationError {
    /// The context was cancelled explicitly
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Errors returned by command, query and event handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure reported by a handler running behind a transport
    #[error("Remote handler failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    #[error(transparent)]
    Other(#[from] BoxError),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors raised by a publish/subscribe transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Failed to publish a message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Failed to subscribe to a topic
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Failed to ack or nack a message
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// Broker or subscription already closed
    #[error("Transport closed: {0}")]
    Closed(String),

    /// Invalid adapter configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Any other broker-side failure
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Closed(_) | TransportError::Broker(_)
        )
    }

    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TransportError::Connection(_) | TransportError::Closed(_))
    }
}

/// Errors surfaced to callers of `dispatch` / `publish` / `register_handler`.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no handler registered for {kind} '{name}'")]
    HandlerNotFound { kind: EnvelopeKind, name: String },

    #[error("a handler is already registered for {kind} '{name}'")]
    DuplicateHandler { kind: EnvelopeKind, name: String },

    #[error("invalid envelope name: {0:?}")]
    InvalidName(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handler(HandlerError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Cancelled(#[from] CancellationError),
}

impl BusError {
    /// True when the caller's context expired or was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BusError::Cancelled(_))
    }

    /// True for failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::Transport(e) => e.is_retryable(),
            BusError::Cancelled(CancellationError::DeadlineExceeded) => true,
            _ => false,
        }
    }
}

impl From<HandlerError> for BusError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Cancelled(reason) => BusError::Cancelled(reason),
            other => BusError::Handler(other),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_cancellation_maps_to_bus_cancellation() {
        let err: BusError = HandlerError::Cancelled(CancellationError::DeadlineExceeded).into();
        assert!(err.is_cancellation());
        assert!(err.is_retryable());

        let err: BusError = HandlerError::failed("boom").into();
        assert!(matches!(err, BusError::Handler(HandlerError::Failed(ref m)) if m == "boom"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn not_found_message_names_the_envelope() {
        let err = BusError::HandlerNotFound {
            kind: EnvelopeKind::Query,
            name: "FindTicket".to_string(),
        };
        assert_eq!(err.to_string(), "no handler registered for query 'FindTicket'");
    }

    #[test]
    fn transport_retry_classification() {
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(!TransportError::Configuration("bad".into()).is_retryable());
        assert!(TransportError::Closed("gone".into()).is_connection_error());
    }
}
