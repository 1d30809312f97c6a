use parley_core::EventBusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport already connected as {0}")]
    AlreadyConnected(String),

    #[error("username rejected: {0}")]
    UsernameRejected(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

impl TransportError {
    /// Whether the transport's own reconnection policy may recover from this.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::UsernameRejected(_) | TransportError::AlreadyConnected(_)
        )
    }
}
