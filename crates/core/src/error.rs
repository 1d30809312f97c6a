use thiserror::Error;

/// The umbrella error type for the Parley client.
#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("History error: {0}")]
    History(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Parley operations.
pub type Result<T> = std::result::Result<T, ParleyError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
