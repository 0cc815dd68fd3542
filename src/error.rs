//! Error types shared across the feed, buffer, strategy and service layers.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SignalError {
    /// Transport-level failure: the provider is unreachable, or the feed
    /// exhausted its reconnect budget and terminated.
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider rejected the symbol in a subscription request.
    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),

    /// A sample arrived with a timestamp at or before the last stored one.
    #[error("out-of-order sample: timestamp {incoming} <= last stored {last}")]
    OutOfOrder {
        incoming: chrono::DateTime<chrono::Utc>,
        last: chrono::DateTime<chrono::Utc>,
    },

    /// The buffer holds fewer samples than the operation needs.
    #[error("insufficient data: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    /// Invalid strategy or feed configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// `get_signal` was called for an instrument that was never subscribed.
    #[error("not subscribed: {0}")]
    NotSubscribed(String),

    /// The caller-supplied deadline lapsed; state was left unchanged.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, SignalError>;
