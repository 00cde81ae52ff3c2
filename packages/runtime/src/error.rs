//! Runtime error types.
//!
//! [`RuntimeError`] covers construction and startup and is fatal.
//! [`ProcessError`] is scoped to a single message and never leaves the
//! task that produced it.

use crate::broker::BrokerError;
use crate::config::ConfigError;

/// Errors raised while building or starting a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no handler registered for module '{module}'")]
    HandlerNotFound { module: String },

    #[error("handler init failed: {0:#}")]
    HandlerInit(anyhow::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("metrics server error: {0}")]
    MetricsServer(#[source] std::io::Error),

    #[error("dispatcher has already been started")]
    AlreadyStarted,
}

/// Failure processing one inbound message.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to decode request payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The payload was valid JSON but not an object.
    #[error("request payload must be a JSON object, got {kind}")]
    NotAnObject { kind: &'static str },

    #[error("Error invoking process function: {0:#}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl ProcessError {
    /// Whether the message could not be decoded at all.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::NotAnObject { .. })
    }
}

/// Failure publishing a response batch.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to create producer for {topic}: {source}")]
    Producer {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// Some envelopes of the batch were not delivered.
    #[error("{failed} of {total} response envelopes failed: {first}")]
    Send {
        failed: usize,
        total: usize,
        first: BrokerError,
    },
}
