//! Per-invocation execution context handed to handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::JsonObject;

/// Metadata key resolving to the topic the message was consumed from.
pub const METADATA_TOPIC: &str = "topic";
/// Metadata key resolving to the broker-assigned message id.
pub const METADATA_MESSAGE_ID: &str = "message_id";

/// Broker-side facts about the message being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Source topic name.
    pub topic: String,
    /// Broker-assigned message identifier.
    pub message_id: String,
}

/// Errors raised by context lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("metadata key not found: {key}")]
    MetadataNotFound { key: String },
}

/// Façade given to a handler for one invocation.
///
/// Exposes the custom `config` settings of the function, metadata about the
/// originating message, and an `emit` callback appending response envelopes.
/// Clones share the same outbox, so a handler may move a clone into a
/// spawned future and still have its output collected.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    module: Arc<str>,
    settings: Arc<JsonObject>,
    metadata: Option<Arc<MessageMetadata>>,
    outbox: Arc<Mutex<Vec<Envelope>>>,
}

impl FunctionContext {
    /// Creates a context that is not bound to any message.
    ///
    /// Used for the handler `init` hook; every metadata lookup fails.
    #[must_use]
    pub fn new(module: impl Into<Arc<str>>, settings: Arc<JsonObject>) -> Self {
        Self {
            module: module.into(),
            settings,
            metadata: None,
            outbox: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a fresh context bound to one inbound message.
    #[must_use]
    pub fn for_message(
        module: impl Into<Arc<str>>,
        settings: Arc<JsonObject>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            metadata: Some(Arc::new(metadata)),
            ..Self::new(module, settings)
        }
    }

    /// Looks up one custom setting from the `config` section.
    #[must_use]
    pub fn get_config(&self, name: &str) -> Option<&Value> {
        self.settings.get(name)
    }

    /// All custom settings.
    #[must_use]
    pub fn get_configs(&self) -> &JsonObject {
        &self.settings
    }

    /// Name of the module currently executing.
    #[must_use]
    pub fn get_module(&self) -> &str {
        &self.module
    }

    /// Looks up message metadata. Only `topic` and `message_id` are known.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::MetadataNotFound`] for any other key, or for
    /// any key when the context is not bound to a message.
    pub fn get_metadata(&self, key: &str) -> Result<&str, ContextError> {
        let not_found = || ContextError::MetadataNotFound {
            key: key.to_string(),
        };
        let metadata = self.metadata.as_deref().ok_or_else(not_found)?;
        match key {
            METADATA_TOPIC => Ok(&metadata.topic),
            METADATA_MESSAGE_ID => Ok(&metadata.message_id),
            _ => Err(not_found()),
        }
    }

    /// Appends an output envelope to this invocation's response.
    pub fn emit(&self, data: JsonObject, event_time: Option<DateTime<Utc>>) {
        self.outbox.lock().push(Envelope { data, event_time });
    }

    /// Removes and returns everything emitted so far, in emission order.
    #[must_use]
    pub fn take_emitted(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.outbox.lock())
    }
}
