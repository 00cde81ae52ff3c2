//! Broker client contract.
//!
//! The dispatcher drives any publish/subscribe transport through these
//! traits: one client connection, one multi-topic consumer, and one producer
//! per destination topic. [`memory::MemoryBroker`] is the in-process
//! reference implementation.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryBroker;

/// Message property carrying the correlation id.
pub const REQUEST_ID_PROPERTY: &str = "request_id";
/// Message property overriding the response destination.
pub const RESPONSE_TOPIC_PROPERTY: &str = "response_topic";

/// Errors surfaced by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("receive timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("already closed")]
    AlreadyClosed,
    #[error("failed to send to {topic}: {reason}")]
    Send { topic: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message received from a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw body, expected to be a JSON object.
    pub payload: Bytes,
    /// Broker message properties.
    pub properties: HashMap<String, String>,
    /// Broker-assigned identifier.
    pub message_id: String,
    /// Topic the message was consumed from.
    pub topic: String,
}

impl InboundMessage {
    /// A property value, treating empty strings as absent.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// The correlation id, if the sender expects a reply.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.property(REQUEST_ID_PROPERTY)
    }

    /// Per-message response destination override.
    #[must_use]
    pub fn response_topic(&self) -> Option<&str> {
        self.property(RESPONSE_TOPIC_PROPERTY)
    }
}

/// A message handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub properties: HashMap<String, String>,
    /// Event time in milliseconds since the Unix epoch.
    pub event_timestamp: Option<i64>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: HashMap::new(),
            event_timestamp: None,
        }
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_event_timestamp(mut self, millis: Option<i64>) -> Self {
        self.event_timestamp = millis;
        self
    }

    /// The `request_id` property, if present.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.properties.get(REQUEST_ID_PROPERTY).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A broker connection. Owned by the dispatcher; nothing else closes it.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens a shared consumer over all `topics`.
    async fn subscribe(
        &self,
        topics: &[String],
        subscription: &str,
    ) -> Result<Arc<dyn Consumer>, BrokerError>;

    /// Creates a producer bound to `topic`.
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError>;

    /// Closes the connection. A second call may return [`BrokerError::AlreadyClosed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A multi-topic consumer.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Waits up to `timeout` for the next message.
    ///
    /// Returns [`BrokerError::Timeout`] when nothing arrived in time and
    /// [`BrokerError::Cancelled`] when the transport asks the caller to stop.
    async fn receive(&self, timeout: Duration) -> Result<InboundMessage, BrokerError>;

    /// Acknowledges a message so the broker will not redeliver it.
    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A producer bound to one topic.
#[async_trait]
pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;

    /// Publishes one message and resolves once the broker confirmed it,
    /// returning the assigned message id.
    async fn send(&self, message: OutboundMessage) -> Result<String, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(properties: &[(&str, &str)]) -> InboundMessage {
        InboundMessage {
            payload: Bytes::from_static(b"{}"),
            properties: properties
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            message_id: "1".to_string(),
            topic: "requests".to_string(),
        }
    }

    #[test]
    fn correlation_properties_are_read() {
        let msg = inbound(&[("request_id", "r1"), ("response_topic", "replies")]);
        assert_eq!(msg.request_id(), Some("r1"));
        assert_eq!(msg.response_topic(), Some("replies"));
    }

    #[test]
    fn empty_properties_count_as_absent() {
        let msg = inbound(&[("request_id", ""), ("response_topic", "")]);
        assert!(msg.request_id().is_none());
        assert!(msg.response_topic().is_none());
        assert!(inbound(&[]).request_id().is_none());
    }

    #[test]
    fn outbound_builder() {
        let msg = OutboundMessage::new(b"{}".to_vec())
            .with_property(REQUEST_ID_PROPERTY, "r9")
            .with_event_timestamp(Some(42));
        assert_eq!(msg.request_id(), Some("r9"));
        assert_eq!(msg.event_timestamp, Some(42));
    }
}
