//! In-process broker.
//!
//! Routes every published message to each subscription of its topic (one
//! delivery per subscription name), records publishes and acknowledgements
//! for inspection, and supports fault injection for sends and receives.
//! Cloning a `MemoryBroker` yields another handle to the same broker.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BrokerClient, BrokerError, Consumer, InboundMessage, OutboundMessage, Producer};

/// A message as recorded by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub message_id: String,
    pub topic: String,
    pub message: OutboundMessage,
}

impl PublishedMessage {
    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns the decode error if the payload is not JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.message.payload)
    }
}

/// Per-consumer delivery route registered under a topic.
#[derive(Debug)]
struct Route {
    consumer_id: u64,
    subscription: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Debug, Default)]
struct Inner {
    routes: DashMap<String, Vec<Route>>,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<String>>,
    failing_topics: DashMap<String, String>,
    receive_errors: Mutex<VecDeque<BrokerError>>,
    next_message_id: AtomicU64,
    next_consumer_id: AtomicU64,
    closed: AtomicBool,
    subscribe_calls: AtomicU64,
    producers_created: AtomicU64,
    producers_closed: AtomicU64,
    consumers_closed: AtomicU64,
    client_close_calls: AtomicU64,
}

/// Shared handle to an in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a message to `topic` as an external producer would.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AlreadyClosed`] once the broker is closed, or
    /// the injected failure for `topic`.
    pub fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String, BrokerError> {
        self.inner.publish(topic, message)
    }

    /// Convenience wrapper publishing a JSON body with string properties.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub fn publish_json(
        &self,
        topic: &str,
        body: &serde_json::Value,
        properties: &[(&str, &str)],
    ) -> Result<String, BrokerError> {
        let mut message = OutboundMessage::new(body.to_string().into_bytes());
        for (name, value) in properties {
            message = message.with_property(*name, *value);
        }
        self.publish(topic, message)
    }

    /// Publishes raw bytes with string properties.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub fn publish_raw(
        &self,
        topic: &str,
        payload: &'static [u8],
        properties: &[(&str, &str)],
    ) -> Result<String, BrokerError> {
        let mut message = OutboundMessage::new(Bytes::from_static(payload));
        for (name, value) in properties {
            message = message.with_property(*name, *value);
        }
        self.publish(topic, message)
    }

    /// Every message published to `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of acknowledgements received for `message_id`.
    #[must_use]
    pub fn ack_count(&self, message_id: &str) -> usize {
        self.inner
            .acked
            .lock()
            .iter()
            .filter(|id| id.as_str() == message_id)
            .count()
    }

    /// Total acknowledgements received.
    #[must_use]
    pub fn total_acks(&self) -> usize {
        self.inner.acked.lock().len()
    }

    /// Makes every send to `topic` fail with `reason`.
    pub fn fail_sends_to(&self, topic: &str, reason: &str) {
        self.inner
            .failing_topics
            .insert(topic.to_string(), reason.to_string());
    }

    /// Makes the next receive on any consumer return `error`.
    pub fn inject_receive_error(&self, error: BrokerError) {
        self.inner.receive_errors.lock().push_back(error);
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn producers_created(&self) -> u64 {
        self.inner.producers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn producers_closed(&self) -> u64 {
        self.inner.producers_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consumers_closed(&self) -> u64 {
        self.inner.consumers_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn client_close_calls(&self) -> u64 {
        self.inner.client_close_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        if let Some(reason) = self.failing_topics.get(topic) {
            return Err(BrokerError::Send {
                topic: topic.to_string(),
                reason: reason.value().clone(),
            });
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.published.lock().push(PublishedMessage {
            message_id: message_id.clone(),
            topic: topic.to_string(),
            message: message.clone(),
        });

        if let Some(routes) = self.routes.get(topic) {
            let mut delivered: HashSet<&str> = HashSet::new();
            for route in routes.iter() {
                if delivered.contains(route.subscription.as_str()) {
                    continue;
                }
                let inbound = InboundMessage {
                    payload: message.payload.clone(),
                    properties: message.properties.clone(),
                    message_id: message_id.clone(),
                    topic: topic.to_string(),
                };
                if route.tx.send(inbound).is_ok() {
                    delivered.insert(route.subscription.as_str());
                }
            }
        }
        Ok(message_id)
    }

    fn remove_consumer(&self, consumer_id: u64) {
        for mut entry in self.routes.iter_mut() {
            entry.value_mut().retain(|r| r.consumer_id != consumer_id);
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(
        &self,
        topics: &[String],
        subscription: &str,
    ) -> Result<Arc<dyn Consumer>, BrokerError> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(BrokerError::AlreadyClosed);
        }

        let consumer_id = self.inner.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        for topic in topics {
            self.inner.routes.entry(topic.clone()).or_default().push(Route {
                consumer_id,
                subscription: subscription.to_string(),
                tx: tx.clone(),
            });
        }

        Ok(Arc::new(MemoryConsumer {
            id: consumer_id,
            inner: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::AlreadyClosed);
        }
        self.inner.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryProducer {
            topic: topic.to_string(),
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.client_close_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        // Dropping every route closes all consumer channels.
        self.inner.routes.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryConsumer
// ---------------------------------------------------------------------------

struct MemoryConsumer {
    id: u64,
    inner: Arc<Inner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<InboundMessage, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        let injected = self.inner.receive_errors.lock().pop_front();
        if let Some(err) = injected {
            return Err(err);
        }

        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(BrokerError::AlreadyClosed),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        self.inner.acked.lock().push(message.message_id.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        self.inner.remove_consumer(self.id);
        self.inner.consumers_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryProducer
// ---------------------------------------------------------------------------

struct MemoryProducer {
    topic: String,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, message: OutboundMessage) -> Result<String, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        self.inner.publish(&self.topic, message)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }
        self.inner.producers_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    fn sorted_properties(properties: &std::collections::HashMap<String, String>) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_with_properties() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(&["requests".to_string()], "sub")
            .await
            .unwrap();

        broker
            .publish_json("requests", &json!({"text": "Hello"}), &[("request_id", "r1")])
            .unwrap();

        let msg = consumer.receive(WAIT).await.unwrap();
        assert_eq!(msg.topic, "requests");
        assert_eq!(msg.request_id(), Some("r1"));
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body, json!({"text": "Hello"}));
        assert_eq!(
            sorted_properties(&msg.properties),
            vec![("request_id".to_string(), "r1".to_string())]
        );
    }

    #[tokio::test]
    async fn multi_topic_consumer_receives_from_each_topic() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(&["a".to_string(), "b".to_string()], "sub")
            .await
            .unwrap();
        broker.publish_raw("a", b"{}", &[]).unwrap();
        broker.publish_raw("b", b"{}", &[]).unwrap();

        let first = consumer.receive(WAIT).await.unwrap();
        let second = consumer.receive(WAIT).await.unwrap();
        assert_eq!(first.topic, "a");
        assert_eq!(second.topic, "b");
    }

    #[tokio::test]
    async fn same_subscription_gets_one_delivery() {
        let broker = MemoryBroker::new();
        let topics = vec!["t".to_string()];
        let c1 = broker.subscribe(&topics, "shared").await.unwrap();
        let c2 = broker.subscribe(&topics, "shared").await.unwrap();
        broker.publish_raw("t", b"{}", &[]).unwrap();

        let got1 = c1.receive(Duration::from_millis(50)).await.is_ok();
        let got2 = c2.receive(Duration::from_millis(50)).await.is_ok();
        assert!(got1 ^ got2);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let broker = MemoryBroker::new();
        let consumer = broker.subscribe(&["t".to_string()], "s").await.unwrap();
        let err = consumer.receive(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, BrokerError::Timeout);
    }

    #[tokio::test]
    async fn injected_receive_error_is_returned_once() {
        let broker = MemoryBroker::new();
        let consumer = broker.subscribe(&["t".to_string()], "s").await.unwrap();
        broker.inject_receive_error(BrokerError::Transport("flaky".to_string()));

        assert_eq!(
            consumer.receive(WAIT).await.unwrap_err(),
            BrokerError::Transport("flaky".to_string())
        );
        broker.publish_raw("t", b"{}", &[]).unwrap();
        assert!(consumer.receive(WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn producer_send_is_recorded_and_can_fail() {
        let broker = MemoryBroker::new();
        let producer = broker.create_producer("replies").await.unwrap();
        let id = producer
            .send(OutboundMessage::new(b"{\"ok\":true}".to_vec()))
            .await
            .unwrap();

        let published = broker.published("replies");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, id);
        assert_eq!(published[0].json().unwrap(), json!({"ok": true}));

        broker.fail_sends_to("replies", "quota exceeded");
        let err = producer.send(OutboundMessage::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, BrokerError::Send { .. }));
    }

    #[tokio::test]
    async fn acknowledgements_are_counted() {
        let broker = MemoryBroker::new();
        let consumer = broker.subscribe(&["t".to_string()], "s").await.unwrap();
        broker.publish_raw("t", b"{}", &[]).unwrap();
        let msg = consumer.receive(WAIT).await.unwrap();

        consumer.acknowledge(&msg).await.unwrap();
        assert_eq!(broker.ack_count(&msg.message_id), 1);
        assert_eq!(broker.total_acks(), 1);
    }

    #[tokio::test]
    async fn second_close_reports_already_closed() {
        let broker = MemoryBroker::new();
        let consumer = broker.subscribe(&["t".to_string()], "s").await.unwrap();
        let producer = broker.create_producer("out").await.unwrap();

        assert!(consumer.close().await.is_ok());
        assert_eq!(consumer.close().await, Err(BrokerError::AlreadyClosed));
        assert!(producer.close().await.is_ok());
        assert_eq!(producer.close().await, Err(BrokerError::AlreadyClosed));
        assert!(broker.close().await.is_ok());
        assert_eq!(broker.close().await, Err(BrokerError::AlreadyClosed));

        assert_eq!(broker.consumers_closed(), 1);
        assert_eq!(broker.producers_closed(), 1);
        assert_eq!(broker.client_close_calls(), 2);
        assert!(broker.subscribe(&["t".to_string()], "s").await.is_err());
    }
}
