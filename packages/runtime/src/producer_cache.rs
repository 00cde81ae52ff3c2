//! Bounded cache of per-topic producers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quick_cache::sync::Cache;
use tracing::{debug, warn};

use crate::broker::{BrokerClient, BrokerError, Producer};

/// LRU-bounded map from topic to a live producer.
///
/// Creation is single-flight per topic: concurrent callers for the same
/// topic wait on one `create_producer` call and share its result, so a topic
/// never has two live cached handles. Evicted producers are dropped without
/// an explicit close; in-flight sends keep their own `Arc`.
///
/// [`clear`](Self::clear) is terminal: afterwards every lookup fails with
/// [`BrokerError::AlreadyClosed`], so no producer outlives teardown.
pub struct ProducerCache {
    client: Arc<dyn BrokerClient>,
    producers: Cache<String, Arc<dyn Producer>>,
    closed: AtomicBool,
}

impl ProducerCache {
    #[must_use]
    pub fn new(client: Arc<dyn BrokerClient>, capacity: usize) -> Self {
        Self {
            client,
            producers: Cache::new(capacity.max(1)),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the cached producer for `topic`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the producer could not be created. Nothing
    /// is cached in that case, so the next call retries. Returns
    /// [`BrokerError::AlreadyClosed`] once the cache has been cleared.
    pub async fn get_or_create(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::AlreadyClosed);
        }
        let producer = self
            .producers
            .get_or_insert_async(topic, async {
                debug!(topic, "creating producer");
                self.client.create_producer(topic).await
            })
            .await?;

        // clear() ran while the producer was being created.
        if self.is_closed() {
            self.producers.remove(topic);
            close_producer(topic, producer.as_ref()).await;
            return Err(BrokerError::AlreadyClosed);
        }
        Ok(producer)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.producers.get(topic).is_some()
    }

    /// Closes and drops every cached producer and refuses new ones. Close
    /// failures are logged.
    pub async fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        let producers: Vec<(String, Arc<dyn Producer>)> = self.producers.iter().collect();
        self.producers.clear();

        for (topic, producer) in producers {
            close_producer(&topic, producer.as_ref()).await;
        }
    }
}

async fn close_producer(topic: &str, producer: &dyn Producer) {
    match producer.close().await {
        Ok(()) | Err(BrokerError::AlreadyClosed) => {}
        Err(e) => warn!(topic, error = %e, "failed to close producer"),
    }
}

impl std::fmt::Debug for ProducerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCache")
            .field("len", &self.producers.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
