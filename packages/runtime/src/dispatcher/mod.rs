//! The dispatcher: consume loop, admission, shutdown and teardown.
//!
//! A [`Dispatcher`] owns the broker connection and consumer, receives
//! messages with a bounded timeout, and spawns one tracked task per message
//! (see `request.rs`). At most `max_concurrent_requests` tasks are inside the
//! handler section at once; the rest wait on the admission gate.
//!
//! Lifecycle: `connect()` validates and subscribes, `start()` runs the loop
//! until shutdown, then drains tracked tasks and calls `close()`.

mod request;
mod response;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fstream_core::{FunctionContext, Handler, HandlerRegistry, JsonObject};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError, Consumer, InboundMessage};
use crate::config::FunctionConfig;
use crate::error::RuntimeError;
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::metrics::Metrics;
use crate::metrics_server::MetricsServer;
use crate::producer_cache::ProducerCache;
use crate::task_registry::TaskRegistry;

/// Grace period for aborted tasks to unwind after the drain window.
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// Bridges subscribed topics to one handler in request/response fashion.
pub struct Dispatcher {
    config: FunctionConfig,
    topics: Vec<String>,
    module: Arc<str>,
    settings: Arc<JsonObject>,
    handler: Arc<dyn Handler>,
    client: Arc<dyn BrokerClient>,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
    producers: ProducerCache,
    gate: Semaphore,
    tasks: TaskRegistry,
    metrics: Arc<Metrics>,
    lifecycle: LifecycleController,
    metrics_server: MetricsServer,
    started: AtomicBool,
    closing: AtomicBool,
}

impl Dispatcher {
    /// Validates the configuration, initializes the handler and subscribes.
    ///
    /// Every configuration problem is reported before the broker is touched.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Config`] if the configuration is invalid
    /// - [`RuntimeError::HandlerNotFound`] if no handler is registered for
    ///   the configured module
    /// - [`RuntimeError::HandlerInit`] if the handler's `init` hook fails
    /// - [`RuntimeError::Broker`] if the subscription cannot be created
    pub async fn connect(
        config: FunctionConfig,
        handlers: &HandlerRegistry,
        client: Arc<dyn BrokerClient>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let topics = config.validate()?;
        let handler = handlers
            .get(&config.module)
            .ok_or_else(|| RuntimeError::HandlerNotFound {
                module: config.module.clone(),
            })?;

        let module: Arc<str> = Arc::from(config.module.as_str());
        let settings = Arc::new(config.config.clone());
        handler
            .init(&FunctionContext::new(Arc::clone(&module), Arc::clone(&settings)))
            .map_err(RuntimeError::HandlerInit)?;

        let consumer = client
            .subscribe(&topics, &config.subscription_name)
            .await?;
        info!(
            module = %module,
            topics = ?topics,
            subscription = %config.subscription_name,
            "subscribed"
        );

        let metrics = Arc::new(Metrics::new());
        let lifecycle = LifecycleController::new();
        let metrics_server = MetricsServer::new(
            &config.runtime,
            config.metric.port,
            Arc::clone(&metrics),
            lifecycle.state_handle(),
        );

        Ok(Arc::new(Self {
            producers: ProducerCache::new(
                Arc::clone(&client),
                config.runtime.max_producer_cache_size,
            ),
            gate: Semaphore::new(config.pulsar.max_concurrent_requests.max(1)),
            topics,
            module,
            settings,
            handler,
            client,
            consumer: Mutex::new(Some(consumer)),
            tasks: TaskRegistry::new(),
            metrics,
            lifecycle,
            metrics_server,
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            config,
        }))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &FunctionConfig {
        &self.config
    }

    /// Resolved source topics.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// A context bound to no message, as passed to the `init` hook.
    #[must_use]
    pub fn context(&self) -> FunctionContext {
        FunctionContext::new(Arc::clone(&self.module), Arc::clone(&self.settings))
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Bound address of the metrics endpoint while running.
    #[must_use]
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_server.local_addr()
    }

    fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Runs the consume loop until shutdown, then drains and closes.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyStarted`] on a second call and
    /// [`RuntimeError::MetricsServer`] if the metrics endpoint cannot bind
    /// (resources are closed before returning).
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }
        if let Err(e) = self.metrics_server.start().await {
            self.close().await;
            return Err(RuntimeError::MetricsServer(e));
        }

        self.lifecycle.set_running();
        info!(module = %self.module, "dispatcher running");

        self.consume_loop().await;
        self.drain().await;
        self.close().await;
        Ok(())
    }

    /// Runs [`start`](Self::start) and requests shutdown when `signal`
    /// resolves, e.g. `tokio::signal::ctrl_c()`.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn run<S>(self: &Arc<Self>, signal: S) -> Result<(), RuntimeError>
    where
        S: Future<Output = ()>,
    {
        let start = self.start();
        tokio::pin!(start);

        tokio::select! {
            result = &mut start => return result,
            () = signal => {
                info!("shutdown signal received");
                self.shutdown();
            }
        }
        start.await
    }

    /// Requests shutdown. The consume loop stops receiving and `start`
    /// drains and closes.
    pub fn shutdown(&self) {
        if self.lifecycle.trigger_shutdown() {
            info!("shutdown requested");
        }
    }

    async fn consume_loop(self: &Arc<Self>) {
        let Some(consumer) = self.consumer() else {
            warn!("consumer already closed; not receiving");
            return;
        };
        let receive_timeout = self.config.runtime.receive_timeout();
        let backoff = self.config.runtime.receive_error_backoff();

        loop {
            if self.lifecycle.is_shutting_down() {
                break;
            }

            let received = tokio::select! {
                result = consumer.receive(receive_timeout) => result,
                () = self.lifecycle.shutdown_requested() => break,
            };

            match received {
                Ok(message) => self.spawn_request(message),
                Err(BrokerError::Timeout) => {}
                Err(BrokerError::Cancelled) => {
                    info!("receive cancelled; shutting down");
                    self.lifecycle.trigger_shutdown();
                    break;
                }
                Err(e) => {
                    if self.lifecycle.is_shutting_down() {
                        break;
                    }
                    warn!(error = %e, backoff = ?backoff, "receive failed; retrying");
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = self.lifecycle.shutdown_requested() => break,
                    }
                }
            }
        }
        debug!("consume loop exited");
    }

    fn spawn_request(self: &Arc<Self>, message: InboundMessage) {
        let dispatcher = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = dispatcher.handle_message(message).await {
                tracing::error!(error = %e, "request failed");
            }
        });
    }

    /// Waits for tracked tasks, aborting stragglers if configured to.
    async fn drain(&self) {
        // Waiters on the gate wake up and abandon their message.
        self.gate.close();

        let window = self.config.runtime.drain_timeout();
        let pending = self.tasks.len();
        if pending > 0 {
            info!(pending, window = ?window, "draining in-flight requests");
        }
        if self.tasks.wait_for_drain(window).await {
            return;
        }

        let remaining = self.tasks.len();
        if self.config.runtime.cancel_on_drain_timeout {
            let aborted = self.tasks.abort_all();
            warn!(remaining, aborted, "drain window expired; aborting requests");
            self.tasks.wait_for_drain(ABORT_GRACE).await;
        } else {
            warn!(remaining, "drain window expired; closing with requests in flight");
        }
    }

    /// Releases the metrics endpoint, consumer, producers and client.
    ///
    /// Each step is independent; failures are logged and the next step still
    /// runs. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("close already performed");
            return;
        }
        self.lifecycle.trigger_shutdown();
        self.gate.close();

        self.metrics_server.stop().await;

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            match consumer.close().await {
                Ok(()) | Err(BrokerError::AlreadyClosed) => {}
                Err(e) => warn!(error = %e, "failed to close consumer"),
            }
        }

        self.producers.clear().await;

        match self.client.close().await {
            Ok(()) | Err(BrokerError::AlreadyClosed) => {}
            Err(e) => warn!(error = %e, "failed to close broker client"),
        }

        self.lifecycle.set_closed();
        info!("dispatcher closed");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("module", &self.module)
            .field("topics", &self.topics)
            .field("state", &self.lifecycle.state())
            .field("in_flight", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
