//! `function-stream` runtime: consumes broker topics, dispatches each message
//! to the configured handler and publishes correlated responses.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod metrics_server;
pub mod producer_cache;
pub mod task_registry;
pub mod telemetry;

pub use broker::{
    BrokerClient, BrokerError, Consumer, InboundMessage, MemoryBroker, OutboundMessage, Producer,
};
pub use config::{ConfigError, FunctionConfig};
pub use dispatcher::Dispatcher;
pub use error::{ProcessError, PublishError, RuntimeError};
pub use crate::metrics::{Metrics, MetricsSnapshot, RequestScope};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use telemetry::{init_tracing, LogFormat};
