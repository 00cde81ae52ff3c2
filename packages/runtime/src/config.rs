//! Function configuration, loaded from YAML.
//!
//! Keys mirror the function-stream deployment descriptor (`pulsar`,
//! `module`, `sources`, `requestSource`, `sink`, `subscriptionName`,
//! `metric`, `config`), plus a `runtime` section for dispatcher tuning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fstream_core::JsonObject;
use serde::Deserialize;
use serde_json::Value;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "FS_CONFIG_PATH";
/// Configuration file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Errors from loading or validating a [`FunctionConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no module specified in config")]
    MissingModule,
    #[error("subscriptionName is not set in config")]
    MissingSubscription,
    #[error("no valid sources or request sources found in config")]
    NoSourceTopics,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Broker connection settings (`pulsar:` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Service URL, e.g. `pulsar://localhost:6650`.
    #[serde(rename = "serviceUrl")]
    pub service_url: String,
    /// Authentication plugin name, passed through to the broker client.
    #[serde(rename = "authPlugin")]
    pub auth_plugin: String,
    /// Authentication parameters, passed through to the broker client.
    #[serde(rename = "authParams")]
    pub auth_params: String,
    /// Size of the admission gate.
    pub max_concurrent_requests: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            service_url: "pulsar://localhost:6650".to_string(),
            auth_plugin: String::new(),
            auth_params: String::new(),
            max_concurrent_requests: 10,
        }
    }
}

/// A single topic reference.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicConfig {
    pub topic: String,
}

/// Source or sink descriptor. Only broker-backed endpoints exist today.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointSpec {
    #[serde(default)]
    pub pulsar: Option<TopicConfig>,
}

impl EndpointSpec {
    /// Builds a descriptor pointing at `topic`.
    #[must_use]
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            pulsar: Some(TopicConfig {
                topic: topic.into(),
            }),
        }
    }

    /// The concrete topic name, if one is configured and non-empty.
    #[must_use]
    pub fn topic_name(&self) -> Option<&str> {
        self.pulsar
            .as_ref()
            .map(|p| p.topic.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Metrics endpoint settings (`metric:` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub port: u16,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self { port: 9099 }
    }
}

/// Dispatcher tuning (`runtime:` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bounded timeout of each broker receive.
    pub receive_timeout_ms: u64,
    /// Sleep after a receive error other than a timeout.
    pub receive_error_backoff_ms: u64,
    /// Producer Cache capacity.
    pub max_producer_cache_size: usize,
    /// Best-effort window for in-flight tasks at shutdown.
    pub drain_timeout_ms: u64,
    /// Abort tasks still running when the drain window expires.
    pub cancel_on_drain_timeout: bool,
    /// Bind host of the metrics endpoint.
    pub metrics_host: String,
    /// Per-request deadline of the metrics endpoint.
    pub metrics_request_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 1000,
            receive_error_backoff_ms: 1000,
            max_producer_cache_size: 100,
            drain_timeout_ms: 5000,
            cancel_on_drain_timeout: true,
            metrics_host: "127.0.0.1".to_string(),
            metrics_request_timeout_ms: 10_000,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    #[must_use]
    pub fn receive_error_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_error_backoff_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub fn metrics_request_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// FunctionConfig
// ---------------------------------------------------------------------------

/// Complete configuration snapshot of one function.
///
/// Immutable once handed to the dispatcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pulsar: BrokerConfig,
    /// Name of the active handler.
    pub module: String,
    pub sources: Vec<EndpointSpec>,
    /// Dedicated topic for request/response traffic.
    #[serde(rename = "requestSource")]
    pub request_source: Option<EndpointSpec>,
    /// Default response destination.
    pub sink: Option<EndpointSpec>,
    #[serde(rename = "subscriptionName")]
    pub subscription_name: String,
    pub metric: MetricConfig,
    /// Free-form settings exposed to handlers.
    pub config: JsonObject,
    pub runtime: RuntimeConfig,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            pulsar: BrokerConfig::default(),
            module: "default".to_string(),
            sources: Vec::new(),
            request_source: None,
            sink: None,
            subscription_name: "function-stream-sdk-subscription".to_string(),
            metric: MetricConfig::default(),
            config: JsonObject::new(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl FunctionConfig {
    /// Parses a configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not valid YAML for this shape.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to `()`; treat it as all defaults.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is malformed.
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Loads the file named by `FS_CONFIG_PATH`, or `config.yaml`.
    ///
    /// # Errors
    ///
    /// Same as [`from_yaml`](Self::from_yaml).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_yaml(Self::path_from_env())
    }

    /// The configuration path selected by the environment.
    #[must_use]
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Looks up one entry of the free-form `config` section.
    #[must_use]
    pub fn get_config_value(&self, name: &str) -> Option<&Value> {
        self.config.get(name)
    }

    /// Topics the consumer subscribes to: every source, then the request source.
    #[must_use]
    pub fn source_topics(&self) -> Vec<String> {
        self.sources
            .iter()
            .chain(self.request_source.iter())
            .filter_map(EndpointSpec::topic_name)
            .map(str::to_string)
            .collect()
    }

    /// The configured sink topic, if any.
    #[must_use]
    pub fn sink_topic(&self) -> Option<&str> {
        self.sink.as_ref().and_then(EndpointSpec::topic_name)
    }

    /// Checks the invariants the dispatcher relies on and returns the
    /// resolved source topics.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.module.is_empty() {
            return Err(ConfigError::MissingModule);
        }
        if self.subscription_name.is_empty() {
            return Err(ConfigError::MissingSubscription);
        }
        let topics = self.source_topics();
        if topics.is_empty() {
            return Err(ConfigError::NoSourceTopics);
        }
        Ok(topics)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    const FULL: &str = r#"
name: string-function
description: appends an exclamation mark
pulsar:
  serviceUrl: pulsar://broker:6650
  authPlugin: org.apache.pulsar.client.impl.auth.AuthenticationToken
  authParams: token:abc
  max_concurrent_requests: 4
module: string
sources:
  - pulsar:
      topic: input-a
  - pulsar:
      topic: input-b
requestSource:
  pulsar:
    topic: string-topic
sink:
  pulsar:
    topic: output
subscriptionName: fs-sub
metric:
  port: 19099
config:
  test: Hello from config
  threshold: 3
runtime:
  drain_timeout_ms: 250
  metrics_request_timeout_ms: 1500
"#;

    #[test]
    fn parses_every_recognized_key() {
        let config = FunctionConfig::from_yaml_str(FULL).unwrap();
        assert_eq!(config.name.as_deref(), Some("string-function"));
        assert_eq!(config.pulsar.service_url, "pulsar://broker:6650");
        assert_eq!(config.pulsar.auth_params, "token:abc");
        assert_eq!(config.pulsar.max_concurrent_requests, 4);
        assert_eq!(config.module, "string");
        assert_eq!(config.subscription_name, "fs-sub");
        assert_eq!(config.metric.port, 19099);
        assert_eq!(config.sink_topic(), Some("output"));
        assert_eq!(
            config.get_config_value("test"),
            Some(&json!("Hello from config"))
        );
        assert_eq!(config.runtime.drain_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.runtime.metrics_request_timeout(),
            Duration::from_millis(1500)
        );
        // Unspecified runtime keys keep their defaults.
        assert_eq!(config.runtime.max_producer_cache_size, 100);
    }

    #[test]
    fn source_topics_put_request_source_last() {
        let config = FunctionConfig::from_yaml_str(FULL).unwrap();
        assert_eq!(
            config.validate().unwrap(),
            vec!["input-a", "input-b", "string-topic"]
        );
    }

    #[test]
    fn defaults_match_descriptor_defaults() {
        let config = FunctionConfig::from_yaml_str("module: string\n").unwrap();
        assert_eq!(config.pulsar.service_url, "pulsar://localhost:6650");
        assert_eq!(config.pulsar.max_concurrent_requests, 10);
        assert_eq!(config.subscription_name, "function-stream-sdk-subscription");
        assert_eq!(config.metric.port, 9099);
        assert!(config.sources.is_empty());
        assert!(config.sink.is_none());
        assert!(config.config.is_empty());
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config = FunctionConfig::from_yaml_str("").unwrap();
        assert_eq!(config.module, "default");
    }

    #[test]
    fn validate_rejects_empty_module() {
        let config = FunctionConfig {
            module: String::new(),
            request_source: Some(EndpointSpec::topic("requests")),
            ..FunctionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingModule)));
    }

    #[test]
    fn validate_rejects_empty_subscription() {
        let config = FunctionConfig {
            subscription_name: String::new(),
            request_source: Some(EndpointSpec::topic("requests")),
            ..FunctionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSubscription)
        ));
    }

    #[test]
    fn validate_rejects_missing_topics() {
        let config = FunctionConfig {
            sources: vec![EndpointSpec::default(), EndpointSpec::topic("")],
            ..FunctionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoSourceTopics)));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = FunctionConfig::from_yaml_str("pulsar: [not, a, map]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn from_yaml_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = FunctionConfig::from_yaml(file.path()).unwrap();
        assert_eq!(config.module, "string");
    }

    #[test]
    fn from_yaml_missing_file_is_read_error() {
        let err = FunctionConfig::from_yaml("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }
}
