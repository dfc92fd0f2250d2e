//! Pipeline and service configuration

use ccn_common::serde_helpers::{duration_millis, duration_secs};
use ccn_common::{TenantAccount, TenantError, TenantRegistry};
use ccn_credentials::CredentialConfig;
use ccn_isolation::IsolationConfig;
use ccn_resilience::ResilienceConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "CCN_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ccn/config.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Tenant(#[from] TenantError),
}

/// Poller and worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_url: String,
    pub dead_letter_queue_url: Option<String>,
    pub worker_count: usize,
    /// Bounded buffer between poller and workers
    pub buffer_size: usize,
    /// Messages requested per receive
    pub max_messages: u32,
    /// Long-poll wait per receive
    #[serde(with = "duration_secs")]
    pub wait_time: Duration,
    /// Pause between receives
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub visibility_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub metrics_interval: Duration,
    /// Dead-letter messages for tenants with blocking isolation failures
    pub enforce_isolation: bool,
    /// Name written into dead-letter envelopes
    pub processor_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            dead_letter_queue_url: None,
            worker_count: 4,
            buffer_size: 100,
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            poll_interval: Duration::from_millis(1000),
            visibility_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            enforce_isolation: true,
            processor_name: "ccn-pipeline".into(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        if self.max_messages == 0 {
            return Err(ConfigError::Invalid("max_messages must be at least 1".into()));
        }
        Ok(())
    }
}

/// Everything the worker binary needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Region for the control-plane clients
    pub region: Option<String>,
    pub pipeline: PipelineConfig,
    pub credentials: CredentialConfig,
    pub isolation: IsolationConfig,
    pub resilience: ResilienceConfig,
    /// Prometheus exporter listen address
    pub metrics_listen: Option<SocketAddr>,
    /// Inline tenant list
    pub tenants: Vec<TenantAccount>,
    /// Tenant list file, used when `tenants` is empty
    pub tenants_path: Option<PathBuf>,
}

impl ServiceConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Path from `CCN_CONFIG`, falling back to the default location
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Apply `CCN_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CCN_QUEUE_URL") {
            self.pipeline.queue_url = url;
        }
        if let Some(url) = lookup("CCN_DEAD_LETTER_QUEUE_URL") {
            self.pipeline.dead_letter_queue_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(count) = lookup("CCN_WORKER_COUNT") {
            self.pipeline.worker_count = count.parse().map_err(|_| ConfigError::InvalidOverride {
                key: "CCN_WORKER_COUNT",
                value: count.clone(),
            })?;
        }
        if let Some(region) = lookup("CCN_AWS_REGION") {
            self.region = Some(region);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.queue_url.is_empty() {
            return Err(ConfigError::Invalid("pipeline.queue_url is required".into()));
        }
        self.pipeline.validate()
    }

    /// Tenant registry from the inline list or `tenants_path`
    pub fn registry(&self) -> Result<TenantRegistry, ConfigError> {
        if !self.tenants.is_empty() {
            return Ok(TenantRegistry::new(self.tenants.clone())?);
        }
        match &self.tenants_path {
            Some(path) => Ok(TenantRegistry::from_file(path)?),
            None => Err(ConfigError::Invalid(
                "no tenants configured: set tenants or tenants_path".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccn_common::tenant::fixtures;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.pipeline.worker_count, 4);
        assert_eq!(config.pipeline.shutdown_timeout, Duration::from_secs(30));
        assert!(config.pipeline.enforce_isolation);
        assert_eq!(config.credentials.safety_margin, Duration::from_secs(300));
        assert_eq!(config.resilience.breaker.failure_threshold, 5);
        assert!(config.validate().is_err(), "queue url is required");
    }

    #[test]
    fn test_from_json_partial() {
        let config = ServiceConfig::from_json(
            r#"{
                "region": "eu-west-1",
                "pipeline": {
                    "queue_url": "https://sqs.eu-west-1.amazonaws.com/999999999999/changes",
                    "worker_count": 8,
                    "poll_interval": 250
                },
                "resilience": {"retry": {"max_attempts": 5}},
                "metrics_listen": "0.0.0.0:9100"
            }"#,
        )
        .unwrap();

        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.pipeline.worker_count, 8);
        assert_eq!(config.pipeline.poll_interval, Duration::from_millis(250));
        assert_eq!(config.pipeline.buffer_size, 100);
        assert_eq!(config.resilience.retry.max_attempts, 5);
        assert_eq!(config.resilience.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(config.metrics_listen.unwrap().port(), 9100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CCN_QUEUE_URL", "https://queue/primary"),
            ("CCN_DEAD_LETTER_QUEUE_URL", "https://queue/dlq"),
            ("CCN_WORKER_COUNT", "12"),
            ("CCN_AWS_REGION", "us-west-2"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.pipeline.queue_url, "https://queue/primary");
        assert_eq!(config.pipeline.dead_letter_queue_url.as_deref(), Some("https://queue/dlq"));
        assert_eq!(config.pipeline.worker_count, 12);
        assert_eq!(config.region.as_deref(), Some("us-west-2"));
    }

    #[test]
    fn test_invalid_worker_count_override() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_overrides(|key| (key == "CCN_WORKER_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { key: "CCN_WORKER_COUNT", .. }));
    }

    #[test]
    fn test_registry_sources() {
        let mut config = ServiceConfig::default();
        assert!(matches!(config.registry(), Err(ConfigError::Invalid(_))));

        config.tenants = vec![fixtures::tenant("acme", "111111111111")];
        assert_eq!(config.registry().unwrap().len(), 1);

        config.tenants.clear();
        config.tenants_path = Some(PathBuf::from("/nonexistent/ccn-tenants.json"));
        assert!(matches!(config.registry(), Err(ConfigError::Tenant(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ServiceConfig::default();
        config.pipeline.queue_url = "https://queue".into();
        config.pipeline.worker_count = 0;
        assert!(config.validate().is_err());
    }
}
