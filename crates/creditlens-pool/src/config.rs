//! Pool and per-model configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PoolError, Result};

/// Pool-wide limits and timer settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity ceiling: entries that are initializing, ready, busy or in error.
    pub max_connections: usize,

    /// Default probe interval for each entry's health monitor.
    pub health_check_interval: Duration,

    /// Ready entries unused for longer than this are reclaimed.
    pub idle_threshold: Duration,

    /// Period of the idle reclaimer sweep.
    pub idle_sweep_interval: Duration,

    /// Consecutive unhealthy probes before an entry is replaced.
    pub error_threshold: u32,

    /// Probes that succeed but take longer than this are classified degraded.
    pub degraded_latency: Duration,

    /// Upper bound on a single health probe.
    pub probe_timeout: Duration,

    /// Upper bound on factory create + initial probe.
    pub construction_timeout: Duration,

    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            health_check_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(600),
            idle_sweep_interval: Duration::from_secs(120),
            error_threshold: 3,
            degraded_latency: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            construction_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl PoolConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn with_degraded_latency(mut self, latency: Duration) -> Self {
        self.degraded_latency = latency;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_construction_timeout(mut self, timeout: Duration) -> Self {
        self.construction_timeout = timeout;
        self
    }

    /// Reject settings the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(PoolError::Config("max_connections must be greater than 0".into()));
        }
        if self.error_threshold == 0 {
            return Err(PoolError::Config("error_threshold must be greater than 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(PoolError::Config("event_capacity must be greater than 0".into()));
        }
        let timers = [
            ("health_check_interval", self.health_check_interval),
            ("idle_sweep_interval", self.idle_sweep_interval),
            ("probe_timeout", self.probe_timeout),
            ("construction_timeout", self.construction_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(PoolError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// Configuration snapshot for one model handle.
///
/// `timeout_ms` and `max_retries` are not interpreted by the pool; they are
/// handed to the factory as-is. Unknown keys land in `options`, so backend
/// specific settings (`provider`, `base_url`, ...) survive a round trip
/// through TOML or JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend model name, e.g. `gemini-1.5-flash`. Empty means backend default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Overrides [`PoolConfig::health_check_interval`] for entries built from this config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,

    #[serde(default, flatten)]
    pub options: Map<String, Value>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// String-valued backend option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = PoolConfig::default().with_max_connections(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = PoolConfig::default()
            .with_health_check_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("health_check_interval"));
    }

    #[test]
    fn test_zero_error_threshold_rejected() {
        assert!(PoolConfig::default().with_error_threshold(0).validate().is_err());
    }

    #[test]
    fn test_model_config_extra_keys_become_options() {
        let json = r#"{"model":"local-llama","timeout_ms":1500,"provider":"openai_compatible","base_url":"http://localhost:8000"}"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model, "local-llama");
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.option_str("provider"), Some("openai_compatible"));
        assert_eq!(config.option_str("base_url"), Some("http://localhost:8000"));
        assert_eq!(config.max_retries, None);
    }

    #[test]
    fn test_zero_health_interval_override_is_ignored() {
        let mut config = ModelConfig::new("gemini-1.5-flash");
        config.health_check_interval_ms = Some(0);
        assert_eq!(config.health_check_interval(), None);
    }
}
