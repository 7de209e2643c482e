//! Configuration loading for CreditLens.
//! Reads creditlens.toml from the current directory or path in CREDITLENS_CONFIG env var.

use std::path::Path;
use std::time::Duration;

use creditlens_llm::Credentials;
use creditlens_pool::{ModelConfig, PoolConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub backends: BackendSection,
    #[serde(default)]
    pub models: Vec<PreloadModel>,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_stats_interval() -> u64 { 60 }

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_idle_sweep_interval")]
    pub idle_sweep_interval_secs: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_degraded_latency")]
    pub degraded_latency_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_construction_timeout")]
    pub construction_timeout_secs: u64,
}

fn default_max_connections()      -> usize { 10 }
fn default_health_check_interval() -> u64  { 30 }
fn default_idle_threshold()       -> u64   { 600 }
fn default_idle_sweep_interval()  -> u64   { 120 }
fn default_error_threshold()      -> u32   { 3 }
fn default_degraded_latency()     -> u64   { 2_000 }
fn default_probe_timeout()        -> u64   { 5_000 }
fn default_construction_timeout() -> u64   { 30 }

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            health_check_interval_secs: default_health_check_interval(),
            idle_threshold_secs: default_idle_threshold(),
            idle_sweep_interval_secs: default_idle_sweep_interval(),
            error_threshold: default_error_threshold(),
            degraded_latency_ms: default_degraded_latency(),
            probe_timeout_ms: default_probe_timeout(),
            construction_timeout_secs: default_construction_timeout(),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            idle_threshold: Duration::from_secs(self.idle_threshold_secs),
            idle_sweep_interval: Duration::from_secs(self.idle_sweep_interval_secs),
            error_threshold: self.error_threshold,
            degraded_latency: Duration::from_millis(self.degraded_latency_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            construction_timeout: Duration::from_secs(self.construction_timeout_secs),
            ..PoolConfig::default()
        }
    }
}

/// API keys. Any key left out falls back to its environment variable.
#[derive(Debug, Default, Deserialize)]
pub struct BackendSection {
    pub gemini_api_key: Option<SecretString>,
    pub vision_api_key: Option<SecretString>,
    pub compat_api_key: Option<SecretString>,
}

impl BackendSection {
    pub fn credentials(&self) -> Credentials {
        let env = Credentials::from_env();
        Credentials {
            gemini_api_key: configured(&self.gemini_api_key).or(env.gemini_api_key),
            vision_api_key: configured(&self.vision_api_key).or(env.vision_api_key),
            compat_api_key: configured(&self.compat_api_key).or(env.compat_api_key),
        }
    }
}

fn configured(key: &Option<SecretString>) -> Option<SecretString> {
    key.as_ref()
        .map(|k| k.expose_secret().trim())
        .filter(|k| !k.is_empty())
        .map(|k| SecretString::from(k.to_string()))
}

/// A model built once at startup so the first request finds it ready.
#[derive(Debug, Clone, Deserialize)]
pub struct PreloadModel {
    pub model_type: String,
    #[serde(default)]
    pub config: ModelConfig,
    #[serde(default = "default_preload_timeout")]
    pub timeout_secs: u64,
}

fn default_preload_timeout() -> u64 { 30 }

impl PreloadModel {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load config from the standard location.
    /// Checks CREDITLENS_CONFIG env var first, then current directory.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CREDITLENS_CONFIG")
            .unwrap_or_else(|_| "creditlens.toml".to_string());

        if !Path::new(&path).exists() {
            anyhow::bail!(
                "Config file not found: {}\n\
                 Copy creditlens.example.toml to creditlens.toml and edit it.",
                path
            );
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.pool.to_pool_config().validate()?;
        if config.stats_interval_secs == 0 {
            anyhow::bail!("stats_interval_secs must be greater than zero");
        }
        Ok(config)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
