//! Ingress configuration.
//!
//! Resolved once at startup and treated as immutable afterwards. Keys are
//! flat so the deployment's plain environment variables (`PORT`,
//! `BROKER_URL`, `EXCHANGE_NAME`, ...) map onto them directly.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::BrokerEndpoint;
use crate::supervisor::ReconnectConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "INGRESS_CONFIG";
/// Prefix for configuration environment variables (`INGRESS__BROKER_URL`).
pub const CONFIG_ENV_PREFIX: &str = "INGRESS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "INGRESS_LOG";

/// Environment variable for the listen port.
pub const PORT_ENV_VAR: &str = "PORT";
/// Environment variable for the broker URL.
pub const BROKER_URL_ENV_VAR: &str = "BROKER_URL";
/// Environment variable for the destination exchange.
pub const EXCHANGE_NAME_ENV_VAR: &str = "EXCHANGE_NAME";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
}

/// Ingress configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// AMQP URL of the broker. Required.
    pub broker_url: Option<String>,
    /// Exchange every event is published into. Required.
    pub exchange_name: Option<String>,
    /// Container name reported with metrics.
    pub container_name: String,
    /// Pod name; prefix of the per-process unique name reported with metrics.
    pub pod_name: String,
    /// Broker name for stats dimensions.
    pub broker_name: String,
    /// Broker namespace for stats dimensions.
    pub broker_namespace: String,
    /// First reconnect delay after a failed attempt.
    pub reconnect_min_delay_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            broker_url: None,
            exchange_name: None,
            container_name: "ingress".to_string(),
            pod_name: "rabbitmq-broker-ingress".to_string(),
            broker_name: String::new(),
            broker_namespace: String::new(),
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Plain environment variables (`PORT`, `BROKER_URL`, ...)
    ///
    /// Fails with [`ConfigError::Missing`] when the broker URL or exchange
    /// name is not set.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check required values are present and non-empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_endpoint().map(|_| ())
    }

    /// Broker URL and exchange as one immutable target.
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = required(&self.broker_url, BROKER_URL_ENV_VAR)?;
        let exchange = required(&self.exchange_name, EXCHANGE_NAME_ENV_VAR)?;
        Ok(BrokerEndpoint::new(url, exchange))
    }

    /// Reconnect pacing. A cap below the first delay is raised to it.
    pub fn reconnect(&self) -> ReconnectConfig {
        let min_delay = Duration::from_millis(self.reconnect_min_delay_ms);
        let max_delay = Duration::from_millis(self.reconnect_max_delay_ms).max(min_delay);
        ReconnectConfig {
            min_delay,
            max_delay,
            ..ReconnectConfig::default()
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

#[cfg(test)]
mod tests;
