//! Broker configuration section
//!
//! Services embed [`BrokerSection`] in their own configuration files; the
//! section can also be loaded standalone from a TOML file containing a
//! `[broker]` table.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Broker connection settings for one manager instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker endpoint with protocol and port (amqp:// or amqps://)
    pub url: String,
    /// Maximum connect attempts before giving up (0 = retry forever)
    #[serde(default)]
    pub max_retries: u32,
    /// First retry delay in milliseconds; doubles on each failed attempt
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    /// Upper bound on the retry delay in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Heartbeat interval in seconds, appended to the connection URL
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Timeout for a single connect attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whether publish/consume calls wait out an in-flight (re)connect
    /// instead of failing fast
    #[serde(default = "default_block_on_disconnect")]
    pub block_on_disconnect: bool,
}

fn default_initial_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30000
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    10000
}

fn default_block_on_disconnect() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Wrapper for loading a standalone `[broker]` table
#[derive(Debug, Deserialize)]
struct BrokerFile {
    broker: BrokerSection,
}

impl BrokerSection {
    /// Create a section for the given endpoint with default retry settings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_retries: 0,
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            block_on_disconnect: default_block_on_disconnect(),
        }
    }

    /// Load a `[broker]` table from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: BrokerFile = toml::from_str(&content)?;
        file.broker.validate()?;
        Ok(file.broker)
    }

    /// Validate endpoint and retry settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parse_url()?;
        if self.initial_retry_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "initial_retry_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.initial_retry_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "max_retry_delay_ms ({}) must not be below initial_retry_delay_ms ({})",
                self.max_retry_delay_ms, self.initial_retry_delay_ms
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection URL with the heartbeat interval appended as a query
    /// parameter, the form the AMQP client understands
    pub fn amqp_url(&self) -> Result<String, ConfigError> {
        let mut url = self.parse_url()?;
        let has_heartbeat = url.query_pairs().any(|(k, _)| k == "heartbeat");
        if !has_heartbeat {
            url.query_pairs_mut()
                .append_pair("heartbeat", &self.heartbeat_secs.to_string());
        }
        Ok(url.into())
    }

    /// Per-attempt connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// First retry delay
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Retry delay cap
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    fn parse_url(&self) -> Result<Url, ConfigError> {
        let url =
            Url::parse(&self.url).map_err(|_| ConfigError::InvalidBrokerUrl(self.url.clone()))?;
        match url.scheme() {
            "amqp" | "amqps" => Ok(url),
            other => Err(ConfigError::InvalidBrokerUrl(format!(
                "unsupported scheme '{other}' in {}",
                self.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let section: BrokerSection = toml::from_str(r#"url = "amqp://localhost:5672""#).unwrap();

        assert_eq!(section.max_retries, 0); // retry forever by default
        assert_eq!(section.initial_retry_delay_ms, 1000);
        assert_eq!(section.max_retry_delay_ms, 30000);
        assert_eq!(section.heartbeat_secs, 60);
        assert!(section.block_on_disconnect);
    }

    #[test]
    fn test_broker_table_parses() {
        let toml_content = r#"
[broker]
url = "amqp://rabbitmq-srv:5672"
max_retries = 5
initial_retry_delay_ms = 500
"#;
        let file: BrokerFile = toml::from_str(toml_content).unwrap();
        assert_eq!(file.broker.url, "amqp://rabbitmq-srv:5672");
        assert_eq!(file.broker.max_retries, 5);
        assert_eq!(file.broker.initial_retry_delay_ms, 500);
        assert_eq!(file.broker.max_retry_delay_ms, 30000);
    }

    #[test]
    fn test_heartbeat_appended_to_url() {
        let section = BrokerSection::new("amqp://localhost:5672");
        let url = section.amqp_url().unwrap();
        assert_eq!(url, "amqp://localhost:5672?heartbeat=60");
    }

    #[test]
    fn test_existing_heartbeat_preserved() {
        let section = BrokerSection::new("amqp://localhost:5672/?heartbeat=15");
        let url = section.amqp_url().unwrap();
        assert!(url.contains("heartbeat=15"));
        assert!(!url.contains("heartbeat=60"));
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let section = BrokerSection::new("mqtt://localhost:1883");
        assert!(matches!(
            section.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_unparseable_url_rejected() {
        let section = BrokerSection::new("not a url");
        assert!(matches!(
            section.amqp_url(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_zero_initial_delay_rejected() {
        let mut section = BrokerSection::new("amqp://localhost:5672");
        section.initial_retry_delay_ms = 0;
        assert!(matches!(
            section.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_delay_cap_below_initial_rejected() {
        let mut section = BrokerSection::new("amqp://localhost:5672");
        section.initial_retry_delay_ms = 5000;
        section.max_retry_delay_ms = 1000;
        assert!(matches!(
            section.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}
