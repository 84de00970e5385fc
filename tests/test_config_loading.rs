//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and
//! error handling, not the implementation details of TOML parsing.

use eventline::{BrokerSection, ConfigError};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
url = "amqp://rabbitmq-srv:5672"
max_retries = 5
initial_retry_delay_ms = 500
max_retry_delay_ms = 10000
heartbeat_secs = 30
"#
    )
    .unwrap();

    let config = BrokerSection::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.url, "amqp://rabbitmq-srv:5672");
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.initial_retry_delay_ms, 500);
    assert_eq!(config.max_retry_delay_ms, 10000);
    assert_eq!(config.heartbeat_secs, 30);
    // Unset fields take their defaults
    assert_eq!(config.connect_timeout_ms, 10000);
    assert!(config.block_on_disconnect);
}

#[test]
fn test_config_with_only_url_uses_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
url = "amqps://broker.internal:5671"
"#
    )
    .unwrap();

    let config = BrokerSection::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.max_retries, 0); // retry forever
    assert_eq!(config.initial_retry_delay_ms, 1000);
    assert_eq!(config.max_retry_delay_ms, 30000);
    assert_eq!(config.heartbeat_secs, 60);
}

#[test]
fn test_missing_url_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
max_retries = 3
"#
    )
    .unwrap();

    let result = BrokerSection::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "this is not [valid toml").unwrap();

    let result = BrokerSection::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_settings_rejected_at_load_time() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
url = "amqp://localhost:5672"
initial_retry_delay_ms = 5000
max_retry_delay_ms = 100
"#
    )
    .unwrap();

    let result = BrokerSection::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_wrong_scheme_rejected_at_load_time() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
url = "mqtt://localhost:1883"
"#
    )
    .unwrap();

    let result = BrokerSection::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = BrokerSection::load_from_file(std::path::Path::new("/nonexistent/broker.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}
