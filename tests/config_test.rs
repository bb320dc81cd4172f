//! Configuration loading and validation tests

use bulwark::config::{ConfigLoader, ConfigValidator, LogFormat, ResilienceConfig};
use bulwark::core::{CircuitBreakerRegistry, ConnectionPoolManager};
use bulwark::realtime::{InMemoryTransport, SubscriptionManager};
use figment::Jail;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_load_toml_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bulwark.toml");

    let config_content = r#"
[circuit_breaker]
failure_threshold = 3
recovery_timeout_ms = 15000
expected_error_patterns = ["not found"]

[pool]
max_connections = 4
max_queue_size = 8
retry_attempts = 2

[realtime]
max_subscriptions = 25
batching_enabled = false

[logging]
level = "bulwark=debug"
format = "json"
"#;
    fs::write(&config_path, config_content).await.unwrap();

    let config = ConfigLoader::new()
        .without_env()
        .with_file(config_path.to_string_lossy())
        .load()
        .unwrap();

    assert_eq!(config.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.circuit_breaker.expected_error_patterns, vec!["not found".to_string()]);
    assert_eq!(config.pool.max_connections, 4);
    assert_eq!(config.pool.connection_timeout_ms, 30_000);
    assert_eq!(config.realtime.max_subscriptions, 25);
    assert!(!config.realtime.batching_enabled);
    assert_eq!(config.logging.format, LogFormat::Json);

    let breaker = config.circuit_breaker.breaker_config();
    assert_eq!(breaker.recovery_timeout, Duration::from_secs(15));
    let pool = config.pool.pool_config();
    assert_eq!(pool.retry_policy().max_attempts, 2);
}

#[tokio::test]
async fn test_load_json_and_yaml() {
    let temp_dir = TempDir::new().unwrap();

    let json_path = temp_dir.path().join("bulwark.json");
    fs::write(&json_path, r#"{"pool": {"max_connections": 6}}"#).await.unwrap();
    let config = ConfigLoader::new()
        .without_env()
        .with_file(json_path.to_string_lossy())
        .load()
        .unwrap();
    assert_eq!(config.pool.max_connections, 6);

    let yaml_path = temp_dir.path().join("bulwark.yaml");
    fs::write(&yaml_path, "realtime:\n  max_subscriptions: 7\n").await.unwrap();
    let config = ConfigLoader::new()
        .without_env()
        .with_file(yaml_path.to_string_lossy())
        .load()
        .unwrap();
    assert_eq!(config.realtime.max_subscriptions, 7);
}

#[tokio::test]
async fn test_out_of_range_value_rejected_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bulwark.toml");
    fs::write(&config_path, "[pool]\nmax_connections = 0\n").await.unwrap();

    let err = ConfigLoader::new()
        .without_env()
        .with_file(config_path.to_string_lossy())
        .load()
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFIG_ERROR");
}

#[test]
fn test_env_overrides_file() {
    Jail::expect_with(|jail| {
        jail.create_file("bulwark.toml", "[pool]\nmax_connections = 4\n")?;
        jail.set_env("BULWARK_POOL__MAX_CONNECTIONS", "12");
        jail.set_env("BULWARK_CIRCUIT_BREAKER__FAILURE_THRESHOLD", "9");

        let config = ConfigLoader::new()
            .with_file("bulwark.toml")
            .load()
            .map_err(|e| e.to_string())?;

        assert_eq!(config.pool.max_connections, 12);
        assert_eq!(config.circuit_breaker.failure_threshold, 9);
        Ok(())
    });
}

#[test]
fn test_custom_env_prefix() {
    Jail::expect_with(|jail| {
        jail.set_env("APP_REALTIME__MAX_SUBSCRIPTIONS", "3");

        let config = ConfigLoader::new()
            .with_env_prefix("APP_")
            .load()
            .map_err(|e| e.to_string())?;

        assert_eq!(config.realtime.max_subscriptions, 3);
        Ok(())
    });
}

#[tokio::test]
async fn test_validate_file_reports_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bulwark.toml");
    let content = r#"
[circuit_breaker]
failure_threshold = 0
expected_error_patterns = [""]

[pool]
idle_timeout_ms = 1000
connection_timeout_ms = 2000

[monitor]
high_error_rate = 1.5
"#;
    fs::write(&config_path, content).await.unwrap();

    let validator = ConfigValidator::new();
    let errors = validator
        .validate_file(&config_path.to_string_lossy())
        .await
        .unwrap_err();

    let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"circuit_breaker.failure_threshold"));
    assert!(paths.contains(&"circuit_breaker.expected_error_patterns[0]"));
    assert!(paths.contains(&"pool.idle_timeout_ms"));
    assert!(paths.contains(&"monitor.high_error_rate"));
}

#[tokio::test]
async fn test_validate_missing_file() {
    let validator = ConfigValidator::new();
    let errors = validator.validate_file("/nonexistent/bulwark.toml").await.unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("does not exist"));
}

#[test]
fn test_default_config_round_trips_through_validator() {
    let validator = ConfigValidator::new();
    let toml = toml::to_string(&ResilienceConfig::default()).unwrap();
    assert_ok!(validator.validate_toml(&toml));
    assert_err!(validator.validate_toml("[pool]\nmax_connections = \"ten\"\n"));
}

#[test]
fn test_schema_describes_sections() {
    let schema = ConfigValidator::new().get_schema().clone();
    let properties = &schema["properties"];
    for section in ["circuit_breaker", "pool", "realtime", "monitor", "logging"] {
        assert!(properties.get(section).is_some(), "missing section {}", section);
    }
}

#[tokio::test]
async fn test_components_build_from_settings() {
    let config = ResilienceConfig::default();

    let registry = assert_ok!(CircuitBreakerRegistry::from_settings(&config.circuit_breaker));
    assert!(registry.is_empty());

    let pool = assert_ok!(ConnectionPoolManager::new(config.pool.pool_config()));
    assert_eq!(pool.config().max_connections, 10);

    let manager = assert_ok!(SubscriptionManager::new(
        Arc::new(InMemoryTransport::new()),
        config.realtime.realtime_config(),
    ));
    assert_eq!(manager.config().max_subscriptions, 100);
}
