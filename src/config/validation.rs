//! Configuration validation using JSON Schema

use crate::config::ResilienceConfig;
use schemars::schema_for;
use serde_json::Value;
use std::path::Path;
use validator::Validate;

/// Validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Configuration validator
pub struct ConfigValidator {
    schema: Value,
}

impl ConfigValidator {
    /// Create a new validator with the generated schema
    pub fn new() -> Self {
        let schema = schema_for!(ResilienceConfig);
        Self {
            schema: serde_json::to_value(&schema).unwrap_or_default(),
        }
    }

    /// Get the JSON Schema for the configuration
    pub fn get_schema(&self) -> &Value {
        &self.schema
    }

    /// Export the schema to a JSON string
    pub fn export_schema(&self) -> String {
        serde_json::to_string_pretty(&self.schema).unwrap_or_default()
    }

    /// Validate a configuration file
    pub async fn validate_file(&self, path: &str) -> Result<(), Vec<ValidationError>> {
        let expanded = shellexpand::tilde(path).to_string();
        let path = Path::new(&expanded);

        if !path.exists() {
            return Err(vec![ValidationError {
                path: path.to_string_lossy().to_string(),
                message: "Configuration file does not exist".to_string(),
            }]);
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            vec![ValidationError {
                path: path.to_string_lossy().to_string(),
                message: format!("Failed to read file: {}", e),
            }]
        })?;

        self.validate_toml(&content)
    }

    /// Validate TOML content
    pub fn validate_toml(&self, content: &str) -> Result<(), Vec<ValidationError>> {
        let config: ResilienceConfig = toml::from_str(content).map_err(|e| {
            vec![ValidationError {
                path: "root".to_string(),
                message: format!("TOML parse error: {}", e),
            }]
        })?;

        self.validate_config(&config)
    }

    /// Validate an already-parsed configuration
    pub fn validate_config(&self, config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(validation_errors) = config.validate() {
            collect_errors("", &validation_errors, &mut errors);
        }

        self.validate_breaker_patterns(config, &mut errors);
        self.validate_pool_timings(config, &mut errors);
        self.validate_logging(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_breaker_patterns(&self, config: &ResilienceConfig, errors: &mut Vec<ValidationError>) {
        for (idx, pattern) in config.circuit_breaker.expected_error_patterns.iter().enumerate() {
            if pattern.trim().is_empty() {
                errors.push(ValidationError {
                    path: format!("circuit_breaker.expected_error_patterns[{}]", idx),
                    message: "Expected error pattern cannot be empty".to_string(),
                });
            }
        }
    }

    fn validate_pool_timings(&self, config: &ResilienceConfig, errors: &mut Vec<ValidationError>) {
        let pool = &config.pool;
        if pool.idle_timeout_ms < pool.connection_timeout_ms {
            errors.push(ValidationError {
                path: "pool.idle_timeout_ms".to_string(),
                message: "Idle timeout must not be shorter than the connection timeout".to_string(),
            });
        }
    }

    fn validate_logging(&self, config: &ResilienceConfig, errors: &mut Vec<ValidationError>) {
        if tracing_subscriber::EnvFilter::try_new(&config.logging.level).is_err() {
            errors.push(ValidationError {
                path: "logging.level".to_string(),
                message: format!("Invalid log filter: {}", config.logging.level),
            });
        }
    }
}

fn collect_errors(prefix: &str, errors: &validator::ValidationErrors, out: &mut Vec<ValidationError>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            validator::ValidationErrorsKind::Field(field_errors) => {
                for e in field_errors {
                    out.push(ValidationError {
                        path: path.clone(),
                        message: e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("failed '{}' check", e.code)),
                    });
                }
            }
            validator::ValidationErrorsKind::Struct(nested) => collect_errors(&path, nested, out),
            validator::ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    collect_errors(&format!("{}[{}]", path, idx), nested, out);
                }
            }
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
