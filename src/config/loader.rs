use crate::config::ResilienceConfig;
use crate::utils::errors::{ResilienceError, ResilienceResult};
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use std::path::{Path, PathBuf};
use tracing::debug;
use validator::Validate;

/// Default prefix for environment overrides, e.g. `BULWARK_POOL__MAX_CONNECTIONS=20`
pub const DEFAULT_ENV_PREFIX: &str = "BULWARK_";

/// Supported config file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Detect format from file extension, falling back to TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ConfigFormat::Json,
            Some("yml") | Some("yaml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Layers defaults, an optional file and environment overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            env_prefix: Some(DEFAULT_ENV_PREFIX.to_string()),
        }
    }

    /// Read a configuration file; `~` is expanded
    pub fn with_file(mut self, path: impl AsRef<str>) -> Self {
        let expanded = shellexpand::tilde(path.as_ref()).to_string();
        self.path = Some(PathBuf::from(expanded));
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    pub fn without_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    pub fn figment(&self) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ResilienceConfig::default()));

        if let Some(path) = &self.path {
            let format = ConfigFormat::from_path(path);
            debug!("Loading config {} as {:?}", path.display(), format);
            figment = match format {
                ConfigFormat::Toml => figment.merge(Toml::file(path)),
                ConfigFormat::Json => figment.merge(Json::file(path)),
                ConfigFormat::Yaml => figment.merge(Yaml::file(path)),
            };
        }

        if let Some(prefix) = &self.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split("__"));
        }

        figment
    }

    pub fn load(&self) -> ResilienceResult<ResilienceConfig> {
        if let Some(path) = &self.path {
            if !path.exists() {
                return Err(ResilienceError::Config(format!(
                    "Configuration file does not exist: {}",
                    path.display()
                )));
            }
        }

        let config: ResilienceConfig = self.figment().extract()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
