use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SoleConfig {
    pub app_name: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub org_domain: String,
    /// Extra tokens mixed into the identifier.
    #[serde(default)]
    pub app_data: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub secondary_notification: bool,
    #[serde(default)]
    pub exclude_app_version: bool,
    #[serde(default)]
    pub exclude_app_path: bool,
    #[serde(default = "defaults::allow_secondary")]
    pub allow_secondary: bool,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::inconsistency_timeout_ms")]
    pub inconsistency_timeout_ms: u64,
    #[serde(default = "defaults::max_message_len")]
    pub max_message_len: u64,
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

/// Whose processes compete for the primary role.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One primary per OS user.
    #[default]
    User,
    /// One primary for the whole machine.
    System,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn allow_secondary() -> bool {
        true
    }

    pub fn timeout_ms() -> u64 {
        1000
    }

    pub fn inconsistency_timeout_ms() -> u64 {
        5000
    }

    pub fn max_message_len() -> u64 {
        16 * 1024 * 1024
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl SoleConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let toml_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&toml_str)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Defaults for everything but the application name.
    pub fn for_app(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            org_name: String::new(),
            org_domain: String::new(),
            app_data: Vec::new(),
            version: None,
            scope: Scope::default(),
            secondary_notification: false,
            exclude_app_version: false,
            exclude_app_path: false,
            allow_secondary: defaults::allow_secondary(),
            timeout_ms: defaults::timeout_ms(),
            inconsistency_timeout_ms: defaults::inconsistency_timeout_ms(),
            max_message_len: defaults::max_message_len(),
            runtime_dir: None,
            log_level: defaults::log_level(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn inconsistency_timeout(&self) -> Duration {
        Duration::from_millis(self.inconsistency_timeout_ms)
    }

    /// Directory holding the block, lock and socket files.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
