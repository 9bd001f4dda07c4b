//! Configuration management for the termhub session core.
//!
//! This module provides TOML-based configuration file loading and saving,
//! plus the shared [`SettingsHandle`] through which the presentation layer
//! mutates settings at runtime. The default configuration path is
//! `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("ai.base_url must start with http:// or https://, got {0}")]
    InvalidBaseUrl(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termhub core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General host configuration.
    pub general: GeneralConfig,

    /// Shell session management configuration.
    pub session: SessionConfig,

    /// AI chat provider configuration.
    pub ai: AiConfig,
}

/// General host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory for storing host data (logs, state).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Shell session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell for new sessions. Empty means discover per platform.
    pub default_shell: String,

    /// Maximum number of concurrent shell sessions.
    pub max_sessions: usize,
}

/// AI chat provider configuration.
///
/// The chat manager reads the credential fields through a [`SettingsHandle`];
/// any mutation invalidates the bearer-token cache immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    /// Whether the AI chat channel is enabled at all.
    pub enabled: bool,

    /// Static API key. Used when no device-flow token is present.
    pub api_key: String,

    /// Device-flow token. Preferred over the static API key when set.
    pub device_token: String,

    /// Default model identifier used when a request does not name one.
    pub default_model: String,

    /// Organization / tenant identifier sent with chat requests.
    pub org_id: String,

    /// Base URL of the chat endpoint.
    pub base_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: String::new(),
            max_sessions: 16,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            device_token: String::new(),
            default_model: String::new(),
            org_id: String::new(),
            base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
        }
    }
}

/// Returns the default data directory (`~/.local/share/termhub`).
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
}

/// Returns the default configuration file path (`~/.config/termhub/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

impl Config {
    /// Loads the configuration from the default path, or returns defaults if
    /// the file does not exist.
    pub fn load_or_default() -> Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads the configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to the default path, creating parent
    /// directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&default_config_path())
    }

    /// Saves the configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        if self.session.max_sessions == 0 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if !self.session.default_shell.is_empty() {
            let shell = Path::new(&self.session.default_shell);
            if shell.is_absolute() && !shell.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        }

        if !self.ai.base_url.starts_with("http://") && !self.ai.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidBaseUrl(self.ai.base_url.clone()));
        }

        Ok(())
    }
}

/// Shared, mutation-aware view of the configuration.
///
/// Both session managers receive a clone of this handle at construction.
/// Every mutation bumps a generation counter; the chat manager additionally
/// invalidates its token cache synchronously when it applies an update.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<SettingsInner>,
}

#[derive(Debug)]
struct SettingsInner {
    config: RwLock<Config>,
    generation: AtomicU64,
}

impl SettingsHandle {
    /// Wraps a configuration in a shared handle.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(SettingsInner {
                config: RwLock::new(config),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a snapshot of the current configuration.
    pub fn snapshot(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Returns a snapshot of the AI section only.
    pub fn ai(&self) -> AiConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ai
            .clone()
    }

    /// Returns the current mutation generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Applies a mutation and bumps the generation counter.
    ///
    /// The counter is bumped after the write lock is released, so a reader
    /// that observes the new generation also observes the new values.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Config),
    {
        {
            let mut config = self.inner.config.write().unwrap_or_else(|e| e.into_inner());
            mutate(&mut config);
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.general.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_invalid_max_sessions_rejected() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 5000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxSessions(5000))
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let mut config = Config::default();
        config.ai.base_url = "ftp://example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_missing_shell_path_rejected() {
        let mut config = Config::default();
        config.session.default_shell = "/definitely/not/a/shell".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.session.max_sessions = 4;
        config.ai.enabled = true;
        config.ai.api_key = "key-123".to_string();
        config.ai.default_model = "glm-4-flash".to_string();

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[session]\nmax_sessions = 2\n").unwrap();
        assert_eq!(parsed.session.max_sessions, 2);
        assert_eq!(parsed.general.log_level, "info");
        assert!(!parsed.ai.enabled);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.ai.org_id = "org-42".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_settings_handle_update_bumps_generation() {
        let handle = SettingsHandle::new(Config::default());
        assert_eq!(handle.generation(), 0);

        handle.update(|config| {
            config.ai.api_key = "next".to_string();
        });

        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.ai().api_key, "next");
    }
}
