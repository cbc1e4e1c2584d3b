//! Tool configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DURAFSM_CONFIG or --config)
//! 3. Environment variables

use durafsm_storage::{CoordinatorConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Record store configuration.
    pub storage: StorageSection,
    /// Coordinator configuration.
    pub coordinator: CoordinatorSection,
}

impl Config {
    /// Loads configuration from `path` (or DURAFSM_CONFIG when `path` is
    /// None), then applies environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("DURAFSM_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.storage.apply_overrides(&var);
        self.coordinator.apply_overrides(&var);
    }

    /// Checks values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "coordinator.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.storage.backend == Backend::File && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "file backend requires storage.data_dir".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which record store to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Process-local; nothing survives exit.
    Memory,
    /// One file per instance under `data_dir`.
    #[default]
    File,
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: Backend,
    /// Data directory for the file backend.
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(backend) = var("DURAFSM_BACKEND") {
            match backend.to_lowercase().as_str() {
                "memory" => self.backend = Backend::Memory,
                "file" => self.backend = Backend::File,
                other => tracing::warn!("Ignoring unknown DURAFSM_BACKEND '{}'", other),
            }
        }

        if let Some(dir) = var("DURAFSM_DATA") {
            self.data_dir = PathBuf::from(dir);
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// How long to wait for a held instance (0 = wait indefinitely).
    pub lock_timeout_ms: u64,
    /// Attempts per raise, including the first.
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            max_attempts: 1,
            retry_backoff_ms: 10,
        }
    }
}

impl CoordinatorSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = var("DURAFSM_LOCK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.lock_timeout_ms = ms;
        }

        if let Some(n) = var("DURAFSM_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_attempts = n;
        }

        if let Some(ms) = var("DURAFSM_RETRY_BACKOFF_MS").and_then(|v| v.parse().ok()) {
            self.retry_backoff_ms = ms;
        }
    }

    /// Returns the lock wait limit, if any.
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }
}

impl From<&CoordinatorSection> for CoordinatorConfig {
    fn from(section: &CoordinatorSection) -> Self {
        CoordinatorConfig {
            retry: RetryPolicy {
                max_attempts: section.max_attempts,
                backoff: Duration::from_millis(section.retry_backoff_ms),
            },
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.backend, Backend::File);
        assert_eq!(config.storage.data_dir, PathBuf::from("./data"));
        assert_eq!(config.coordinator.max_attempts, 1);
        assert_eq!(
            config.coordinator.lock_timeout(),
            Some(Duration::from_millis(5000))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("durafsm.yaml");
        std::fs::write(
            &path,
            "storage:\n  backend: memory\ncoordinator:\n  max_attempts: 3\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.coordinator.max_attempts, 3);
        // Unset fields keep defaults
        assert_eq!(config.coordinator.retry_backoff_ms, 10);
    }

    #[test]
    fn test_file_errors() {
        let dir = TempDir::new().unwrap();
        let missing = Config::from_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(..)));

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "storage:\n  backend: floppy\n").unwrap();
        let bad = Config::from_file(&path).unwrap_err();
        assert!(matches!(bad, ConfigError::ParseError(..)));
        assert!(bad.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("DURAFSM_BACKEND", "MEMORY"),
            ("DURAFSM_DATA", "/var/lib/durafsm"),
            ("DURAFSM_LOCK_TIMEOUT_MS", "0"),
            ("DURAFSM_MAX_ATTEMPTS", "4"),
            ("DURAFSM_RETRY_BACKOFF_MS", "not-a-number"),
        ]));

        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/durafsm"));
        assert_eq!(config.coordinator.lock_timeout(), None);
        assert_eq!(config.coordinator.max_attempts, 4);
        assert_eq!(config.coordinator.retry_backoff_ms, 10);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.coordinator.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_into_coordinator_config() {
        let section = CoordinatorSection {
            lock_timeout_ms: 100,
            max_attempts: 5,
            retry_backoff_ms: 25,
        };
        let config = CoordinatorConfig::from(&section);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff, Duration::from_millis(25));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.storage.backend, config.storage.backend);
        assert_eq!(parsed.coordinator.max_attempts, 1);
    }
}
