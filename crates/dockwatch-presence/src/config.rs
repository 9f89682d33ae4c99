//! Configuration loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How often a transition is re-planned after losing a version race
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    /// Workspace bound to devices seen for the first time
    #[serde(default)]
    pub default_workspace_id: Option<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            default_workspace_id: None,
        }
    }
}

fn default_max_conflict_retries() -> u32 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Number of worker tasks; each owns a fixed share of serials
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue length per worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_depth() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("ingest.workers must be at least 1".to_string()));
        }
        if self.ingest.queue_depth == 0 {
            return Err(ConfigError::Invalid("ingest.queue_depth must be at least 1".to_string()));
        }
        if self
            .reconciler
            .default_workspace_id
            .as_deref()
            .is_some_and(|ws| ws.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "reconciler.default_workspace_id must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> anyhow::Result<()> {
    let config = Config {
        reconciler: ReconcilerConfig {
            default_workspace_id: Some("default".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.reconciler.max_conflict_retries, 8);
        assert_eq!(config.reconciler.default_workspace_id, None);
        assert_eq!(config.ingest.workers, 4);
        assert_eq!(config.ingest.queue_depth, 256);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dockwatch.toml");
        std::fs::write(
            &path,
            "[reconciler]\ndefault_workspace_id = \"ws-7\"\n\n[ingest]\nworkers = 2\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.reconciler.default_workspace_id.as_deref(), Some("ws-7"));
        assert_eq!(config.reconciler.max_conflict_retries, 8);
        assert_eq!(config.ingest.workers, 2);
        assert_eq!(config.ingest.queue_depth, 256);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dockwatch.toml");
        std::fs::write(&path, "[ingest]\nworkers = 0\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "[ingest\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_saved_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dockwatch.toml");
        save_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.reconciler.default_workspace_id.as_deref(), Some("default"));
    }
}
