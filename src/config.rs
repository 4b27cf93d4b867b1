//! Configuration of the `multihost` binary.
//!
//! Settings are merged from, in increasing priority:
//! - System configuration (/etc/multihost/multihost.toml)
//! - User configuration (~/.config/multihost/multihost.toml)
//! - Project configuration (./multihost.toml)
//! - Environment variables (`MULTIHOST_*`)
//!
//! Command line options override all of them.

use anyhow::{Context, Result};
use multihost::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Binary configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default inventory file
    pub inventory: Option<PathBuf>,

    /// Console logging
    pub logging: LoggingConfig,
}

/// Console logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Colored output
    pub color: bool,
    /// `tracing` filter directive, e.g. `multihost=debug`
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            color: true,
            filter: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Config::default();

        for path in Self::get_config_paths(config_path) {
            if path.exists() {
                config = config.merge(Self::from_file(&path)?);
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn get_config_paths(explicit_path: Option<&PathBuf>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.clone()];
        }

        let mut paths = vec![PathBuf::from("/etc/multihost/multihost.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("multihost").join("multihost.toml"));
        }
        paths.push(PathBuf::from("multihost.toml"));

        if let Ok(env_config) = std::env::var("MULTIHOST_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }

        paths
    }

    /// Load a single file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Values set in `other` take precedence.
    fn merge(self, other: Config) -> Config {
        Config {
            inventory: other.inventory.or(self.inventory),
            logging: LoggingConfig {
                format: other.logging.format,
                color: other.logging.color && self.logging.color,
                filter: other.logging.filter.or(self.logging.filter),
            },
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MULTIHOST_INVENTORY") {
            self.inventory = Some(PathBuf::from(path));
        }

        if let Ok(filter) = std::env::var("MULTIHOST_LOG") {
            self.logging.filter = Some(filter);
        }

        if let Ok(format) = std::env::var("MULTIHOST_LOG_FORMAT") {
            if let Ok(format) = serde_json::from_value(serde_json::Value::String(format.to_lowercase())) {
                self.logging.format = format;
            }
        }

        if std::env::var("NO_COLOR").is_ok() || std::env::var("MULTIHOST_NO_COLOR").is_ok() {
            self.logging.color = false;
        }
    }

    /// Inventory path with `~` and environment variables expanded.
    pub fn inventory_path(&self) -> Option<PathBuf> {
        self.inventory.as_ref().map(|p| expand_path(p))
    }
}

/// Expands `~` and `$VAR` in a path.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.inventory, None);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.logging.color);
    }

    #[test]
    fn test_parse_and_merge() {
        let file: Config = toml::from_str(
            r#"
inventory = "mhc.yaml"

[logging]
format = "json"
filter = "multihost=debug"
"#,
        )
        .unwrap();

        let base = Config {
            inventory: Some(PathBuf::from("/etc/mhc.yaml")),
            logging: LoggingConfig {
                color: false,
                ..Default::default()
            },
        };
        let merged = base.merge(file);
        assert_eq!(merged.inventory, Some(PathBuf::from("mhc.yaml")));
        assert_eq!(merged.logging.format, LogFormat::Json);
        assert_eq!(merged.logging.filter.as_deref(), Some("multihost=debug"));
        assert!(!merged.logging.color);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("MULTIHOST_INVENTORY", "/srv/mhc.yaml");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.inventory, Some(PathBuf::from("/srv/mhc.yaml")));
        std::env::remove_var("MULTIHOST_INVENTORY");
    }
}
