//! Optional preferences file (`~/.config/f5vpn-login/config.toml`)
//!
//! Distinct from the session cache in `cache.rs`: this file holds
//! defaults for flags the user would otherwise retype every run. Its
//! absence is not an error; CLI flags always override it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no config directory available on this platform")]
    NoConfigDir,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default_host: Option<String>,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub socks5_proxy: Option<String>,
    #[serde(default)]
    pub skip_dns: bool,
    #[serde(default)]
    pub skip_routes: bool,
    #[serde(default)]
    pub custom_routes: bool,
    #[serde(default)]
    pub verify_cert: bool,
}

impl Config {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("f5vpn-login").join("config.toml"))
    }

    /// Load the preferences file, returning defaults when it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).expect("config always serializes");
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::load_or_default(&path).unwrap();
        assert!(config.default_host.is_none());
        assert!(!config.skip_dns);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            default_host: Some("me@gw.example.com".to_string()),
            skip_dns: true,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded.default_host, config.default_host);
        assert!(loaded.skip_dns);
    }
}
