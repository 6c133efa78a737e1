//! Daemon configuration, loaded from `~/.serial-monitor/config.toml`.
//!
//! Three-tier precedence (ambient, not in spec.md but necessary for any
//! daemon with both a config file and CLI flags): built-in defaults, then
//! `config.toml`, then CLI flags layered on top by the binary's `main`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub no_autoconnect: bool,
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_rapid_retry")]
    pub rapid_retry_secs: u64,
    #[serde(default = "default_slow_retry")]
    pub slow_retry_secs: u64,
    #[serde(default)]
    pub echo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            baudrate: default_baudrate(),
            no_autoconnect: false,
            max_records: default_max_records(),
            cleanup_interval_secs: default_cleanup_interval(),
            rapid_retry_secs: default_rapid_retry(),
            slow_retry_secs: default_slow_retry(),
            echo: false,
        }
    }
}

fn default_baudrate() -> u32 {
    115_200
}
fn default_max_records() -> u64 {
    10_000
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_rapid_retry() -> u64 {
    30
}
fn default_slow_retry() -> u64 {
    600
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

impl Config {
    /// Load `~/.serial-monitor/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".serial-monitor")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.baudrate, 115_200);
        assert_eq!(cfg.max_records, 10_000);
        assert_eq!(cfg.cleanup_interval_secs, 60);
        assert_eq!(cfg.rapid_retry_secs, 30);
        assert_eq!(cfg.slow_retry_secs, 600);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_from(dir.path().join("nonexistent.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "baudrate = 9600\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.baudrate, 9600);
        assert_eq!(cfg.max_records, 10_000);
    }
}
