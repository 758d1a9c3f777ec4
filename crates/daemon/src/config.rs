// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration and persisted setup.
//!
//! `setup.yml` (host id, name, units, version) and `models/*.yml` live
//! under the platform's application-data directory and are never mutated
//! by a running protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no application data directory available")]
    NoDataDir,
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Resolved daemon paths and bind address.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Config {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 4567;

    pub fn new(host: String, port: u16, data_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::data_dir().ok_or(ConfigError::NoDataDir)?.join("labrun"),
        };
        Ok(Self { host, port, data_dir })
    }

    pub fn setup_path(&self) -> PathBuf {
        self.data_dir.join("setup.yml")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }
}

/// Contents of `setup.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    pub id: String,
    pub name: String,
    /// Per-namespace executor configuration.
    #[serde(default)]
    pub units: BTreeMap<String, serde_yaml::Value>,
    pub version: u32,
}

impl Setup {
    /// Load `setup.yml`, writing a fresh default when absent.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
            return serde_yaml::from_str(&text)
                .map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source });
        }

        let setup = Self {
            id: generated_id(),
            name: hostname(),
            units: BTreeMap::new(),
            version: 1,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
        }
        let text = serde_yaml::to_string(&setup)
            .map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })?;
        std::fs::write(path, text)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Ok(setup)
    }
}

fn generated_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    format!("{ms:x}")
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "labrun".to_string())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
