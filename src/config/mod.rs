//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub platform: PlatformConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Parent of the broker's state directory
    pub runtime_dir: Option<PathBuf>,

    /// Where the broker listens
    pub socket_path: Option<PathBuf>,

    /// Root of the access list store
    pub access_dir: PathBuf,

    /// How often watched clients are checked for exit
    pub liveness_interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            socket_path: None,
            access_dir: PathBuf::from("/etc/hwbroker"),
            liveness_interval_ms: 1000,
        }
    }
}

/// Simulated platform exposed by the built-in I/O backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Program and arguments run for each batch server; the client pid is
    /// appended
    pub batch_command: Vec<String>,

    /// Contents of the topology cache
    pub topology: String,

    pub signals: Vec<SignalConfig>,
    pub controls: Vec<ControlConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain: i32,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub aggregation: i32,
    #[serde(default)]
    pub format: i32,
    #[serde(default)]
    pub behavior: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain: i32,
    #[serde(default)]
    pub value: f64,
}

impl Config {
    /// Load config from `path`, or from the default location.
    ///
    /// A missing file at the default location yields defaults; an explicit
    /// path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::config_path(), false),
        };

        if config_path.exists() || required {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            Self::parse(&content).with_context(|| format!("parsing {}", config_path.display()))
        } else {
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("hwbroker")
            .join("config.toml")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.general
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(|| PathBuf::from("/run"))
    }

    /// Broker-private directory holding session files
    pub fn state_dir(&self) -> PathBuf {
        self.runtime_dir().join("hwbroker")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.general
            .socket_path
            .clone()
            .unwrap_or_else(|| self.runtime_dir().join("hwbroker.sock"))
    }

    pub fn access_dir(&self) -> &Path {
        &self.general.access_dir
    }
}
