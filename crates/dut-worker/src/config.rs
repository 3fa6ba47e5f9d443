//! Daemon configuration file

use std::path::{Path, PathBuf};

use dut_core::{NetworkConfig, WorkerOptions, WorkerSection};
use dut_testbot::TestBotConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub worker: WorkerTable,
    #[serde(default)]
    pub testbot: TestBotConfig,
    /// Network shared with the DUT, applied during setup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
}

/// `[worker]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTable {
    /// Worker variant ("testbot" or "qemu")
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Storage device override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<PathBuf>,
}

fn default_kind() -> String {
    "testbot".to_string()
}

impl Default for WorkerTable {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            disk: None,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Construction options handed to the worker
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            network: self.network.clone(),
            worker: WorkerSection {
                disk: self.worker.disk.clone(),
            },
        }
    }
}
