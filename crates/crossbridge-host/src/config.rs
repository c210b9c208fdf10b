use std::path::{Path, PathBuf};

use crossbridge_process::ProcessConfig;
use crossbridge_sandbox::SandboxConfig;
use serde::Deserialize;

use crate::error::HostError;

/// Contents of `crossbridge.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub callbacks: CallbackConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    /// Outstanding registrations allowed at once; `0` means unbounded.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_pending() -> usize {
    1024
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Emit a structured log event for every init and execute.
    #[serde(default)]
    pub log_events: bool,
}

impl HostConfig {
    pub fn from_file(path: &Path) -> Result<Self, HostError> {
        let content = std::fs::read_to_string(path).map_err(|source| HostError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| HostError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `explicit` if given (it must exist), else the per-user default
    /// file if present, else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, HostError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Loading config");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `~/.crossbridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".crossbridge").join("config.toml"))
    }

    pub fn callback_limit(&self) -> Option<usize> {
        Some(self.callbacks.max_pending).filter(|n| *n > 0)
    }
}
