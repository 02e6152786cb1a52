//! Configuration loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::registry::default_registry_dir;

/// Project-local config file name
pub const CONFIG_FILE_NAME: &str = ".command-server.toml";

/// Find a config file by walking up from `start`, then checking global config.
///
/// Search order:
/// 1. `start` and its parent directories, looking for `.command-server.toml`
/// 2. Global config at `~/.config/command-server/config.toml`
fn find_config_file(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    let global_path = dirs::config_dir()?.join("command-server").join("config.toml");
    global_path.is_file().then_some(global_path)
}

// ============================================================================
// File Configuration (.command-server.toml)
// ============================================================================

/// Top-level configuration
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    /// Registry directory. `~` and `$VAR` are expanded.
    pub dir: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

// Default value functions
fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    crate::server::DEFAULT_QUEUE_CAPACITY
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_response_timeout_ms() -> u64 {
    60_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl FileConfig {
    /// Load config as seen from `start`
    pub fn load_for(start: &Path) -> Result<Self> {
        if let Some(config_path) = find_config_file(start) {
            tracing::debug!("Loading config from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No {} found, using defaults", CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Registry directory: `override_dir` (CLI or env) wins over the file
    pub fn registry_dir(&self, override_dir: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = override_dir {
            return Ok(dir.to_path_buf());
        }
        match &self.registry.dir {
            Some(dir) => {
                let expanded = shellexpand::full(dir)
                    .with_context(|| format!("Cannot expand registry dir '{}'", dir))?;
                Ok(PathBuf::from(expanded.as_ref()))
            }
            None => Ok(default_registry_dir()),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.supervisor.grace_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.client.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.client.response_timeout_ms)
    }
}
