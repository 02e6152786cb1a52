//! Command handlers
//!
//! One handler per CLI mode. `HandlerContext` carries the resolved
//! configuration and builds the components each handler needs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::FileConfig;
use crate::registry::{default_registry_dir, Registry};
use crate::server::{DiscoveryClient, UnixTransport};
use crate::supervisor::{ProcessSupervisor, TokioLauncher};

pub mod client;
pub mod serve;

pub use client::{run_invoke, run_status, run_stop};
pub use serve::run_serve;

/// Resolved settings shared by all handlers
pub struct HandlerContext {
    config: FileConfig,
    registry_dir: PathBuf,
    working_directory: PathBuf,
}

impl HandlerContext {
    /// Load configuration as seen from the current directory
    pub fn load(registry_override: Option<&Path>) -> Result<Self> {
        let working_directory =
            std::env::current_dir().context("Cannot read current directory")?;
        let config = FileConfig::load_for(&working_directory)?;
        Self::new(config, registry_override, working_directory)
    }

    /// Load configuration for a client mode. A broken config file is
    /// logged and replaced by defaults, so the client still reports one of
    /// its usual outcomes.
    pub fn load_for_client(registry_override: Option<&Path>) -> Result<Self> {
        let working_directory =
            std::env::current_dir().context("Cannot read current directory")?;
        Ok(Self::lenient(registry_override, working_directory))
    }

    pub fn lenient(registry_override: Option<&Path>, working_directory: PathBuf) -> Self {
        let config = FileConfig::load_for(&working_directory).unwrap_or_else(|e| {
            tracing::warn!("Ignoring config: {:#}", e);
            FileConfig::default()
        });
        let registry_dir = config.registry_dir(registry_override).unwrap_or_else(|e| {
            tracing::warn!("{:#}; using the default registry", e);
            default_registry_dir()
        });
        tracing::debug!("Using registry at {}", registry_dir.display());
        Self {
            config,
            registry_dir,
            working_directory,
        }
    }

    pub fn new(
        config: FileConfig,
        registry_override: Option<&Path>,
        working_directory: PathBuf,
    ) -> Result<Self> {
        let registry_dir = config.registry_dir(registry_override)?;
        tracing::debug!("Using registry at {}", registry_dir.display());
        Ok(Self {
            config,
            registry_dir,
            working_directory,
        })
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Registry whose liveness probes use the short probe timeout
    pub fn registry(&self) -> Registry {
        let probe_timeout = self.config.probe_timeout();
        Registry::new(
            self.registry_dir.clone(),
            Arc::new(UnixTransport::with_timeouts(probe_timeout, probe_timeout)),
        )
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(TokioLauncher::new()))
            .with_grace_period(self.config.grace_period())
    }

    pub fn client(&self) -> DiscoveryClient {
        DiscoveryClient::new(
            self.registry(),
            Arc::new(UnixTransport::with_timeouts(
                self.config.connect_timeout(),
                self.config.response_timeout(),
            )),
        )
    }
}
