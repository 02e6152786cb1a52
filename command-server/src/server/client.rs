//! Discovery client
//!
//! Resolves the nearest live server for a directory and talks to it.
//! Transport failures never escape `invoke`: they are folded into an
//! [`InvokeOutcome`] and logged for diagnostics.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::protocol::{ServerRequest, ServerResponse, ServerStatus};
use super::transport::Transport;
use crate::registry::{Registration, Registry, Resolution};

/// Result of asking the nearest server to re-run its command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The server respawned its command
    Ok,

    /// No ancestor directory has a live server
    NoServerRegistered,

    /// The server is up but could not start the command
    SpawnFailed(String),

    /// The server's invocation queue is full
    Busy,

    /// A server was resolved but could not be reached
    ConnectionError(String),
}

impl InvokeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, InvokeOutcome::Ok)
    }
}

impl fmt::Display for InvokeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeOutcome::Ok => write!(f, "ok"),
            // A server that vanished after resolve looks the same to the user
            InvokeOutcome::NoServerRegistered | InvokeOutcome::ConnectionError(_) => {
                write!(f, "no server registered")
            }
            InvokeOutcome::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
            InvokeOutcome::Busy => write!(f, "server busy, try again"),
        }
    }
}

/// Client side of the command server protocol
#[derive(Clone)]
pub struct DiscoveryClient {
    registry: Registry,
    transport: Arc<dyn Transport>,
}

impl DiscoveryClient {
    pub fn new(registry: Registry, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Find the nearest server above `starting_directory` and ask it to
    /// re-run its command
    pub async fn invoke(&self, starting_directory: &Path) -> InvokeOutcome {
        let registration = match self.registry.resolve(starting_directory).await {
            Ok(Resolution::Found(registration)) => registration,
            Ok(Resolution::NotFound) => return InvokeOutcome::NoServerRegistered,
            Err(e) => {
                tracing::warn!("Discovery failed: {}", e);
                return InvokeOutcome::NoServerRegistered;
            }
        };

        tracing::info!(
            "Invoking server for {} at {}",
            registration.canonical_directory.display(),
            registration.endpoint.display()
        );

        match self
            .transport
            .request(&registration.endpoint, &ServerRequest::Invoke)
            .await
        {
            Ok(ServerResponse::Ok) => InvokeOutcome::Ok,
            Ok(ServerResponse::SpawnFailed { reason }) => InvokeOutcome::SpawnFailed(reason),
            Ok(ServerResponse::Busy) => InvokeOutcome::Busy,
            Ok(ServerResponse::Error { message }) => {
                tracing::warn!("Server refused invocation: {}", message);
                InvokeOutcome::ConnectionError(message)
            }
            Ok(other) => {
                tracing::warn!("Unexpected response to Invoke: {:?}", other);
                InvokeOutcome::ConnectionError(format!("unexpected response {:?}", other))
            }
            Err(e) => {
                tracing::warn!("Lost server at {}: {}", registration.endpoint.display(), e);
                InvokeOutcome::ConnectionError(e.to_string())
            }
        }
    }

    /// Status of the nearest server, or `None` when there is none
    pub async fn status(&self, starting_directory: &Path) -> Result<Option<ServerStatus>> {
        let Some(registration) = self.find(starting_directory).await? else {
            return Ok(None);
        };

        match self.send(&registration, ServerRequest::Status).await? {
            ServerResponse::Status { status } => Ok(Some(status)),
            ServerResponse::Error { message } => anyhow::bail!("{}", message),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    /// Ask the nearest server to shut down. Returns the directory it owned.
    pub async fn stop(&self, starting_directory: &Path) -> Result<Option<Registration>> {
        let Some(registration) = self.find(starting_directory).await? else {
            return Ok(None);
        };

        match self.send(&registration, ServerRequest::Shutdown).await? {
            ServerResponse::Ok => Ok(Some(registration)),
            ServerResponse::Error { message } => anyhow::bail!("{}", message),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    async fn find(&self, starting_directory: &Path) -> Result<Option<Registration>> {
        let resolution = self
            .registry
            .resolve(starting_directory)
            .await
            .context("Failed to search the registry")?;
        Ok(match resolution {
            Resolution::Found(registration) => Some(registration),
            Resolution::NotFound => None,
        })
    }

    async fn send(
        &self,
        registration: &Registration,
        request: ServerRequest,
    ) -> Result<ServerResponse> {
        self.transport
            .request(&registration.endpoint, &request)
            .await
            .with_context(|| {
                format!(
                    "Failed to reach server at {}",
                    registration.endpoint.display()
                )
            })
    }
}
