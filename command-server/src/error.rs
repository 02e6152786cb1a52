//! Error types
//!
//! One enum per component. Handlers and the binary wrap these in
//! `anyhow::Error`; the discovery client folds them into an `InvokeOutcome`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// Process Supervisor
// ============================================================================

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to terminate process {pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("A live server is already registered for {}", .0.display())]
    AlreadyRegistered(PathBuf),

    #[error("Cannot canonicalize {}: {source}", .path.display())]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt registration record {}: {source}", .path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

        #[error("Registry IO error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {}: {source}", .endpoint.display())]
    Connect {
        endpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {}", .0.display())]
    ConnectTimeout(PathBuf),

    #[error("Timed out waiting for a response from {}", .0.display())]
    ResponseTimeout(PathBuf),

    #[error("Connection closed before a response arrived")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Message exceeds {0} bytes")]
    MessageTooLarge(u64),
}

// ============================================================================
// Server Loop
// ============================================================================

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Initial run failed: {0}")]
    Startup(#[from] SpawnError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to bind endpoint {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Whether this error means another server already owns the directory
    pub fn is_already_registered(&self) -> bool {
        matches!(self, ServerError::Registry(RegistryError::AlreadyRegistered(_)))
    }
}
