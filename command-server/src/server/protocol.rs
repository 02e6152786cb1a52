//! IPC protocol between the discovery client and a command server
//!
//! One JSON object per line over a Unix socket. A connection carries
//! exactly one request and one response.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::supervisor::ChildStatus;

/// Request from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerRequest {
    /// Re-run the managed command
    Invoke,

    /// Liveness probe
    Ping,

    /// Report server and child state
    Status,

    /// Stop the server
    Shutdown,
}

/// Response from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerResponse {
    /// Respawn succeeded (or, for `Shutdown`, the server is stopping)
    Ok,

    /// Respawn failed; the server is still running
    SpawnFailed { reason: String },

    /// Invocation queue is full
    Busy,

    /// Reply to `Ping`
    Pong { pid: u32 },

    /// Reply to `Status`
    Status { status: ServerStatus },

    /// Malformed or unexpected request
    Error { message: String },
}

/// Snapshot of a running command server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub directory: PathBuf,
    pub endpoint: PathBuf,
    pub pid: u32,
    pub command: Vec<String>,
    pub child_pid: Option<u32>,
    pub child: Option<ChildStatus>,
    pub invocations: u64,
    pub uptime_secs: u64,
}
