//! Process Supervisor
//!
//! Spawns, tracks and terminates the managed command. The supervisor never
//! holds more than one child: `respawn` consumes the previous handle,
//! terminates it if it is still running, and only then launches the next one.
//!
//! Launching goes through the [`ProcessLauncher`] capability so tests can
//! swap in an in-memory launcher instead of real processes.

mod process;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SpawnError;
use crate::events::{EventSender, ServerEvent};

pub use process::TokioLauncher;

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ============================================================================
// Command Specification
// ============================================================================

/// The command a server manages. Fixed at server start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    working_directory: PathBuf,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, working_directory: impl Into<PathBuf>) -> Result<Self, SpawnError> {
        if argv.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        Ok(Self {
            argv,
            working_directory: working_directory.into(),
        })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// A running process the supervisor can observe and stop.
///
/// Exit codes follow the shell convention: a process killed by signal N
/// reports `128 + N`.
#[async_trait]
pub trait ManagedChild: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check. `Ok(None)` while still running.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit (SIGKILL)
    fn kill(&mut self) -> io::Result<()>;

    /// Wait until the process exits
    async fn wait(&mut self) -> io::Result<i32>;
}

/// Starts processes from a command specification
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn ManagedChild>>;
}

// ============================================================================
// Child Handle
// ============================================================================

/// Non-blocking view of a child's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum ChildStatus {
    Running,
    ExitedWith(i32),
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Running => write!(f, "running"),
            ChildStatus::ExitedWith(code) => write!(f, "exited with {}", code),
        }
    }
}

/// Handle to the one child a supervisor owns.
///
/// Replaced, never reused, on every respawn.
pub struct ChildHandle {
    process_id: Option<u32>,
    start_time: DateTime<Utc>,
    last_exit_code: Option<i32>,
    child: Box<dyn ManagedChild>,
}

impl ChildHandle {
    fn new(child: Box<dyn ManagedChild>) -> Self {
        Self {
            process_id: child.id(),
            start_time: Utc::now(),
            last_exit_code: None,
            child,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Exit code, once an exit has been observed
    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    /// Poll the child without blocking
    pub fn status(&mut self) -> ChildStatus {
        if let Some(code) = self.last_exit_code {
            return ChildStatus::ExitedWith(code);
        }
        match self.child.try_wait() {
            Ok(Some(code)) => {
                self.last_exit_code = Some(code);
                ChildStatus::ExitedWith(code)
            }
            Ok(None) => ChildStatus::Running,
            Err(e) => {
                tracing::warn!("Failed to poll process {:?}: {}", self.process_id, e);
                ChildStatus::Running
            }
        }
    }
}

impl fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildHandle")
            .field("process_id", &self.process_id)
            .field("start_time", &self.start_time)
            .field("last_exit_code", &self.last_exit_code)
            .finish()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Runs, respawns and terminates the managed command
#[derive(Clone)]
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    grace_period: Duration,
    events: EventSender,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            grace_period: DEFAULT_GRACE_PERIOD,
            events: EventSender::none(),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start a new process for `spec`
    pub fn run(&self, spec: &CommandSpec) -> Result<ChildHandle, SpawnError> {
        let child = self
            .launcher
            .launch(spec)
            .map_err(|source| SpawnError::Launch {
                program: spec.program().to_string(),
                source,
            })?;

        let handle = ChildHandle::new(child);
        tracing::info!("Started '{}' (pid {:?})", spec, handle.process_id());
        self.events.send(ServerEvent::ChildStarted {
            pid: handle.process_id(),
        });
        Ok(handle)
    }

    /// Terminate `current` if it is still running, then start a fresh process
    pub async fn respawn(
        &self,
        current: Option<ChildHandle>,
        spec: &CommandSpec,
    ) -> Result<ChildHandle, SpawnError> {
        if let Some(handle) = current {
            self.terminate(handle).await?;
        }
        self.run(spec)
    }

    /// Non-blocking status query
    pub fn status(&self, handle: &mut ChildHandle) -> ChildStatus {
        handle.status()
    }

    /// Stop a child: SIGTERM, wait up to the grace period, then SIGKILL.
    ///
    /// Returns the exit code. A child that already exited is not signalled.
    pub async fn terminate(&self, mut handle: ChildHandle) -> Result<i32, SpawnError> {
        let pid = handle.process_id();
        let term_err = |source: io::Error| SpawnError::Terminate {
            pid: pid.unwrap_or(0),
            source,
        };

        if let ChildStatus::ExitedWith(code) = handle.status() {
            tracing::debug!("Process {:?} already exited with {}", pid, code);
            return Ok(code);
        }

        tracing::debug!("Sending SIGTERM to process {:?}", pid);
        handle.child.terminate().map_err(term_err)?;

        let mut forced = false;
        let code = match tokio::time::timeout(self.grace_period, handle.child.wait()).await {
            Ok(result) => result.map_err(term_err)?,
            Err(_) => {
                tracing::warn!(
                    "Process {:?} did not exit within {:?}, killing",
                    pid,
                    self.grace_period
                );
                forced = true;
                handle.child.kill().map_err(term_err)?;
                tokio::time::timeout(self.grace_period, handle.child.wait())
                    .await
                    .map_err(|_| {
                        term_err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "process survived SIGKILL",
                        ))
                    })?
                    .map_err(term_err)?
            }
        };

        handle.last_exit_code = Some(code);
        tracing::info!("Process {:?} exited with {}", pid, code);
        self.events.send(ServerEvent::ChildTerminated { pid, forced });
        Ok(code)
    }
}
