//! Registry
//!
//! Maps canonical directories to the endpoint of the server that owns them.
//! Records are small JSON files in a shared registry directory, one per
//! registered directory. Presence of a record never implies liveness: every
//! lookup that matters probes the endpoint with a `Ping`, and records whose
//! endpoint is unreachable are ignored (and purged once their owner process
//! is gone).

mod endpoint;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::server::protocol::{ServerRequest, ServerResponse};
use crate::server::transport::Transport;

pub use endpoint::directory_key;

const LISTENER_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default registry location: `<runtime dir or cache dir>/command-server`
pub fn default_registry_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("command-server")
}

/// Canonical form of a directory: absolute, symlinks resolved
pub fn canonicalize(path: &Path) -> Result<PathBuf, RegistryError> {
    std::fs::canonicalize(path).map_err(|source| RegistryError::Canonicalize {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Records
// ============================================================================

/// A published association between a directory and a server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub canonical_directory: PathBuf,
    pub endpoint: PathBuf,
    pub owner_process_id: u32,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an ancestor walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Registration),
    NotFound,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
pub struct Registry {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
}

impl Registry {
    /// `transport` is used for liveness probes and should carry short timeouts
    pub fn new(dir: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Self {
        Self {
            dir: dir.into(),
            transport,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for a canonical directory
    pub fn endpoint_for(&self, canonical_directory: &Path) -> PathBuf {
        self.dir
            .join(format!("{}.sock", directory_key(canonical_directory)))
    }

    fn record_path(&self, canonical_directory: &Path) -> PathBuf {
        self.dir
            .join(format!("{}.json", directory_key(canonical_directory)))
    }

    /// Record a live registration for `directory` served at `endpoint`.
    ///
    /// The caller must already be listening on `endpoint`; binding it is
    /// what makes the claim exclusive. Fails with `AlreadyRegistered` if the
    /// existing record names another endpoint that still answers a probe.
    /// Unreachable records are superseded.
    pub async fn publish(
        &self,
        directory: &Path,
        endpoint: &Path,
    ) -> Result<Registration, RegistryError> {
        let canonical_directory = canonicalize(directory)?;
        self.ensure_dir()?;

        match self.lookup(&canonical_directory) {
            Ok(Some(existing)) => {
                if existing.endpoint.as_path() != endpoint
                    && self.probe(&existing.endpoint).await
                {
                    return Err(RegistryError::AlreadyRegistered(canonical_directory));
                }
                tracing::info!(
                    "Superseding stale registration for {} (owner pid {})",
                    canonical_directory.display(),
                    existing.owner_process_id
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring unreadable registration: {}", e),
        }

        let registration = Registration {
            canonical_directory,
            endpoint: endpoint.to_path_buf(),
            owner_process_id: std::process::id(),
            created_at: Utc::now(),
        };
        self.write_record(&registration)?;

        tracing::info!(
            "Registered {} -> {}",
            registration.canonical_directory.display(),
            registration.endpoint.display()
        );
        Ok(registration)
    }

    /// Find the nearest ancestor of `starting_directory` (itself included)
    /// with a live registration
    pub async fn resolve(&self, starting_directory: &Path) -> Result<Resolution, RegistryError> {
        let start = canonicalize(starting_directory)?;

        for candidate in start.ancestors() {
            let registration = match self.lookup(candidate) {
                Ok(Some(registration)) => registration,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Skipping unreadable registration: {}", e);
                    continue;
                }
            };

            if self.probe(&registration.endpoint).await {
                tracing::debug!(
                    "Resolved {} to server at {}",
                    start.display(),
                    candidate.display()
                );
                return Ok(Resolution::Found(registration));
            }

            tracing::debug!("Registration for {} is stale", candidate.display());
            self.purge_if_abandoned(&registration).await;
        }

        Ok(Resolution::NotFound)
    }

    /// Remove the registration for `directory` if this process owns it.
    ///
    /// Returns whether a record was removed.
    pub async fn withdraw(&self, directory: &Path) -> Result<bool, RegistryError> {
        let canonical_directory = canonicalize(directory)?;
        let Some(registration) = self.lookup(&canonical_directory)? else {
            return Ok(false);
        };

        if registration.owner_process_id != std::process::id() {
            tracing::warn!(
                "Not withdrawing {}: owned by pid {}",
                canonical_directory.display(),
                registration.owner_process_id
            );
            return Ok(false);
        }

        remove_if_present(&self.record_path(&canonical_directory))?;
        tracing::info!("Withdrew registration for {}", canonical_directory.display());
        Ok(true)
    }

    /// Read the record for an exact canonical directory, live or not
    pub fn lookup(&self, canonical_directory: &Path) -> Result<Option<Registration>, RegistryError> {
        let path = self.record_path(canonical_directory);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let registration: Registration = serde_json::from_str(&content)
            .map_err(|source| RegistryError::Record { path, source })?;

        // Key collision guard
        if registration.canonical_directory != canonical_directory {
            return Ok(None);
        }
        Ok(Some(registration))
    }

    /// Whether `endpoint` answers a ping
    pub async fn probe(&self, endpoint: &Path) -> bool {
        match self.transport.request(endpoint, &ServerRequest::Ping).await {
            Ok(ServerResponse::Pong { .. }) => true,
            Ok(other) => {
                tracing::debug!("Unexpected probe reply from {:?}: {:?}", endpoint, other);
                false
            }
            Err(e) => {
                tracing::debug!("Probe of {:?} failed: {}", endpoint, e);
                false
            }
        }
    }

    fn ensure_dir(&self) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(&self.dir)?.permissions();
            if permissions.mode() & 0o077 != 0 && is_owned_by_us(&self.dir) {
                permissions.set_mode(0o700);
                std::fs::set_permissions(&self.dir, permissions)?;
            }
        }
        Ok(())
    }

    /// Write via a temp file and rename so readers never see a partial record
    fn write_record(&self, registration: &Registration) -> Result<(), RegistryError> {
        let path = self.record_path(&registration.canonical_directory);
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        let json = serde_json::to_string_pretty(registration).map_err(|source| {
            RegistryError::Record {
                path: path.clone(),
                source,
            }
        })?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove a stale record once its owner is gone, and its socket unless
    /// a newer server is already listening there. A record that changed
    /// since it was probed is left alone.
    async fn purge_if_abandoned(&self, registration: &Registration) {
        if process_alive(registration.owner_process_id) {
            return;
        }
        match self.lookup(&registration.canonical_directory) {
            Ok(Some(current)) if current == *registration => {}
            _ => return,
        }
        tracing::info!(
            "Purging abandoned registration for {} (pid {} is gone)",
            registration.canonical_directory.display(),
            registration.owner_process_id
        );

        let record = self.record_path(&registration.canonical_directory);
        if let Err(e) = remove_if_present(&record) {
            tracing::warn!("Failed to remove {}: {}", record.display(), e);
        }
        if has_listener(&registration.endpoint).await {
            return;
        }
        if let Err(e) = remove_if_present(&registration.endpoint) {
            tracing::warn!("Failed to remove {}: {}", registration.endpoint.display(), e);
        }
    }
}

/// Whether some process is listening on the socket at `endpoint`. Unlike
/// [`Registry::probe`] this needs no reply, so a listener that is bound but
/// not yet serving counts.
pub async fn has_listener(endpoint: &Path) -> bool {
    match tokio::time::timeout(
        LISTENER_CHECK_TIMEOUT,
        tokio::net::UnixStream::connect(endpoint),
    )
    .await
    {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => !matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
        ),
        Err(_) => true,
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn is_owned_by_us(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .map(|m| m.uid() == unsafe { libc::getuid() })
        .unwrap_or(false)
}

/// Signal 0 checks existence without delivering anything
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}
