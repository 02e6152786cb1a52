//! Command server - runs one command for one directory
//!
//! Lifecycle: `Starting` ([`CommandServer::start`]) runs the command once,
//! binds the socket and publishes the directory. `Listening`
//! ([`RunningServer::serve`]) accepts connections until a shutdown signal
//! or a `Shutdown` request. `Terminating` withdraws the registration, lets
//! any in-flight respawn finish, then terminates the managed child.
//!
//! Connections are handled concurrently, but every `Invoke` goes through a
//! bounded FIFO queue drained by a single worker, so respawns never overlap.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};

use super::protocol::{ServerRequest, ServerResponse, ServerStatus};
use super::transport::{read_message, write_message};
use crate::error::{RegistryError, ServerError, TransportError};
use crate::events::{EventSender, ServerEvent};
use crate::registry::{self, Registration, Registry};
use crate::supervisor::{ChildHandle, CommandSpec, ProcessSupervisor};

/// Default number of invocations that may wait behind the one in progress
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// How long a connected client has to send its request line
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Starting
// ============================================================================

/// A command server that has not started yet
pub struct CommandServer {
    directory: PathBuf,
    spec: CommandSpec,
    supervisor: ProcessSupervisor,
    registry: Registry,
    queue_capacity: usize,
    events: EventSender,
}

impl CommandServer {
    /// Anchor a server to `directory` running `argv`
    pub fn new(
        directory: &Path,
        argv: Vec<String>,
        supervisor: ProcessSupervisor,
        registry: Registry,
    ) -> Result<Self, ServerError> {
        let directory = registry::canonicalize(directory)?;
        let spec = CommandSpec::new(argv, directory.clone())?;
        Ok(Self {
            directory,
            spec,
            supervisor,
            registry,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            events: EventSender::none(),
        })
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Run the command once, bind the endpoint and publish the directory.
    ///
    /// A launch failure is fatal and nothing is published. If another live
    /// server owns the directory, the freshly started child is terminated
    /// and `AlreadyRegistered` is returned.
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        tracing::info!("Starting command server in {}", self.directory.display());
        let child = self.supervisor.run(&self.spec)?;

        let (registration, listener) = match self.claim().await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.discard_child(child).await;
                return Err(e);
            }
        };

        tracing::info!("Command server listening on {}", registration.endpoint.display());
        self.events.send(ServerEvent::Published {
            directory: registration.canonical_directory.clone(),
            endpoint: registration.endpoint.clone(),
        });

        Ok(RunningServer {
            server: self,
            registration,
            listener,
            slot: Arc::new(ChildSlot::new(child)),
            started: Instant::now(),
        })
    }

    /// Bind then publish. Only one process can hold the bound socket, so
    /// the bind decides which server owns the directory.
    async fn claim(&self) -> Result<(Registration, UnixListener), ServerError> {
        let endpoint = self.registry.endpoint_for(&self.directory);
        let listener = bind_endpoint(&self.directory, &endpoint).await?;

        match self.registry.publish(&self.directory, &endpoint).await {
            Ok(registration) => Ok((registration, listener)),
            Err(e) => {
                drop(listener);
                if let Err(remove_err) = std::fs::remove_file(&endpoint) {
                    tracing::debug!("Socket already gone: {}", remove_err);
                }
                Err(e.into())
            }
        }
    }

    /// Withdraw the registration and remove the socket, but only while the
    /// record is still ours
    async fn release(&self, listener: UnixListener, endpoint: &Path) {
        match self.registry.withdraw(&self.directory).await {
            Ok(true) => {
                if let Err(e) = std::fs::remove_file(endpoint) {
                    tracing::debug!("Socket already gone: {}", e);
                }
                self.events.send(ServerEvent::Withdrawn {
                    directory: self.directory.clone(),
                });
            }
            Ok(false) => tracing::warn!("Registration is no longer ours, leaving socket in place"),
            Err(e) => tracing::warn!("Failed to withdraw registration: {}", e),
        }
        drop(listener);
    }

    async fn discard_child(&self, child: ChildHandle) {
        if let Err(e) = self.supervisor.terminate(child).await {
            tracing::warn!("Failed to stop child after aborted start: {}", e);
        }
    }
}

/// Bind `endpoint`. An existing socket file is replaced only when nothing
/// is listening on it; if another server binds it first, the directory is
/// taken.
async fn bind_endpoint(directory: &Path, endpoint: &Path) -> Result<UnixListener, ServerError> {
    let taken = || ServerError::from(RegistryError::AlreadyRegistered(directory.to_path_buf()));
    let bind_error = |source| ServerError::Bind {
        path: endpoint.to_path_buf(),
        source,
    };

    let listener = match UnixListener::bind(endpoint) {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if registry::has_listener(endpoint).await {
                return Err(taken());
            }
            tracing::info!("Replacing dead socket {}", endpoint.display());
            if let Err(e) = std::fs::remove_file(endpoint) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            match UnixListener::bind(endpoint) {
                Ok(listener) => listener,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => return Err(taken()),
                Err(e) => return Err(bind_error(e)),
            }
        }
        Err(e) => return Err(bind_error(e)),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(endpoint, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

// ============================================================================
// Child slot
// ============================================================================

/// Holds the current child. Empty while a respawn is in progress.
struct ChildSlot {
    handle: Mutex<Option<ChildHandle>>,
}

impl ChildSlot {
    fn new(handle: ChildHandle) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ChildHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self) -> Option<ChildHandle> {
        self.lock().take()
    }

    fn put(&self, handle: ChildHandle) {
        *self.lock() = Some(handle);
    }
}

// ============================================================================
// Listening
// ============================================================================

/// A started server: child running, directory published, socket bound
pub struct RunningServer {
    server: CommandServer,
    registration: Registration,
    listener: UnixListener,
    slot: Arc<ChildSlot>,
    started: Instant,
}

struct Invocation {
    reply: oneshot::Sender<ServerResponse>,
}

/// Shared by all connection handlers
struct ConnectionContext {
    registration: Registration,
    command: Vec<String>,
    started: Instant,
    invocations: Arc<AtomicU64>,
    slot: Arc<ChildSlot>,
    invoke_tx: mpsc::Sender<Invocation>,
    stop_tx: mpsc::Sender<()>,
    events: EventSender,
}

impl RunningServer {
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn endpoint(&self) -> &Path {
        &self.registration.endpoint
    }

    /// Serve until `shutdown` completes or a client sends `Shutdown`,
    /// then tear down.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let RunningServer {
            server,
            registration,
            listener,
            slot,
            started,
        } = self;

        let (invoke_tx, invoke_rx) = mpsc::channel::<Invocation>(server.queue_capacity);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (worker_stop_tx, worker_stop_rx) = watch::channel(false);
        let invocations = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(invocation_worker(
            invoke_rx,
            worker_stop_rx,
            server.supervisor.clone(),
            server.spec.clone(),
            Arc::clone(&slot),
            Arc::clone(&invocations),
            server.events.clone(),
        ));

        let context = Arc::new(ConnectionContext {
            registration: registration.clone(),
            command: server.spec.argv().to_vec(),
            started,
            invocations,
            slot: Arc::clone(&slot),
            invoke_tx,
            stop_tx,
            events: server.events.clone(),
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, context).await {
                                    tracing::warn!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = stop_rx.recv() => {
                    tracing::info!("Shutdown requested by client");
                    break;
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Terminating
        drop(context);
        server.release(listener, &registration.endpoint).await;

        let _ = worker_stop_tx.send(true);
        if let Err(e) = worker.await {
            tracing::warn!("Invocation worker panicked: {}", e);
        }

        if let Some(child) = slot.take() {
            if let Err(e) = server.supervisor.terminate(child).await {
                tracing::warn!("Failed to stop managed command: {}", e);
            }
        }

        tracing::info!("Command server for {} stopped", server.directory.display());
        Ok(())
    }
}

/// Single consumer of the invocation queue. Each respawn runs to
/// completion even if its client has gone away.
async fn invocation_worker(
    mut invoke_rx: mpsc::Receiver<Invocation>,
    mut stop_rx: watch::Receiver<bool>,
    supervisor: ProcessSupervisor,
    spec: CommandSpec,
    slot: Arc<ChildSlot>,
    invocations: Arc<AtomicU64>,
    events: EventSender,
) {
    loop {
        let invocation = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            next = invoke_rx.recv() => match next {
                Some(invocation) => invocation,
                None => break,
            },
        };

        let sequence = invocations.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("Invocation #{}: re-running '{}'", sequence, spec);
        events.send(ServerEvent::InvocationReceived { sequence });

        let previous = slot.take();
        let response = match supervisor.respawn(previous, &spec).await {
            Ok(handle) => {
                let pid = handle.process_id();
                slot.put(handle);
                events.send(ServerEvent::RespawnCompleted { sequence, pid });
                ServerResponse::Ok
            }
            Err(e) => {
                tracing::warn!("Invocation #{} failed: {}", sequence, e);
                let reason = e.to_string();
                events.send(ServerEvent::RespawnFailed {
                    sequence,
                    reason: reason.clone(),
                });
                ServerResponse::SpawnFailed { reason }
            }
        };

        if invocation.reply.send(response).is_err() {
            tracing::debug!("Client for invocation #{} went away", sequence);
        }
    }

    invoke_rx.close();
    while let Ok(invocation) = invoke_rx.try_recv() {
        let _ = invocation.reply.send(shutting_down());
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn shutting_down() -> ServerResponse {
    ServerResponse::Error {
        message: "server is shutting down".to_string(),
    }
}

async fn handle_connection(
    stream: UnixStream,
    context: Arc<ConnectionContext>,
) -> Result<(), TransportError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let request = match tokio::time::timeout(
        REQUEST_READ_TIMEOUT,
        read_message::<_, ServerRequest>(&mut reader),
    )
    .await
    {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e @ (TransportError::Protocol(_) | TransportError::MessageTooLarge(_)))) => {
            let response = ServerResponse::Error {
                message: format!("Invalid request: {}", e),
            };
            return write_message(&mut writer, &response).await;
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            tracing::debug!("Client sent nothing within {:?}", REQUEST_READ_TIMEOUT);
            return Ok(());
        }
    };

    tracing::debug!("Request: {:?}", request);
    let stop_after_reply = matches!(request, ServerRequest::Shutdown);
    let response = handle_request(request, &context).await;
    write_message(&mut writer, &response).await?;

    // Reply first so the client sees the acknowledgement before teardown
    if stop_after_reply {
        // A full channel means a stop is already pending
        let _ = context.stop_tx.try_send(());
    }
    Ok(())
}

async fn handle_request(request: ServerRequest, context: &ConnectionContext) -> ServerResponse {
    match request {
        ServerRequest::Ping => ServerResponse::Pong {
            pid: std::process::id(),
        },

        ServerRequest::Status => ServerResponse::Status {
            status: context.snapshot(),
        },

        ServerRequest::Shutdown => ServerResponse::Ok,

        ServerRequest::Invoke => {
            let (reply, response) = oneshot::channel();
            match context.invoke_tx.try_send(Invocation { reply }) {
                Ok(()) => response.await.unwrap_or_else(|_| shutting_down()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Invocation queue full, rejecting");
                    context.events.send(ServerEvent::InvocationRejected);
                    ServerResponse::Busy
                }
                Err(mpsc::error::TrySendError::Closed(_)) => shutting_down(),
            }
        }
    }
}

impl ConnectionContext {
    fn snapshot(&self) -> ServerStatus {
        let (child_pid, child) = match self.slot.lock().as_mut() {
            Some(handle) => (handle.process_id(), Some(handle.status())),
            None => (None, None),
        };

        ServerStatus {
            directory: self.registration.canonical_directory.clone(),
            endpoint: self.registration.endpoint.clone(),
            pid: std::process::id(),
            command: self.command.clone(),
            child_pid,
            child,
            invocations: self.invocations.load(Ordering::SeqCst),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
