//! Shared fixtures

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use command_server::error::ServerError;
use command_server::registry::{self, Registry};
use command_server::server::{CommandServer, DiscoveryClient, UnixTransport};
use command_server::supervisor::{ProcessSupervisor, TokioLauncher};

/// Temporary tree:
///
/// ```text
/// <root>/registry
/// <root>/tree/foo/bar/baz
/// <root>/tree/other
/// ```
pub struct Tree {
    _root: tempfile::TempDir,
    pub registry_dir: PathBuf,
    pub tree: PathBuf,
}

impl Tree {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let base = registry::canonicalize(root.path()).expect("canonical tempdir");
        let tree = base.join("tree");
        std::fs::create_dir_all(tree.join("foo/bar/baz")).expect("create tree");
        std::fs::create_dir_all(tree.join("other")).expect("create tree");
        Self {
            registry_dir: base.join("registry"),
            tree,
            _root: root,
        }
    }

    pub fn dir(&self, relative: &str) -> PathBuf {
        self.tree.join(relative)
    }

    pub fn registry(&self) -> Registry {
        Registry::new(
            self.registry_dir.clone(),
            Arc::new(UnixTransport::with_timeouts(
                Duration::from_millis(500),
                Duration::from_millis(500),
            )),
        )
    }

    pub fn client(&self) -> DiscoveryClient {
        DiscoveryClient::new(self.registry(), Arc::new(UnixTransport::new()))
    }
}

/// A server running on the test runtime
pub struct ServerTask {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerTask {
    /// Signal shutdown and wait for teardown to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task
            .await
            .expect("server task panicked")
            .expect("server failed");
    }
}

/// Start a server in `directory` running `sh -c <script>`
pub async fn serve_script(tree: &Tree, directory: &Path, script: &str) -> ServerTask {
    try_serve_script(tree, directory, script)
        .await
        .expect("server start")
}

pub async fn try_serve_script(
    tree: &Tree,
    directory: &Path,
    script: &str,
) -> Result<ServerTask, ServerError> {
    let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    try_serve(tree, directory, argv).await
}

pub async fn try_serve(
    tree: &Tree,
    directory: &Path,
    argv: Vec<String>,
) -> Result<ServerTask, ServerError> {
    let supervisor = ProcessSupervisor::new(Arc::new(TokioLauncher::new()))
        .with_grace_period(Duration::from_secs(2));
    let running = CommandServer::new(directory, argv, supervisor, tree.registry())?
        .start()
        .await?;

    let (stop, stopped) = oneshot::channel();
    let task = tokio::spawn(running.serve(async {
        let _ = stopped.await;
    }));
    Ok(ServerTask {
        stop: Some(stop),
        task,
    })
}

/// Script that appends `line` to `log` once
pub fn append_script(log: &Path, line: &str) -> String {
    format!("echo {} >> '{}'", line, log.display())
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Poll `path` until `done` accepts its lines or five seconds pass
pub async fn wait_for_lines(path: &Path, done: impl Fn(&[String]) -> bool) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lines = read_lines(path);
        if done(&lines) || Instant::now() > deadline {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `path` has exactly `count` lines
pub async fn wait_for_count(path: &Path, count: usize) -> Vec<String> {
    let lines = wait_for_lines(path, |lines| lines.len() >= count).await;
    assert_eq!(lines.len(), count, "unexpected log contents: {:?}", lines);
    lines
}
