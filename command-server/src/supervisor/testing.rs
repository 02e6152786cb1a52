//! In-memory launcher for tests
//!
//! Children never run anything. They record spawn/term/kill calls in a
//! shared log and exit when told to (`finish`) or when terminated.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandSpec, ManagedChild, ProcessLauncher};

#[derive(Default)]
struct Shared {
    log: Mutex<Vec<String>>,
    spawned: Mutex<Vec<Vec<String>>>,
    exits: Mutex<HashMap<u32, i32>>,
    next_pid: AtomicU32,
    fail: AtomicBool,
    ignore_terminate: AtomicBool,
    terminate_delay_ms: AtomicU32,
}

impl Shared {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn exit_code(&self, pid: u32) -> Option<i32> {
        self.exits.lock().unwrap().get(&pid).copied()
    }

    fn set_exit(&self, pid: u32, code: i32) {
        self.exits.lock().unwrap().entry(pid).or_insert(code);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    shared: Arc<Shared>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_launches(&self, fail: bool) {
        self.shared.fail.store(fail, Ordering::SeqCst);
    }

    /// Children ignore SIGTERM and only die on kill
    pub(crate) fn ignore_terminate(&self, ignore: bool) {
        self.shared.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    /// Children take this long to exit after SIGTERM
    pub(crate) fn terminate_delay(&self, delay: Duration) {
        self.shared
            .terminate_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// Make child `pid` exit on its own
    pub(crate) fn finish(&self, pid: u32, code: i32) {
        self.shared.set_exit(pid, code);
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub(crate) fn spawned(&self) -> Vec<Vec<String>> {
        self.shared.spawned.lock().unwrap().clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn ManagedChild>> {
        if self.shared.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", spec.program()),
            ));
        }

        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.spawned.lock().unwrap().push(spec.argv().to_vec());
        self.shared.record(format!("spawn {}", pid));

        Ok(Box::new(FakeChild {
            pid,
            terminated: false,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeChild {
    pid: u32,
    terminated: bool,
    shared: Arc<Shared>,
}

#[async_trait]
impl ManagedChild for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.shared.exit_code(self.pid))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.shared.record(format!("term {}", self.pid));
        self.terminated = true;
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.shared.record(format!("kill {}", self.pid));
        self.shared.set_exit(self.pid, 137);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.shared.exit_code(self.pid) {
            return Ok(code);
        }
        if self.terminated && !self.shared.ignore_terminate.load(Ordering::SeqCst) {
            let delay = self.shared.terminate_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            self.shared.record(format!("exit {}", self.pid));
            self.shared.set_exit(self.pid, 143);
            return Ok(143);
        }
        std::future::pending().await
    }
}
