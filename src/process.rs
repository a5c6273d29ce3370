//! Shared handle for managed child processes.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;

/// Observable lifecycle of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Failed,
    Stopped,
}

impl HealthState {
    fn encode(self) -> u8 {
        match self {
            HealthState::Starting => 0,
            HealthState::Healthy => 1,
            HealthState::Failed => 2,
            HealthState::Stopped => 3,
        }
    }

    fn decode(value: u8) -> Self {
        match value {
            0 => HealthState::Starting,
            1 => HealthState::Healthy,
            2 => HealthState::Failed,
            _ => HealthState::Stopped,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Failed => "failed",
            HealthState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Handle to one spawned service or plugin process.
///
/// Cheaply cloneable; the underlying child is owned once and killed when the
/// last clone drops (children are spawned with `kill_on_drop`). State is only
/// mutated by the component that created the handle.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    pid: Option<u32>,
    log_path: PathBuf,
    state: AtomicU8,
    child: Mutex<Option<Child>>,
}

impl ProcessHandle {
    pub(crate) fn new(name: impl Into<String>, child: Child, log_path: PathBuf) -> Self {
        let pid = child.id();
        Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                pid,
                log_path,
                state: AtomicU8::new(HealthState::Starting.encode()),
                child: Mutex::new(Some(child)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.inner.log_path
    }

    pub fn state(&self) -> HealthState {
        HealthState::decode(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == HealthState::Healthy
    }

    pub(crate) fn set_state(&self, state: HealthState) {
        self.inner.state.store(state.encode(), Ordering::SeqCst);
    }

    /// Non-blocking exit probe. `Ok(None)` means the process is still running
    /// (or was already reaped by [`ProcessHandle::stop`]).
    pub(crate) async fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let mut guard = self.inner.child.lock().await;
        match guard.as_mut() {
            Some(child) => child
                .try_wait()
                .with_context(|| format!("failed to poll process {}", self.inner.name)),
            None => Ok(None),
        }
    }

    /// Kills and reaps the process. Idempotent: a second call (or a call for
    /// a process that already exited) succeeds without doing anything.
    pub async fn stop(&self) -> Result<()> {
        let child = self.inner.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };

        if let Err(err) = child.start_kill() {
            // InvalidInput means the child already exited; anything else is real.
            if err.kind() != std::io::ErrorKind::InvalidInput {
                self.set_state(HealthState::Failed);
                return Err(err)
                    .with_context(|| format!("failed to kill process {}", self.inner.name));
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to reap process {}", self.inner.name))?;
        tracing::debug!(process = %self.inner.name, %status, "process stopped");
        // A handle already marked failed keeps that state; stop only reaps it.
        if self.state() != HealthState::Failed {
            self.set_state(HealthState::Stopped);
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Result of one best-effort stop during teardown.
#[derive(Debug)]
pub struct StopOutcome {
    pub name: String,
    pub result: Result<()>,
}

impl StopOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
