//! Supervises the group of activated plugin worker processes.

use crate::plugins::package::PluginRecord;
use crate::process::{HealthState, ProcessHandle, StopOutcome};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::stage::{Stage, StageError};
use crate::runtime::telemetry::Telemetry;
use crate::services::health::sleep_with_cancellation;
use anyhow::{Context, Result};
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Raised when the plugin group never becomes fully healthy: names every
/// plugin still unhealthy when the timeout elapsed (or that already died).
#[derive(Debug)]
pub struct GroupStartTimeout {
    pub pending: Vec<String>,
    pub waited: Duration,
}

impl fmt::Display for GroupStartTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plugin group not healthy after {:.1}s, still unhealthy: {}",
            self.waited.as_secs_f64(),
            self.pending.join(", ")
        )
    }
}

impl std::error::Error for GroupStartTimeout {}

/// Non-fatal summary of stops that failed during group teardown.
#[derive(Debug)]
pub struct GroupShutdownError {
    pub failures: Vec<String>,
}

impl fmt::Display for GroupShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to stop plugin processes: {}",
            self.failures.join(", ")
        )
    }
}

impl std::error::Error for GroupShutdownError {}

/// Launches every registered plugin's activation command and watches the
/// resulting process group.
///
/// Activation commands are long-running workers: a process that exits while
/// the group is supposed to be up counts as failed, whatever its exit code.
pub struct ProcessGroupSupervisor {
    poll_interval: Duration,
    log_dir: PathBuf,
    telemetry: Arc<Telemetry>,
    handles: Vec<ProcessHandle>,
    watcher_token: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl ProcessGroupSupervisor {
    pub fn new(poll_interval: Duration, log_dir: PathBuf, telemetry: Arc<Telemetry>) -> Self {
        Self {
            poll_interval,
            log_dir,
            telemetry,
            handles: Vec::new(),
            watcher_token: CancellationToken::new(),
            watcher: None,
        }
    }

    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    /// Spawns every activation command in parallel; each plugin gets its own
    /// log file. A spawn failure is fatal (nothing to supervise), but
    /// everything spawned so far stays managed and will be torn down.
    pub async fn launch_all(&mut self, records: &[PluginRecord]) -> Result<Vec<ProcessHandle>> {
        for record in records {
            let log_path = self.log_dir.join(format!("{}.worker.log", record.name));
            let log = File::create(&log_path).with_context(|| {
                format!("failed to create worker log {}", log_path.display())
            })?;
            let log_err = log.try_clone().context("failed to clone worker log handle")?;

            tracing::info!(plugin = %record.name, command = %record.activation, "activating plugin worker");
            let child = Command::new(&record.activation.program)
                .args(&record.activation.args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err))
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to activate plugin {}", record.name))?;

            let handle = ProcessHandle::new(record.name.clone(), child, log_path);
            self.telemetry.record_worker_launched();
            self.handles.push(handle);
        }
        Ok(self.handles.clone())
    }

    /// Blocks until every launched worker is healthy, a worker dies, or the
    /// timeout elapses. Liveness is the health criterion: a worker that
    /// survives one full poll interval is healthy, one that exited is failed
    /// and fails the whole group immediately.
    pub async fn await_all_healthy(
        &self,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut observed_alive = vec![false; self.handles.len()];

        loop {
            let mut unhealthy = Vec::new();
            let mut any_failed = false;

            for (index, handle) in self.handles.iter().enumerate() {
                match handle.state() {
                    HealthState::Healthy => continue,
                    HealthState::Failed | HealthState::Stopped => {
                        any_failed = true;
                        unhealthy.push(handle.name().to_owned());
                        continue;
                    }
                    HealthState::Starting => {}
                }

                if handle.try_wait().await?.is_some() {
                    handle.set_state(HealthState::Failed);
                    tracing::error!(
                        plugin = handle.name(),
                        log = %handle.log_path().display(),
                        "plugin worker exited before the group came up"
                    );
                    any_failed = true;
                    unhealthy.push(handle.name().to_owned());
                } else if observed_alive[index] {
                    // Second sighting: it survived a full poll interval.
                    handle.set_state(HealthState::Healthy);
                    tracing::debug!(plugin = handle.name(), "plugin worker is healthy");
                } else {
                    observed_alive[index] = true;
                    unhealthy.push(handle.name().to_owned());
                }
            }

            if unhealthy.is_empty() {
                return Ok(());
            }
            if any_failed || Instant::now() >= deadline {
                return Err(GroupStartTimeout {
                    pending: unhealthy,
                    waited: started.elapsed(),
                }
                .into());
            }

            if cancellation.is_cancelled() {
                anyhow::bail!("plugin group startup was cancelled");
            }
            sleep_with_cancellation(self.poll_interval, cancellation).await;
        }
    }

    /// Spawns a background watcher that trips the fatal handler if any
    /// supervised worker dies while the run is still going.
    pub fn spawn_exit_watcher(&mut self, fatal: Arc<FatalErrorHandler>) {
        let handles = self.handles.clone();
        let token = self.watcher_token.clone();
        let interval = self.poll_interval;

        self.watcher = Some(tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                for handle in &handles {
                    if handle.state() != HealthState::Healthy {
                        continue;
                    }
                    match handle.try_wait().await {
                        Ok(Some(status)) => {
                            handle.set_state(HealthState::Failed);
                            fatal.trigger(StageError::new(
                                Stage::Testing,
                                anyhow::anyhow!(
                                    "plugin worker {} exited with {status} while the run was active",
                                    handle.name()
                                ),
                            ));
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(plugin = handle.name(), error = %err, "exit watcher poll failed");
                        }
                    }
                }
                sleep_with_cancellation(interval, &token).await;
            }
        }));
    }

    /// Stops every worker in reverse start order. Best effort: failures are
    /// collected, logged, and never block the remaining stops. Idempotent and
    /// safe after a partial start.
    pub async fn shutdown_all(&mut self) -> Vec<StopOutcome> {
        self.watcher_token.cancel();
        if let Some(watcher) = self.watcher.take() {
            if let Err(err) = watcher.await {
                tracing::warn!(error = %err, "plugin exit watcher task panicked");
            }
        }

        let mut outcomes = Vec::new();
        for handle in self.handles.iter().rev() {
            let name = handle.name().to_owned();
            let result = handle.stop().await;
            if result.is_ok() {
                self.telemetry.record_process_stopped();
            } else {
                tracing::warn!(plugin = %name, "plugin worker stop failed");
            }
            outcomes.push(StopOutcome { name, result });
        }
        self.handles.clear();
        outcomes
    }

    /// Summarizes failed stops as a [`GroupShutdownError`], if any.
    pub fn shutdown_failures(outcomes: &[StopOutcome]) -> Option<GroupShutdownError> {
        let failures: Vec<String> = outcomes
            .iter()
            .filter(|outcome| !outcome.is_ok())
            .map(|outcome| outcome.name.clone())
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(GroupShutdownError { failures })
        }
    }
}
