//! Bounded health probing and port reservation.

use crate::process::ProcessHandle;
use crate::runtime::telemetry::Telemetry;
use crate::services::spec::CommandSpec;
use anyhow::{bail, Context, Result};
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Reserves a free port by binding `127.0.0.1:0` and reading back what the
/// OS assigned. The listener is dropped immediately; the service is expected
/// to bind the port right after.
pub fn reserve_port() -> Result<u16> {
    let socket =
        TcpListener::bind("127.0.0.1:0").context("failed to bind temporary socket for port reservation")?;
    let port = socket
        .local_addr()
        .context("failed to read reserved socket address")?
        .port();
    Ok(port)
}

/// Runs the health-check command once. Zero exit means healthy. The probe is
/// bounded: a command still running when `bound` elapses (or when the run is
/// cancelled) is killed and counts as unhealthy.
pub(crate) async fn probe_once(
    command: &CommandSpec,
    bound: Duration,
    cancellation: &CancellationToken,
) -> Result<bool> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to run health check `{command}`"))?;

    tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("failed to reap health check `{command}`"))?;
            Ok(status.success())
        }
        _ = sleep(bound) => {
            tracing::warn!(command = %command, "health check still running at its bound, killing it");
            let _ = child.start_kill();
            Ok(false)
        }
        _ = cancellation.cancelled() => {
            let _ = child.start_kill();
            Ok(false)
        }
    }
}

pub(crate) enum WaitOutcome {
    Healthy,
    TimedOut { waited: Duration },
    Cancelled,
}

pub(crate) struct WaitParams<'a> {
    pub name: &'a str,
    pub health_check: &'a CommandSpec,
    pub deadline: Duration,
    pub interval: Duration,
    pub cancellation: &'a CancellationToken,
    /// When set, an early exit of this process fails the wait instead of
    /// letting it poll until the deadline.
    pub process: Option<&'a ProcessHandle>,
    pub telemetry: Option<&'a Telemetry>,
}

/// Polls the health-check command until it succeeds, the deadline elapses,
/// or the run is cancelled. Each probe is itself a bounded subprocess call.
pub(crate) async fn wait_until_healthy(params: WaitParams<'_>) -> Result<WaitOutcome> {
    let started = Instant::now();
    let deadline = started + params.deadline;

    loop {
        if params.cancellation.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }

        if let Some(handle) = params.process {
            if let Some(status) = handle.try_wait().await? {
                bail!(
                    "{} exited with status {status} before becoming healthy (log: {})",
                    params.name,
                    handle.log_path().display()
                );
            }
        }

        if let Some(telemetry) = params.telemetry {
            telemetry.record_health_probe();
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if probe_once(params.health_check, remaining, params.cancellation).await? {
            return Ok(WaitOutcome::Healthy);
        }

        if Instant::now() >= deadline {
            return Ok(WaitOutcome::TimedOut {
                waited: started.elapsed(),
            });
        }

        sleep_with_cancellation(params.interval, params.cancellation).await;
    }
}

pub(crate) async fn sleep_with_cancellation(delay: Duration, cancellation: &CancellationToken) {
    tokio::select! {
        _ = cancellation.cancelled() => {}
        _ = sleep(delay) => {}
    }
}
