//! Starts external services and blocks until they report healthy.

use crate::process::{HealthState, ProcessHandle, StopOutcome};
use crate::runtime::telemetry::Telemetry;
use crate::services::health::{self, WaitOutcome, WaitParams};
use crate::services::spec::{PortRequest, ServiceSpec};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Raised when a service's health check never succeeds within its readiness
/// timeout.
#[derive(Debug)]
pub struct ServiceStartTimeout {
    pub service: String,
    pub waited: Duration,
}

impl fmt::Display for ServiceStartTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {} did not become healthy within {:.1}s",
            self.service,
            self.waited.as_secs_f64()
        )
    }
}

impl std::error::Error for ServiceStartTimeout {}

/// A started service: its process plus the port it actually bound.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub process: ProcessHandle,
    pub port: Option<u16>,
}

/// Launches services one at a time and remembers what it started.
///
/// `start` is idempotent: asking for an already-healthy service returns the
/// existing handle without spawning a second process.
pub struct ServiceLauncher {
    poll_interval: Duration,
    log_dir: PathBuf,
    telemetry: Arc<Telemetry>,
    handles: HashMap<String, ServiceHandle>,
    start_order: Vec<String>,
}

impl ServiceLauncher {
    pub fn new(poll_interval: Duration, log_dir: PathBuf, telemetry: Arc<Telemetry>) -> Self {
        Self {
            poll_interval,
            log_dir,
            telemetry,
            handles: HashMap::new(),
            start_order: Vec::new(),
        }
    }

    pub fn handle(&self, name: &str) -> Option<&ServiceHandle> {
        self.handles.get(name)
    }

    /// Port the named service bound, once it has been started.
    pub fn discovered_port(&self, name: &str) -> Option<u16> {
        self.handles.get(name).and_then(|handle| handle.port)
    }

    /// Spawns the service and polls its health check until ready.
    pub async fn start(
        &mut self,
        spec: &ServiceSpec,
        cancellation: &CancellationToken,
    ) -> Result<ServiceHandle> {
        if let Some(existing) = self.handles.get(spec.name()) {
            if existing.process.is_healthy() {
                tracing::debug!(service = spec.name(), "service already healthy, reusing handle");
                return Ok(existing.clone());
            }
        }

        let port = match spec.port() {
            PortRequest::Unspecified => None,
            PortRequest::Fixed(port) => Some(port),
            PortRequest::Any => {
                let reserved = health::reserve_port()
                    .with_context(|| format!("service {}: port reservation failed", spec.name()))?;
                tracing::info!(service = spec.name(), port = reserved, "reserved dynamic port");
                Some(reserved)
            }
        };
        let vars = match port {
            Some(port) => vec![("port".to_owned(), port.to_string())],
            None => Vec::new(),
        };

        let start = spec.start_command().resolved(&vars);
        let log_path = self.log_dir.join(format!("{}.log", spec.name()));
        let log = File::create(&log_path)
            .with_context(|| format!("failed to create service log {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .context("failed to clone service log handle")?;

        tracing::info!(service = spec.name(), command = %start, "starting service");
        let child = Command::new(&start.program)
            .args(&start.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn service {}", spec.name()))?;

        let process = ProcessHandle::new(spec.name(), child, log_path);
        let health_check = spec.health_check().resolved(&vars);

        let outcome = health::wait_until_healthy(WaitParams {
            name: spec.name(),
            health_check: &health_check,
            deadline: spec.readiness_timeout(),
            interval: self.poll_interval,
            cancellation,
            process: Some(&process),
            telemetry: Some(&self.telemetry),
        })
        .await;

        match outcome {
            Ok(WaitOutcome::Healthy) => {
                process.set_state(HealthState::Healthy);
                self.telemetry.record_service_started();
                tracing::info!(service = spec.name(), ?port, "service is healthy");
                let handle = ServiceHandle { process, port };
                if !self.handles.contains_key(spec.name()) {
                    self.start_order.push(spec.name().to_owned());
                }
                self.handles.insert(spec.name().to_owned(), handle.clone());
                Ok(handle)
            }
            Ok(WaitOutcome::TimedOut { waited }) => {
                process.set_state(HealthState::Failed);
                if let Err(err) = process.stop().await {
                    tracing::warn!(service = spec.name(), error = %err, "cleanup after readiness timeout failed");
                }
                Err(ServiceStartTimeout {
                    service: spec.name().to_owned(),
                    waited,
                }
                .into())
            }
            Ok(WaitOutcome::Cancelled) => {
                process.set_state(HealthState::Stopped);
                let _ = process.stop().await;
                bail!("startup of service {} was cancelled", spec.name());
            }
            Err(err) => {
                process.set_state(HealthState::Failed);
                let _ = process.stop().await;
                Err(err.context(format!("service {} failed during startup", spec.name())))
            }
        }
    }

    /// Stops every started service in reverse start order. Best effort: one
    /// failed stop never blocks the rest.
    pub async fn shutdown_all(&mut self) -> Vec<StopOutcome> {
        let mut outcomes = Vec::new();
        for name in self.start_order.drain(..).rev() {
            let Some(handle) = self.handles.remove(&name) else {
                continue;
            };
            let result = handle.process.stop().await;
            if result.is_ok() {
                self.telemetry.record_process_stopped();
            } else {
                tracing::warn!(service = %name, "service stop failed");
            }
            outcomes.push(StopOutcome { name, result });
        }
        outcomes
    }
}
