//! Tracing setup and run-level counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval for the orchestration heartbeat log line.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// Honours `RUST_LOG` when present, otherwise falls back to `info`. Calling
/// this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters describing what the orchestrator has done so far.
#[derive(Default, Debug)]
pub struct Telemetry {
    services_started: AtomicU64,
    health_probes: AtomicU64,
    plugins_installed: AtomicU64,
    plugin_failures: AtomicU64,
    workers_launched: AtomicU64,
    processes_stopped: AtomicU64,
    suites_run: AtomicU64,
}

impl Telemetry {
    pub fn record_service_started(&self) {
        self.services_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_probe(&self) {
        self.health_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plugin_installed(&self) {
        self.plugins_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plugin_failure(&self) {
        self.plugin_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_launched(&self) {
        self.workers_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_stopped(&self) {
        self.processes_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suite_run(&self) {
        self.suites_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn services_started(&self) -> u64 {
        self.services_started.load(Ordering::Relaxed)
    }

    pub fn health_probes(&self) -> u64 {
        self.health_probes.load(Ordering::Relaxed)
    }

    pub fn plugins_installed(&self) -> u64 {
        self.plugins_installed.load(Ordering::Relaxed)
    }

    pub fn plugin_failures(&self) -> u64 {
        self.plugin_failures.load(Ordering::Relaxed)
    }

    pub fn workers_launched(&self) -> u64 {
        self.workers_launched.load(Ordering::Relaxed)
    }

    pub fn processes_stopped(&self) -> u64 {
        self.processes_stopped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            services_started: self.services_started.load(Ordering::Relaxed),
            health_probes: self.health_probes.load(Ordering::Relaxed),
            plugins_installed: self.plugins_installed.load(Ordering::Relaxed),
            plugin_failures: self.plugin_failures.load(Ordering::Relaxed),
            workers_launched: self.workers_launched.load(Ordering::Relaxed),
            processes_stopped: self.processes_stopped.load(Ordering::Relaxed),
            suites_run: self.suites_run.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub services_started: u64,
    pub health_probes: u64,
    pub plugins_installed: u64,
    pub plugin_failures: u64,
    pub workers_launched: u64,
    pub processes_stopped: u64,
    pub suites_run: u64,
}

/// Spawns a background task that periodically logs the run's counters until
/// the token is cancelled.
pub fn spawn_heartbeat_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the log starts quiet.
        ticker.tick().await;

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "testrig::heartbeat", "heartbeat reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = telemetry.snapshot();
                    tracing::info!(
                        target: "testrig::heartbeat",
                        services = snapshot.services_started,
                        probes = snapshot.health_probes,
                        plugins = snapshot.plugins_installed,
                        plugin_failures = snapshot.plugin_failures,
                        workers = snapshot.workers_launched,
                        stopped = snapshot.processes_stopped,
                        "orchestration heartbeat"
                    );
                }
            }
        }
    })
}
