//! Runtime configuration for one orchestration run.

use crate::template::RenderMode;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GROUP_START_TIMEOUT_SECS: u64 = 120;

/// Tunables and paths shared by every component of a run.
///
/// All instances must be constructed via [`OrchestratorConfig::builder`] or
/// [`OrchestratorConfig::new`] so invariants are validated before any
/// consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    poll_interval: Duration,
    group_start_timeout: Duration,
    heartbeat_interval: Duration,
    render_mode: RenderMode,
    work_dir: Option<PathBuf>,
    server_cert: PathBuf,
    coordinator_address: String,
}

pub struct OrchestratorConfigParams {
    pub poll_interval: Duration,
    pub group_start_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub render_mode: RenderMode,
    pub work_dir: Option<PathBuf>,
    pub server_cert: PathBuf,
    pub coordinator_address: String,
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    pub fn new(params: OrchestratorConfigParams) -> Result<Self> {
        let OrchestratorConfigParams {
            poll_interval,
            group_start_timeout,
            heartbeat_interval,
            render_mode,
            work_dir,
            server_cert,
            coordinator_address,
        } = params;

        let config = Self {
            poll_interval,
            group_start_timeout,
            heartbeat_interval,
            render_mode,
            work_dir,
            server_cert,
            coordinator_address: coordinator_address.trim().to_owned(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Interval between health probes and liveness polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// How long the plugin group may take to become fully healthy.
    pub fn group_start_timeout(&self) -> Duration {
        self.group_start_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    /// Root for per-run directories. `None` means a scratch directory owned
    /// by the run and removed with it.
    pub fn work_dir(&self) -> Option<&PathBuf> {
        self.work_dir.as_ref()
    }

    /// Server identity certificate handed to plugin register entry points.
    pub fn server_cert(&self) -> &PathBuf {
        &self.server_cert
    }

    /// Address of the coordinating service plugins register against.
    pub fn coordinator_address(&self) -> &str {
        &self.coordinator_address
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }
        if self.group_start_timeout.is_zero() {
            bail!("group_start_timeout must be greater than 0");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }
        if self.server_cert.as_os_str().is_empty() {
            bail!("server_cert cannot be empty");
        }
        let address = self.coordinator_address.as_str();
        if !(address.starts_with("http://") || address.starts_with("https://")) {
            bail!("coordinator_address must start with http:// or https://");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct OrchestratorConfigBuilder {
    poll_interval: Option<Duration>,
    group_start_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    render_mode: Option<RenderMode>,
    work_dir: Option<PathBuf>,
    server_cert: Option<PathBuf>,
    coordinator_address: Option<String>,
}

impl OrchestratorConfigBuilder {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn group_start_timeout(mut self, timeout: Duration) -> Self {
        self.group_start_timeout = Some(timeout);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn render_mode(mut self, mode: RenderMode) -> Self {
        self.render_mode = Some(mode);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn server_cert(mut self, cert: impl Into<PathBuf>) -> Self {
        self.server_cert = Some(cert.into());
        self
    }

    pub fn coordinator_address(mut self, address: impl Into<String>) -> Self {
        self.coordinator_address = Some(address.into());
        self
    }

    /// Fills unset fields from `TESTRIG_*` environment variables where
    /// present, then falls back to defaults in [`build`](Self::build).
    pub fn env_overrides(mut self) -> Result<Self> {
        if self.poll_interval.is_none() {
            if let Ok(value) = env::var("TESTRIG_POLL_INTERVAL_MS") {
                let millis: u64 = value
                    .parse()
                    .context("TESTRIG_POLL_INTERVAL_MS must be an integer")?;
                self.poll_interval = Some(Duration::from_millis(millis));
            }
        }
        if self.group_start_timeout.is_none() {
            if let Ok(value) = env::var("TESTRIG_GROUP_TIMEOUT_SECS") {
                let secs: u64 = value
                    .parse()
                    .context("TESTRIG_GROUP_TIMEOUT_SECS must be an integer")?;
                self.group_start_timeout = Some(Duration::from_secs(secs));
            }
        }
        if self.work_dir.is_none() {
            if let Ok(value) = env::var("TESTRIG_WORK_DIR") {
                self.work_dir = Some(PathBuf::from(value));
            }
        }
        if self.server_cert.is_none() {
            if let Ok(value) = env::var("TESTRIG_SERVER_CERT") {
                self.server_cert = Some(PathBuf::from(value));
            }
        }
        if self.coordinator_address.is_none() {
            if let Ok(value) = env::var("TESTRIG_COORDINATOR") {
                self.coordinator_address = Some(value);
            }
        }
        Ok(self)
    }

    pub fn build(self) -> Result<OrchestratorConfig> {
        let params = OrchestratorConfigParams {
            poll_interval: self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            group_start_timeout: self
                .group_start_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_GROUP_START_TIMEOUT_SECS)),
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or(super::telemetry::DEFAULT_HEARTBEAT_INTERVAL),
            render_mode: self.render_mode.unwrap_or(RenderMode::Permissive),
            work_dir: self.work_dir,
            server_cert: self.server_cert.context("server_cert is required")?,
            coordinator_address: self
                .coordinator_address
                .context("coordinator_address is required")?,
        };

        OrchestratorConfig::new(params)
    }
}
