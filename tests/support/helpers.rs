#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use testrig::{CommandSpec, OrchestratorConfig};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Shell one-liner as a command spec.
pub fn sh(script: impl Into<String>) -> CommandSpec {
    CommandSpec::new("/bin/sh", ["-c".to_owned(), script.into()])
}

/// Fast-polling config rooted in the given scratch directory.
pub fn test_config(work_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig::builder()
        .poll_interval(Duration::from_millis(50))
        .work_dir(work_dir)
        .server_cert(work_dir.join("server.pem"))
        .coordinator_address("https://localhost:21174")
        .build()
        .expect("test config must validate")
}

pub async fn wait_until(
    what: &str,
    timeout: Duration,
    condition: impl Fn() -> bool,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("waited {:?} for {what}", timeout);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_file(path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if path.exists() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("file {} did not appear within {:?}", path.display(), timeout);
        }
        sleep(Duration::from_millis(20)).await;
    }
}
