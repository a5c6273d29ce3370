//! Runs the integration test suite against the live environment.

use crate::runtime::context::RunContext;
use crate::runtime::telemetry::Telemetry;
use crate::services::spec::CommandSpec;
use anyhow::{bail, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// The suite itself could not execute. Distinct from tests failing: a failing
/// suite still produces a [`TestReport`] with its own exit code.
#[derive(Debug)]
pub struct TestRunnerError {
    pub detail: String,
}

impl fmt::Display for TestRunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test suite could not execute: {}", self.detail)
    }
}

impl std::error::Error for TestRunnerError {}

/// Outcome of one suite invocation. The exit code is the suite's own,
/// propagated verbatim; individual failures are the test tool's business.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub passed: u32,
    pub failed: u32,
    pub coverage: Option<f64>,
    pub exit_code: i32,
}

impl TestReport {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct TestRunner {
    log_dir: PathBuf,
    telemetry: Arc<Telemetry>,
}

impl TestRunner {
    pub fn new(log_dir: PathBuf, telemetry: Arc<Telemetry>) -> Self {
        Self { log_dir, telemetry }
    }

    /// Executes the suite with the run's environment exported, captures its
    /// output to a log file, and parses the summary counters out of it.
    /// Cancelling the run kills the suite instead of letting it finish.
    pub async fn run(
        &self,
        suite: &CommandSpec,
        ctx: &RunContext,
        cancellation: &CancellationToken,
    ) -> Result<TestReport> {
        tracing::info!(command = %suite, "running test suite");

        let child = Command::new(&suite.program)
            .args(&suite.args)
            .envs(ctx.suite_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TestRunnerError {
                detail: format!("could not run `{suite}`: {err}"),
            })?;

        // Dropping the wait future drops the child, which kills the suite.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|err| TestRunnerError {
                detail: format!("could not collect output of `{suite}`: {err}"),
            })?,
            _ = cancellation.cancelled() => {
                tracing::warn!(command = %suite, "run cancelled, killing test suite");
                bail!("test suite was cancelled");
            }
        };

        let log_path = self.log_dir.join("suite.log");
        let mut captured = output.stdout.clone();
        captured.extend_from_slice(&output.stderr);
        if let Err(err) = fs::write(&log_path, &captured) {
            tracing::warn!(error = %err, "failed to write suite log");
        }

        let text = String::from_utf8_lossy(&captured);
        let (passed, failed, coverage) = parse_summary(&text);
        let exit_code = output.status.code().unwrap_or(-1);
        self.telemetry.record_suite_run();

        let report = TestReport {
            passed,
            failed,
            coverage,
            exit_code,
        };
        tracing::info!(
            passed = report.passed,
            failed = report.failed,
            coverage = ?report.coverage,
            exit_code = report.exit_code,
            "test suite finished"
        );
        Ok(report)
    }
}

/// Scans suite output for `N passed`, `N failed`, and `coverage: X%` tokens.
/// Permissive on purpose: suites that print nothing recognizable still get a
/// report carrying their exit code.
fn parse_summary(text: &str) -> (u32, u32, Option<f64>) {
    let mut passed = 0;
    let mut failed = 0;
    let mut coverage = None;

    let tokens: Vec<&str> = text.split_whitespace().collect();
    for window in tokens.windows(2) {
        let [first, second] = window else { continue };
        let first_number = first
            .trim_matches(|c: char| !c.is_ascii_digit())
            .parse::<u32>();
        match (first_number, *second) {
            (Ok(count), word) if word.starts_with("passed") => passed = count,
            (Ok(count), word) if word.starts_with("failed") => failed = count,
            _ => {}
        }
        if first.trim_end_matches(':').eq_ignore_ascii_case("coverage") {
            let value = second.trim_end_matches('%');
            if let Ok(percent) = value.parse::<f64>() {
                coverage = Some(percent);
            }
        }
    }

    (passed, failed, coverage)
}
