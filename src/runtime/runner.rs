//! Lifecycle wrapper handling OS signals around one orchestration run.

use crate::runtime::config::OrchestratorConfig;
use crate::runtime::orchestrator::{OrchestrationPlan, Orchestrator};
use crate::testsuite::TestReport;
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Owns the root [`CancellationToken`] and the orchestrator; Ctrl-C cancels
/// the run, which still tears down everything it started before returning.
pub struct Runner {
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(config: OrchestratorConfig, plan: OrchestrationPlan) -> Result<Self> {
        let orchestrator = Orchestrator::new(config, plan)?;
        Ok(Self {
            orchestrator,
            shutdown: CancellationToken::new(),
        })
    }

    /// Clone of the root shutdown token so external callers can integrate
    /// their own cancellation strategy.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs the orchestration to completion, ignoring signals. Useful for
    /// embedding in tests or a larger host.
    pub async fn run(&mut self) -> Result<TestReport> {
        self.orchestrator.run(self.shutdown.clone()).await
    }

    /// Runs the orchestration; a Ctrl-C (SIGINT) during the run cancels it
    /// and the run aborts after teardown.
    pub async fn run_until_ctrl_c(&mut self) -> Result<TestReport> {
        let signal_token = self.shutdown.clone();
        let done = CancellationToken::new();
        let done_guard = done.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("Ctrl-C received; cancelling orchestration");
                    signal_token.cancel();
                }
                _ = done_guard.cancelled() => {}
            }
        });

        let result = self.orchestrator.run(self.shutdown.clone()).await;

        done.cancel();
        if let Err(err) = watcher.await {
            tracing::warn!(error = %err, "signal watcher task panicked");
        }
        result
    }

    /// Final process exit code for the run.
    pub fn exit_code(&self) -> i32 {
        self.orchestrator.exit_code()
    }
}
