//! The staged run: template configs, launch services, install plugins,
//! supervise workers, run the suite, tear everything down.

use crate::plugins::package::PluginPackage;
use crate::plugins::registrar::PluginRegistrar;
use crate::plugins::registry::PluginRegistry;
use crate::plugins::supervisor::ProcessGroupSupervisor;
use crate::runtime::config::OrchestratorConfig;
use crate::runtime::context::RunContext;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::stage::{Stage, StageError};
use crate::runtime::telemetry::{self, Telemetry};
use crate::services::launcher::ServiceLauncher;
use crate::services::spec::{CommandSpec, ServiceSpec};
use crate::template::{self, Placeholder, Substitutions};
use crate::testsuite::{TestReport, TestRunner};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// When a template gets rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPhase {
    /// At `INIT`, with static values only.
    Initial,
    /// After `SERVICES_READY`, when dynamically discovered ports are known.
    AfterServices,
}

/// One template to render into the run's config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub template: PathBuf,
    /// Target path relative to the run's config directory.
    pub target: PathBuf,
    pub phase: RenderPhase,
}

/// Everything one run orchestrates. Services are started in declaration
/// order; plugins install concurrently.
pub struct OrchestrationPlan {
    pub services: Vec<ServiceSpec>,
    pub templates: Vec<TemplateSpec>,
    pub plugins: Vec<PluginPackage>,
    pub suite: CommandSpec,
    pub static_values: Substitutions,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    plan: OrchestrationPlan,
    ctx: RunContext,
    telemetry: Arc<Telemetry>,
    stage: Stage,
    launcher: ServiceLauncher,
    supervisor: ProcessGroupSupervisor,
    registrar: PluginRegistrar,
    runner: TestRunner,
    report: Option<TestReport>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, plan: OrchestrationPlan) -> Result<Self> {
        let ctx = RunContext::create(&config)?;
        let telemetry = Arc::new(Telemetry::default());
        let registry = PluginRegistry::open(ctx.registry_dir())?;

        let launcher = ServiceLauncher::new(
            config.poll_interval(),
            ctx.log_dir().to_path_buf(),
            telemetry.clone(),
        );
        let supervisor = ProcessGroupSupervisor::new(
            config.poll_interval(),
            ctx.log_dir().to_path_buf(),
            telemetry.clone(),
        );
        let registrar = PluginRegistrar::new(
            registry,
            ctx.log_dir().to_path_buf(),
            telemetry.clone(),
        );
        let runner = TestRunner::new(ctx.log_dir().to_path_buf(), telemetry.clone());

        Ok(Self {
            config,
            plan,
            ctx,
            telemetry,
            stage: Stage::Init,
            launcher,
            supervisor,
            registrar,
            runner,
            report: None,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn report(&self) -> Option<&TestReport> {
        self.report.as_ref()
    }

    /// Final process exit code for the run's current state: the suite's own
    /// exit code after a completed run, `1` after an abort.
    pub fn exit_code(&self) -> i32 {
        match (self.stage, &self.report) {
            (Stage::Done, Some(report)) => report.exit_code,
            _ => 1,
        }
    }

    /// Drives the full state machine. Teardown always runs, on success and
    /// on abort alike, so no managed process outlives the call.
    pub async fn run(&mut self, cancellation: CancellationToken) -> Result<TestReport> {
        let run_token = cancellation.child_token();
        let fatal = Arc::new(FatalErrorHandler::new(run_token.clone()));
        let heartbeat_token = run_token.child_token();
        let heartbeat = telemetry::spawn_heartbeat_reporter(
            self.telemetry.clone(),
            heartbeat_token.clone(),
            self.config.heartbeat_interval(),
        );

        let result = self.advance(&run_token, &fatal).await;

        self.teardown().await;
        heartbeat_token.cancel();
        if let Err(err) = heartbeat.await {
            tracing::warn!(error = %err, "heartbeat reporter task panicked");
        }

        match result {
            Ok(report) => {
                self.set_stage(Stage::Done);
                self.report = Some(report.clone());
                Ok(report)
            }
            Err(err) => {
                self.set_stage(Stage::Aborted);
                tracing::error!(
                    stage = %err.stage(),
                    error = format!("{:#}", err.source_ref()),
                    "orchestration aborted"
                );
                Err(err.into())
            }
        }
    }

    async fn advance(
        &mut self,
        run_token: &CancellationToken,
        fatal: &Arc<FatalErrorHandler>,
    ) -> std::result::Result<TestReport, FailedStage> {
        // INIT: render everything that only needs static values.
        let mut substitutions = self.base_substitutions();
        self.render_phase(RenderPhase::Initial, &substitutions)
            .map_err(|err| FailedStage::new(Stage::Init, err))?;

        self.set_stage(Stage::ServicesStarting);
        let services = self.plan.services.clone();
        for spec in &services {
            let handle = self
                .launcher
                .start(spec, run_token)
                .await
                .map_err(|err| FailedStage::new(Stage::ServicesStarting, err))?;
            if let (Some(port), Some(placeholder)) = (handle.port, spec.port_placeholder()) {
                substitutions.set(placeholder, port.to_string());
            }
        }

        self.set_stage(Stage::ServicesReady);
        self.render_phase(RenderPhase::AfterServices, &substitutions)
            .map_err(|err| FailedStage::new(Stage::ServicesReady, err))?;

        self.set_stage(Stage::PluginsInstalling);
        let extra_vars = self.service_port_vars();
        let outcomes = self
            .registrar
            .install_all(&self.plan.plugins, &self.ctx, &extra_vars)
            .await;
        let mut records = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(record) => records.push(record),
                Err(err) => failures.push(format!("{}: {err:#}", outcome.plugin)),
            }
        }
        if !failures.is_empty() {
            return Err(FailedStage::new(
                Stage::PluginsInstalling,
                anyhow!("plugin installation failed: {}", failures.join("; ")),
            ));
        }

        self.supervisor
            .launch_all(&records)
            .await
            .map_err(|err| FailedStage::new(Stage::PluginsInstalling, err))?;
        self.supervisor
            .await_all_healthy(self.config.group_start_timeout(), run_token)
            .await
            .map_err(|err| FailedStage::new(Stage::PluginsInstalling, err))?;

        self.set_stage(Stage::PluginsReady);
        self.supervisor.spawn_exit_watcher(fatal.clone());

        self.set_stage(Stage::Testing);
        let report = match self.runner.run(&self.plan.suite, &self.ctx, run_token).await {
            Ok(report) => report,
            Err(err) => {
                // A dead worker cancels the run and is the failure worth
                // reporting, not the suite it interrupted.
                if let Some(captured) = fatal.error() {
                    return Err(FailedStage::new(captured.stage(), anyhow!("{captured}")));
                }
                return Err(FailedStage::new(Stage::Testing, err));
            }
        };

        if let Some(captured) = fatal.error() {
            return Err(FailedStage::new(
                captured.stage(),
                anyhow!("{captured}"),
            ));
        }

        Ok(report)
    }

    fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::info!(stage = %stage, "orchestration stage");
    }

    /// Values known before any service starts.
    fn base_substitutions(&self) -> Substitutions {
        let mut substitutions = self.plan.static_values.clone();
        if substitutions.get(Placeholder::ConfigDir).is_none() {
            substitutions.set(Placeholder::ConfigDir, self.ctx.config_dir().display().to_string());
        }
        if substitutions.get(Placeholder::RegistryDir).is_none() {
            substitutions.set(
                Placeholder::RegistryDir,
                self.ctx.registry_dir().display().to_string(),
            );
        }
        if substitutions.get(Placeholder::ServerCert).is_none() {
            substitutions.set(
                Placeholder::ServerCert,
                self.ctx.server_cert().display().to_string(),
            );
        }
        if substitutions.get(Placeholder::CoordinatorAddress).is_none() {
            substitutions.set(
                Placeholder::CoordinatorAddress,
                self.ctx.coordinator_address().to_owned(),
            );
        }
        substitutions
    }

    /// `{<service>_port}` tokens for plugin commands.
    fn service_port_vars(&self) -> Vec<(String, String)> {
        self.plan
            .services
            .iter()
            .filter_map(|spec| {
                self.launcher
                    .discovered_port(spec.name())
                    .map(|port| (format!("{}_port", spec.name()), port.to_string()))
            })
            .collect()
    }

    fn render_phase(&self, phase: RenderPhase, substitutions: &Substitutions) -> Result<()> {
        for spec in self.plan.templates.iter().filter(|t| t.phase == phase) {
            let target = self.ctx.config_dir().join(&spec.target);
            template::render(&spec.template, &target, substitutions, self.config.render_mode())?;
            tracing::info!(
                template = %spec.template.display(),
                target = %target.display(),
                phase = ?phase,
                "rendered config"
            );
        }
        Ok(())
    }

    /// Stops everything in reverse dependency order: plugin workers first,
    /// then services. Best effort; failures are logged and collected, never
    /// allowed to block the remaining stops.
    async fn teardown(&mut self) {
        let plugin_outcomes = self.supervisor.shutdown_all().await;
        if let Some(err) = ProcessGroupSupervisor::shutdown_failures(&plugin_outcomes) {
            tracing::warn!(error = %err, "plugin group teardown was incomplete");
        }

        let service_outcomes = self.launcher.shutdown_all().await;
        for outcome in &service_outcomes {
            if let Err(err) = &outcome.result {
                tracing::warn!(service = %outcome.name, error = format!("{err:#}"), "service teardown failed");
            }
        }

        tracing::info!(
            plugins_stopped = plugin_outcomes.iter().filter(|o| o.is_ok()).count(),
            services_stopped = service_outcomes.iter().filter(|o| o.is_ok()).count(),
            "teardown complete"
        );
    }
}

/// Internal carrier pairing a failure with the stage it happened in.
struct FailedStage {
    stage: Stage,
    source: anyhow::Error,
}

impl FailedStage {
    fn new(stage: Stage, source: anyhow::Error) -> Self {
        Self { stage, source }
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn source_ref(&self) -> &anyhow::Error {
        &self.source
    }
}

impl From<FailedStage> for anyhow::Error {
    fn from(failed: FailedStage) -> Self {
        StageError::new(failed.stage, failed.source).into()
    }
}
