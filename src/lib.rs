pub mod plugins;
pub mod process;
pub mod runtime;
pub mod services;
pub mod template;
pub mod testsuite;

pub use plugins::package::{PluginPackage, PluginRecord};
pub use plugins::registrar::{InstallOutcome, PluginInstallError, PluginRegisterError, PluginRegistrar};
pub use plugins::registry::PluginRegistry;
pub use plugins::supervisor::{GroupShutdownError, GroupStartTimeout, ProcessGroupSupervisor};
pub use process::{HealthState, ProcessHandle, StopOutcome};
pub use runtime::config::{OrchestratorConfig, OrchestratorConfigBuilder, OrchestratorConfigParams};
pub use runtime::context::RunContext;
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::orchestrator::{OrchestrationPlan, Orchestrator, RenderPhase, TemplateSpec};
pub use runtime::runner::Runner;
pub use runtime::stage::{Stage, StageError};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use services::health::reserve_port;
pub use services::launcher::{ServiceHandle, ServiceLauncher, ServiceStartTimeout};
pub use services::spec::{CommandSpec, PortRequest, ServiceSpec, ServiceSpecBuilder};
pub use template::{render, Placeholder, RenderMode, Substitutions, TemplateError};
pub use testsuite::{TestReport, TestRunner, TestRunnerError};
