//! `testrig` entry point: reads an orchestration plan, brings the
//! environment up, runs the suite, and exits with the suite's own code (or
//! `1` when any stage aborts).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::process::exit;
use std::time::Duration;
use testrig::{
    init_tracing, CommandSpec, OrchestrationPlan, OrchestratorConfig, Placeholder, PluginPackage,
    PortRequest, Runner, ServiceSpec, Substitutions, TemplateSpec,
};

#[derive(Deserialize)]
struct PlanFile {
    #[serde(default)]
    services: Vec<PlanService>,
    #[serde(default)]
    templates: Vec<TemplateSpec>,
    #[serde(default)]
    plugins: Vec<PluginPackage>,
    suite: CommandSpec,
    #[serde(default)]
    values: BTreeMap<Placeholder, String>,
}

#[derive(Deserialize)]
struct PlanService {
    name: String,
    start: CommandSpec,
    health_check: CommandSpec,
    #[serde(default)]
    readiness_timeout_secs: Option<u64>,
    #[serde(default)]
    port: Option<PlanPort>,
    #[serde(default)]
    port_placeholder: Option<Placeholder>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanPort {
    Fixed(u16),
    Keyword(String),
}

fn service_spec(service: PlanService) -> Result<ServiceSpec> {
    let mut builder = ServiceSpec::builder(&service.name)
        .start_command(service.start)
        .health_check(service.health_check);

    if let Some(secs) = service.readiness_timeout_secs {
        builder = builder.readiness_timeout(Duration::from_secs(secs));
    }
    match service.port {
        None => {}
        Some(PlanPort::Fixed(port)) => builder = builder.port(PortRequest::Fixed(port)),
        Some(PlanPort::Keyword(keyword)) if keyword == "any" => {
            builder = builder.port(PortRequest::Any)
        }
        Some(PlanPort::Keyword(keyword)) => {
            bail!("service {}: unknown port keyword `{keyword}`", service.name)
        }
    }
    if let Some(placeholder) = service.port_placeholder {
        builder = builder.port_placeholder(placeholder);
    }

    builder.build()
}

fn build_plan(file: PlanFile) -> Result<OrchestrationPlan> {
    let services = file
        .services
        .into_iter()
        .map(service_spec)
        .collect::<Result<Vec<_>>>()?;

    let mut static_values = Substitutions::new();
    for (placeholder, value) in file.values {
        static_values.set(placeholder, value);
    }

    Ok(OrchestrationPlan {
        services,
        templates: file.templates,
        plugins: file.plugins,
        suite: file.suite,
        static_values,
    })
}

async fn run() -> Result<i32> {
    let plan_path =
        env::var("TESTRIG_PLAN").context("TESTRIG_PLAN must point to an orchestration plan")?;
    let body = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("failed to read plan file {plan_path}"))?;
    let plan_file: PlanFile = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse plan file {plan_path}"))?;

    let config = OrchestratorConfig::builder().env_overrides()?.build()?;
    let plan = build_plan(plan_file)?;

    let mut runner = Runner::new(config, plan)?;
    match runner.run_until_ctrl_c().await {
        Ok(report) => {
            tracing::info!(
                passed = report.passed,
                failed = report.failed,
                coverage = ?report.coverage,
                exit_code = report.exit_code,
                "orchestration complete"
            );
        }
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "orchestration run failed");
        }
    }
    Ok(runner.exit_code())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "testrig could not start");
            1
        }
    };
    exit(code);
}
