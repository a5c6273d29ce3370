mod support;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{init_tracing, sh, test_config};
use anyhow::Result;
use testrig::{
    OrchestrationPlan, Placeholder, PluginInstallError, PluginPackage, PluginRegistrar,
    PluginRegistry, PortRequest, RenderPhase, RunContext, Runner, ServiceLauncher, ServiceSpec,
    ServiceStartTimeout, Stage, StageError, Substitutions, Telemetry, TemplateSpec,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_run_wires_discovered_port_through_configs_and_plugins() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;
    let root = work.path();
    fs::write(root.join("server.pem"), "test cert")?;

    let template_dir = root.join("templates");
    fs::create_dir_all(&template_dir)?;
    fs::write(template_dir.join("base.conf.tmpl"), "cert = @@SERVER_CERT@@\n")?;
    fs::write(
        template_dir.join("database.conf.tmpl"),
        "port = @@DATABASE_PORT@@\n",
    )?;

    let db_port_file = root.join("db.port");
    let database = ServiceSpec::builder("database")
        .start_command(sh(format!(
            "echo {{port}} > {} && exec sleep 30",
            db_port_file.display()
        )))
        .health_check(sh(format!("test -f {}", db_port_file.display())))
        .port(PortRequest::Any)
        .port_placeholder(Placeholder::DatabasePort)
        .build()?;

    let worker_port_file = root.join("worker.port");
    let plugin = PluginPackage {
        name: "qc-filter".to_owned(),
        source: root.join("qc-filter.tar.gz").display().to_string(),
        install: sh("touch {install_dir}/installed"),
        register: sh("test -f {server_cert} && echo {coordinator} > {install_dir}/registered"),
        activate: sh(format!(
            "echo {{database_port}} > {} && exec sleep 30",
            worker_port_file.display()
        )),
    };

    let plan = OrchestrationPlan {
        services: vec![database],
        templates: vec![
            TemplateSpec {
                template: template_dir.join("base.conf.tmpl"),
                target: "base.conf".into(),
                phase: RenderPhase::Initial,
            },
            TemplateSpec {
                template: template_dir.join("database.conf.tmpl"),
                target: "database.conf".into(),
                phase: RenderPhase::AfterServices,
            },
        ],
        plugins: vec![plugin],
        suite: sh("echo '3 passed, 0 failed'; echo 'coverage: 91%'"),
        static_values: Substitutions::new(),
    };

    let mut runner = Runner::new(test_config(root), plan)?;
    let report = runner.run().await?;

    assert_eq!(report.passed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.coverage, Some(91.0));
    assert!(report.success());
    assert_eq!(runner.orchestrator().stage(), Stage::Done);
    assert_eq!(runner.exit_code(), 0);

    let port = fs::read_to_string(&db_port_file)?.trim().to_owned();
    assert!(!port.is_empty(), "service should receive a concrete port");

    let config_dir = runner.orchestrator().context().config_dir().to_path_buf();
    let base = fs::read_to_string(config_dir.join("base.conf"))?;
    assert!(base.contains("server.pem"), "initial render should fill the certificate path");
    let database_conf = fs::read_to_string(config_dir.join("database.conf"))?;
    assert_eq!(database_conf.trim(), format!("port = {port}"));

    let worker_port = fs::read_to_string(&worker_port_file)?.trim().to_owned();
    assert_eq!(worker_port, port, "activation command should carry the discovered port");

    let registry = PluginRegistry::open(runner.orchestrator().context().registry_dir())?;
    let record = registry.load("qc-filter")?;
    assert!(record.activation.args[1].contains(port.as_str()));

    let snapshot = runner.orchestrator().telemetry().snapshot();
    assert_eq!(snapshot.services_started, 1);
    assert_eq!(snapshot.plugins_installed, 1);
    assert_eq!(snapshot.workers_launched, 1);
    assert_eq!(snapshot.suites_run, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unhealthy_service_aborts_before_plugins_install() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;
    let root = work.path();

    let marker = root.join("installed.marker");
    let cache = ServiceSpec::builder("cache")
        .start_command(sh("exec sleep 30"))
        .health_check(sh("false"))
        .readiness_timeout(Duration::from_millis(300))
        .build()?;
    let plugin = PluginPackage {
        name: "qc-filter".to_owned(),
        source: "qc-filter".to_owned(),
        install: sh(format!("touch {}", marker.display())),
        register: sh("true"),
        activate: sh("exec sleep 30"),
    };

    let plan = OrchestrationPlan {
        services: vec![cache],
        templates: Vec::new(),
        plugins: vec![plugin],
        suite: sh("echo 'should never run'"),
        static_values: Substitutions::new(),
    };

    let mut runner = Runner::new(test_config(root), plan)?;
    let err = runner
        .run()
        .await
        .expect_err("an unhealthy service must abort the run");

    let stage_err = err.downcast_ref::<StageError>().expect("stage-tagged error");
    assert_eq!(stage_err.stage(), Stage::ServicesStarting);
    assert!(format!("{err:#}").contains("did not become healthy"));

    assert_eq!(runner.orchestrator().stage(), Stage::Aborted);
    assert_eq!(runner.exit_code(), 1);
    assert!(!marker.exists(), "no plugin may install after a service abort");
    let snapshot = runner.orchestrator().telemetry().snapshot();
    assert_eq!(snapshot.plugins_installed, 0);
    assert_eq!(snapshot.suites_run, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hanging_health_check_still_hits_the_readiness_timeout() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;
    let spec = ServiceSpec::builder("proxy")
        .start_command(sh("exec sleep 30"))
        .health_check(sh("sleep 1000"))
        .readiness_timeout(Duration::from_millis(200))
        .build()?;

    let telemetry = Arc::new(Telemetry::default());
    let mut launcher = ServiceLauncher::new(
        Duration::from_millis(50),
        work.path().to_path_buf(),
        telemetry,
    );
    let token = CancellationToken::new();

    let result = timeout(Duration::from_secs(3), launcher.start(&spec, &token))
        .await
        .expect("start must give up once the readiness timeout elapses");
    let err = result.expect_err("a health check that never answers must time out");
    assert!(err.downcast_ref::<ServiceStartTimeout>().is_some());

    launcher.shutdown_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_plugin_install_aborts_the_run() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;

    let plugin = PluginPackage {
        name: "broken".to_owned(),
        source: "broken".to_owned(),
        install: sh("exit 1"),
        register: sh("true"),
        activate: sh("exec sleep 30"),
    };
    let plan = OrchestrationPlan {
        services: Vec::new(),
        templates: Vec::new(),
        plugins: vec![plugin],
        suite: sh("echo 'should never run'"),
        static_values: Substitutions::new(),
    };

    let mut runner = Runner::new(test_config(work.path()), plan)?;
    let err = runner
        .run()
        .await
        .expect_err("a failed plugin install must abort the run");

    let stage_err = err.downcast_ref::<StageError>().expect("stage-tagged error");
    assert_eq!(stage_err.stage(), Stage::PluginsInstalling);
    assert!(format!("{err:#}").contains("broken"));

    assert_eq!(runner.orchestrator().stage(), Stage::Aborted);
    assert_eq!(runner.exit_code(), 1);
    let snapshot = runner.orchestrator().telemetry().snapshot();
    assert_eq!(snapshot.plugin_failures, 1);
    assert_eq!(snapshot.suites_run, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_during_the_suite_kills_it_and_aborts() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;

    let plan = OrchestrationPlan {
        services: Vec::new(),
        templates: Vec::new(),
        plugins: Vec::new(),
        suite: sh("sleep 1000"),
        static_values: Substitutions::new(),
    };

    let mut runner = Runner::new(test_config(work.path()), plan)?;
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let result = timeout(Duration::from_secs(5), runner.run())
        .await
        .expect("cancellation must end the run promptly");
    let err = result.expect_err("a cancelled suite must abort the run");
    let stage_err = err.downcast_ref::<StageError>().expect("stage-tagged error");
    assert_eq!(stage_err.stage(), Stage::Testing);
    assert!(format!("{err:#}").contains("cancelled"));

    assert_eq!(runner.orchestrator().stage(), Stage::Aborted);
    assert_eq!(runner.exit_code(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suite_failure_completes_the_run_with_its_exit_code() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;

    let plan = OrchestrationPlan {
        services: Vec::new(),
        templates: Vec::new(),
        plugins: Vec::new(),
        suite: sh("echo '1 passed, 2 failed'; exit 3"),
        static_values: Substitutions::new(),
    };

    let mut runner = Runner::new(test_config(work.path()), plan)?;
    let report = runner.run().await?;

    assert_eq!(report.passed, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.exit_code, 3);
    assert!(!report.success());
    assert_eq!(runner.orchestrator().stage(), Stage::Done);
    assert_eq!(runner.exit_code(), 3);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn starting_a_healthy_service_twice_reuses_the_process() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;
    let ready = work.path().join("ready");
    let spec = ServiceSpec::builder("database")
        .start_command(sh(format!("touch {} && exec sleep 30", ready.display())))
        .health_check(sh(format!("test -f {}", ready.display())))
        .build()?;

    let telemetry = Arc::new(Telemetry::default());
    let mut launcher = ServiceLauncher::new(
        Duration::from_millis(50),
        work.path().to_path_buf(),
        telemetry.clone(),
    );
    let token = CancellationToken::new();

    let first = launcher.start(&spec, &token).await?;
    let second = launcher.start(&spec, &token).await?;
    assert_eq!(first.process.pid(), second.process.pid());
    assert_eq!(telemetry.services_started(), 1);

    let outcomes = launcher.shutdown_all().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_ok());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_plugin_install_does_not_cancel_siblings() -> Result<()> {
    init_tracing();
    let work = tempfile::tempdir()?;
    let config = test_config(work.path());
    let ctx = RunContext::create(&config)?;
    let telemetry = Arc::new(Telemetry::default());
    let registry = PluginRegistry::open(ctx.registry_dir())?;
    let registrar = PluginRegistrar::new(
        registry.clone(),
        ctx.log_dir().to_path_buf(),
        telemetry.clone(),
    );

    let good = PluginPackage {
        name: "alpha".to_owned(),
        source: "alpha".to_owned(),
        install: sh("true"),
        register: sh("true"),
        activate: sh("exec sleep 30"),
    };
    let bad = PluginPackage {
        name: "broken".to_owned(),
        source: "broken".to_owned(),
        install: sh("false"),
        register: sh("true"),
        activate: sh("exec sleep 30"),
    };

    let outcomes = registrar.install_all(&[bad, good], &ctx, &[]).await;
    assert_eq!(outcomes.len(), 2);

    let broken = outcomes.iter().find(|o| o.plugin == "broken").unwrap();
    let err = broken.result.as_ref().expect_err("broken install must fail");
    assert!(err.downcast_ref::<PluginInstallError>().is_some());

    let alpha = outcomes.iter().find(|o| o.plugin == "alpha").unwrap();
    assert!(alpha.result.is_ok(), "sibling install must not be cancelled");

    assert!(registry.load("alpha").is_ok());
    assert!(
        registry.load("broken").is_err(),
        "a failed plugin must never reach the registry"
    );
    assert_eq!(telemetry.plugins_installed(), 1);
    assert_eq!(telemetry.plugin_failures(), 1);

    Ok(())
}
