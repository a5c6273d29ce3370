mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{init_tracing, sh, wait_until};
use anyhow::Result;
use testrig::{
    CommandSpec, FatalErrorHandler, GroupStartTimeout, PluginRecord, ProcessGroupSupervisor,
    Stage, Telemetry,
};
use tokio_util::sync::CancellationToken;

fn record(name: &str, activation: CommandSpec) -> PluginRecord {
    PluginRecord {
        name: name.to_owned(),
        install_path: PathBuf::from(format!("/tmp/envs/{name}")),
        activation,
        certificate: PathBuf::from("/tmp/server.pem"),
        coordinator: "https://localhost:21174".to_owned(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_worker_fails_the_group_and_is_named() -> Result<()> {
    init_tracing();
    let logs = tempfile::tempdir()?;
    let telemetry = Arc::new(Telemetry::default());
    let mut supervisor = ProcessGroupSupervisor::new(
        Duration::from_millis(50),
        logs.path().to_path_buf(),
        telemetry,
    );

    supervisor
        .launch_all(&[
            record("stable", sh("exec sleep 30")),
            record("flaky", sh("exit 7")),
        ])
        .await?;

    let token = CancellationToken::new();
    let err = supervisor
        .await_all_healthy(Duration::from_secs(5), &token)
        .await
        .expect_err("a dead worker must fail the group");
    let timeout = err
        .downcast_ref::<GroupStartTimeout>()
        .expect("group start timeout error");
    assert!(
        timeout.pending.contains(&"flaky".to_owned()),
        "the dead worker should be named, got: {:?}",
        timeout.pending
    );

    supervisor.shutdown_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_death_during_the_run_trips_the_fatal_handler() -> Result<()> {
    init_tracing();
    let logs = tempfile::tempdir()?;
    let telemetry = Arc::new(Telemetry::default());
    let mut supervisor = ProcessGroupSupervisor::new(
        Duration::from_millis(20),
        logs.path().to_path_buf(),
        telemetry,
    );

    supervisor
        .launch_all(&[record("shortlived", sh("sleep 0.3"))])
        .await?;
    let token = CancellationToken::new();
    supervisor
        .await_all_healthy(Duration::from_secs(5), &token)
        .await?;

    let run_token = CancellationToken::new();
    let fatal = Arc::new(FatalErrorHandler::new(run_token.clone()));
    supervisor.spawn_exit_watcher(fatal.clone());

    wait_until("fatal handler to trip", Duration::from_secs(5), || {
        fatal.is_triggered()
    })
    .await?;
    assert!(run_token.is_cancelled(), "a fatal error must cancel the run");
    let captured = fatal.error().expect("captured error");
    assert_eq!(captured.stage(), Stage::Testing);
    assert!(format!("{captured}").contains("shortlived"));

    supervisor.shutdown_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_stops_workers_in_reverse_launch_order() -> Result<()> {
    init_tracing();
    let logs = tempfile::tempdir()?;
    let telemetry = Arc::new(Telemetry::default());
    let mut supervisor = ProcessGroupSupervisor::new(
        Duration::from_millis(50),
        logs.path().to_path_buf(),
        telemetry.clone(),
    );

    supervisor
        .launch_all(&[
            record("first", sh("exec sleep 30")),
            record("second", sh("exec sleep 30")),
        ])
        .await?;

    let outcomes = supervisor.shutdown_all().await;
    let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, ["second", "first"]);
    assert!(ProcessGroupSupervisor::shutdown_failures(&outcomes).is_none());
    assert_eq!(telemetry.processes_stopped(), 2);

    assert!(
        supervisor.shutdown_all().await.is_empty(),
        "a second shutdown has nothing left to stop"
    );
    assert_eq!(telemetry.processes_stopped(), 2);

    Ok(())
}
