//! Installs plugin packages and registers them with the coordinator.

use crate::plugins::package::{PluginPackage, PluginRecord};
use crate::plugins::registry::PluginRegistry;
use crate::runtime::context::RunContext;
use crate::runtime::telemetry::Telemetry;
use crate::services::spec::CommandSpec;
use anyhow::{Context, Result};
use futures::future::join_all;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// The install command could not run or exited non-zero (package
/// unreachable, dependency conflict).
#[derive(Debug)]
pub struct PluginInstallError {
    pub plugin: String,
    pub detail: String,
}

impl fmt::Display for PluginInstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin {} failed to install: {}", self.plugin, self.detail)
    }
}

impl std::error::Error for PluginInstallError {}

/// The plugin's configure/register entry point exited non-zero.
#[derive(Debug)]
pub struct PluginRegisterError {
    pub plugin: String,
    pub detail: String,
}

impl fmt::Display for PluginRegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin {} failed to register: {}", self.plugin, self.detail)
    }
}

impl std::error::Error for PluginRegisterError {}

/// Result of one plugin installation inside a fan-out.
pub struct InstallOutcome {
    pub plugin: String,
    pub result: Result<PluginRecord>,
}

pub struct PluginRegistrar {
    registry: PluginRegistry,
    log_dir: PathBuf,
    telemetry: Arc<Telemetry>,
}

impl PluginRegistrar {
    pub fn new(registry: PluginRegistry, log_dir: PathBuf, telemetry: Arc<Telemetry>) -> Self {
        Self {
            registry,
            log_dir,
            telemetry,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Installs one plugin into its isolated environment, invokes its
    /// register entry point, and persists the resulting record.
    ///
    /// `extra_vars` carries run-discovered values (service ports) into the
    /// plugin's command tokens.
    pub async fn install(
        &self,
        package: &PluginPackage,
        ctx: &RunContext,
        extra_vars: &[(String, String)],
    ) -> Result<PluginRecord> {
        let install_dir = ctx.plugin_env_dir(&package.name);
        std::fs::create_dir_all(&install_dir).with_context(|| {
            format!("failed to create plugin env dir {}", install_dir.display())
        })?;

        let vars = ctx.command_vars(package, extra_vars);

        tracing::info!(plugin = %package.name, source = %package.source, "installing plugin");
        let install = package.install.resolved(&vars);
        if let Err(detail) = self.run_step(&package.name, "install", &install).await {
            return Err(PluginInstallError {
                plugin: package.name.clone(),
                detail,
            }
            .into());
        }

        tracing::info!(plugin = %package.name, "registering plugin with coordinator");
        let register = package.register.resolved(&vars);
        if let Err(detail) = self.run_step(&package.name, "register", &register).await {
            return Err(PluginRegisterError {
                plugin: package.name.clone(),
                detail,
            }
            .into());
        }

        let record = PluginRecord {
            name: package.name.clone(),
            install_path: install_dir,
            activation: package.activate.resolved(&vars),
            certificate: ctx.server_cert().to_path_buf(),
            coordinator: ctx.coordinator_address().to_owned(),
        };
        self.registry
            .store(&record)
            .with_context(|| format!("failed to persist record for plugin {}", package.name))?;
        self.telemetry.record_plugin_installed();

        Ok(record)
    }

    /// Installs every package concurrently and collects all outcomes.
    /// One plugin's failure never cancels another's installation; the caller
    /// decides whether any failure aborts the run.
    pub async fn install_all(
        &self,
        packages: &[PluginPackage],
        ctx: &RunContext,
        extra_vars: &[(String, String)],
    ) -> Vec<InstallOutcome> {
        let installs = packages
            .iter()
            .map(|package| async move {
                let result = self.install(package, ctx, extra_vars).await;
                if let Err(err) = &result {
                    self.telemetry.record_plugin_failure();
                    tracing::error!(plugin = %package.name, error = format!("{err:#}"), "plugin installation failed");
                }
                InstallOutcome {
                    plugin: package.name.clone(),
                    result,
                }
            });
        join_all(installs).await
    }

    async fn run_step(
        &self,
        plugin: &str,
        step: &str,
        command: &CommandSpec,
    ) -> std::result::Result<(), String> {
        let log_path = self.log_dir.join(format!("{plugin}.{step}.log"));
        let log = match File::create(&log_path) {
            Ok(file) => file,
            Err(err) => return Err(format!("could not create log {}: {err}", log_path.display())),
        };
        let log_err = match log.try_clone() {
            Ok(file) => file,
            Err(err) => return Err(format!("could not clone log handle: {err}")),
        };

        let status = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|err| format!("could not run `{command}`: {err}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "`{command}` exited with {status} (log: {})",
                log_path.display()
            ))
        }
    }
}
