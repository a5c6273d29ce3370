//! Explicit per-run context replacing ad hoc global state.
//!
//! Everything components used to find through environment variables (the
//! registry directory, rendered-config directory, certificate path, the
//! coordinator address) lives here, scoped to one orchestration run.

use crate::plugins::package::PluginPackage;
use crate::runtime::config::OrchestratorConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct RunContext {
    // Owns the scratch dir when no explicit work dir was configured; removal
    // happens when the run context drops.
    _scratch: Option<TempDir>,
    root: PathBuf,
    config_dir: PathBuf,
    registry_dir: PathBuf,
    log_dir: PathBuf,
    env_dir: PathBuf,
    server_cert: PathBuf,
    coordinator_address: String,
}

impl RunContext {
    pub fn create(config: &OrchestratorConfig) -> Result<Self> {
        let (scratch, root) = match config.work_dir() {
            Some(dir) => (None, dir.clone()),
            None => {
                let scratch = tempfile::tempdir().context("failed to create run scratch dir")?;
                let root = scratch.path().to_path_buf();
                (Some(scratch), root)
            }
        };

        let config_dir = root.join("config");
        let registry_dir = root.join("registry");
        let log_dir = root.join("logs");
        let env_dir = root.join("envs");
        for dir in [&config_dir, &registry_dir, &log_dir, &env_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create run dir {}", dir.display()))?;
        }

        Ok(Self {
            _scratch: scratch,
            root,
            config_dir,
            registry_dir,
            log_dir,
            env_dir,
            server_cert: config.server_cert().clone(),
            coordinator_address: config.coordinator_address().to_owned(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn registry_dir(&self) -> &Path {
        &self.registry_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn server_cert(&self) -> &Path {
        &self.server_cert
    }

    pub fn coordinator_address(&self) -> &str {
        &self.coordinator_address
    }

    /// Isolated install directory for one plugin.
    pub fn plugin_env_dir(&self, plugin: &str) -> PathBuf {
        self.env_dir.join(plugin)
    }

    /// Activation environment descriptor handed to register entry points.
    pub fn env_script(&self, plugin: &str) -> PathBuf {
        self.plugin_env_dir(plugin).join("activate.sh")
    }

    /// Token values for a plugin's install/register/activate commands.
    pub fn command_vars(
        &self,
        package: &PluginPackage,
        extra: &[(String, String)],
    ) -> Vec<(String, String)> {
        let install_dir = self.plugin_env_dir(&package.name);
        let mut vars = vec![
            ("source".to_owned(), package.source.clone()),
            (
                "install_dir".to_owned(),
                install_dir.display().to_string(),
            ),
            (
                "server_cert".to_owned(),
                self.server_cert.display().to_string(),
            ),
            ("coordinator".to_owned(), self.coordinator_address.clone()),
            (
                "env_script".to_owned(),
                self.env_script(&package.name).display().to_string(),
            ),
        ];
        vars.extend(extra.iter().cloned());
        vars
    }

    /// Environment exported to the test suite process.
    pub fn suite_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "TESTRIG_CONFIG_DIR".to_owned(),
                self.config_dir.display().to_string(),
            ),
            (
                "TESTRIG_REGISTRY_DIR".to_owned(),
                self.registry_dir.display().to_string(),
            ),
            (
                "TESTRIG_SERVER_CERT".to_owned(),
                self.server_cert.display().to_string(),
            ),
            (
                "TESTRIG_COORDINATOR".to_owned(),
                self.coordinator_address.clone(),
            ),
        ]
    }
}
