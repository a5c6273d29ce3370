//! Plugin package descriptions and installed-plugin records.

use crate::services::spec::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What to install and how. Commands may reference `{source}`,
/// `{install_dir}`, `{server_cert}`, `{coordinator}`, `{env_script}`, and
/// `{<service>_port}` tokens, resolved at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginPackage {
    pub name: String,
    /// URL, archive, or local path the install command consumes.
    pub source: String,
    pub install: CommandSpec,
    /// The plugin's own configure/register entry point. Receives the server
    /// certificate, the coordinating-service address, and the activation
    /// environment descriptor through the tokens above.
    pub register: CommandSpec,
    /// Long-running activation command supervised after registration.
    pub activate: CommandSpec,
}

/// Persisted result of a successful install, stored in the registry
/// directory so a later, separate process can re-discover how to activate
/// the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    pub install_path: PathBuf,
    /// Fully resolved activation command (no tokens left).
    pub activation: CommandSpec,
    pub certificate: PathBuf,
    pub coordinator: String,
}
