//! Static description of one external service.

use crate::template::Placeholder;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 60;

/// A program plus arguments, with `{token}` substitution for values known
/// only at spawn time (for example an OS-assigned port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Replaces every `{name}` token in the arguments with its value.
    /// Unknown tokens are left untouched so commands can carry literal braces.
    pub fn resolved(&self, vars: &[(String, String)]) -> CommandSpec {
        let args = self
            .args
            .iter()
            .map(|arg| {
                let mut resolved = arg.clone();
                for (name, value) in vars {
                    resolved = resolved.replace(&format!("{{{name}}}"), value);
                }
                resolved
            })
            .collect();
        CommandSpec {
            program: self.program.clone(),
            args,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How the service's listening port is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortRequest {
    /// The service has no port the orchestrator cares about.
    #[default]
    Unspecified,
    /// The service binds this exact port.
    Fixed(u16),
    /// Reserve any free port and substitute it into the commands as `{port}`.
    Any,
}

/// Immutable definition of one external service. Construct via
/// [`ServiceSpec::builder`] so invariants hold before a launcher sees it.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    name: String,
    start: CommandSpec,
    health_check: CommandSpec,
    readiness_timeout: Duration,
    port: PortRequest,
    port_placeholder: Option<Placeholder>,
}

impl ServiceSpec {
    pub fn builder(name: impl Into<String>) -> ServiceSpecBuilder {
        ServiceSpecBuilder {
            name: name.into(),
            start: None,
            health_check: None,
            readiness_timeout: Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS),
            port: PortRequest::default(),
            port_placeholder: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_command(&self) -> &CommandSpec {
        &self.start
    }

    pub fn health_check(&self) -> &CommandSpec {
        &self.health_check
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    pub fn port(&self) -> PortRequest {
        self.port
    }

    /// Template placeholder the discovered port should be bound to, if any.
    pub fn port_placeholder(&self) -> Option<Placeholder> {
        self.port_placeholder
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSpecBuilder {
    name: String,
    start: Option<CommandSpec>,
    health_check: Option<CommandSpec>,
    readiness_timeout: Duration,
    port: PortRequest,
    port_placeholder: Option<Placeholder>,
}

impl ServiceSpecBuilder {
    pub fn start_command(mut self, command: CommandSpec) -> Self {
        self.start = Some(command);
        self
    }

    pub fn health_check(mut self, command: CommandSpec) -> Self {
        self.health_check = Some(command);
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn port(mut self, port: PortRequest) -> Self {
        self.port = port;
        self
    }

    pub fn port_placeholder(mut self, placeholder: Placeholder) -> Self {
        self.port_placeholder = Some(placeholder);
        self
    }

    pub fn build(self) -> Result<ServiceSpec> {
        let spec = ServiceSpec {
            start: self
                .start
                .with_context(|| format!("service {}: start command is required", self.name))?,
            health_check: self
                .health_check
                .with_context(|| format!("service {}: health check is required", self.name))?,
            name: self.name,
            readiness_timeout: self.readiness_timeout,
            port: self.port,
            port_placeholder: self.port_placeholder,
        };

        if spec.name.trim().is_empty() {
            bail!("service name cannot be empty");
        }
        if spec.start.program.trim().is_empty() {
            bail!("service {}: start program cannot be empty", spec.name);
        }
        if spec.health_check.program.trim().is_empty() {
            bail!("service {}: health check program cannot be empty", spec.name);
        }
        if spec.readiness_timeout.is_zero() {
            bail!("service {}: readiness_timeout must be greater than 0", spec.name);
        }
        if let PortRequest::Fixed(0) = spec.port {
            bail!("service {}: a fixed port of 0 is ambiguous, use PortRequest::Any", spec.name);
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServiceSpecBuilder {
        ServiceSpec::builder("database")
            .start_command(CommandSpec::new("postgres", ["-p", "{port}"]))
            .health_check(CommandSpec::new("pg_isready", ["-p", "{port}"]))
    }

    #[test]
    fn builder_produces_valid_spec() {
        let spec = base().port(PortRequest::Any).build().unwrap();
        assert_eq!(spec.name(), "database");
        assert_eq!(spec.port(), PortRequest::Any);
        assert_eq!(
            spec.readiness_timeout(),
            Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS)
        );
    }

    #[test]
    fn missing_commands_error_names_the_service() {
        let err = ServiceSpec::builder("cache").build().unwrap_err();
        assert!(
            format!("{err}").contains("cache"),
            "error should name the service"
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = base()
            .readiness_timeout(Duration::from_secs(0))
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("readiness_timeout"));
    }

    #[test]
    fn fixed_zero_port_is_rejected() {
        let err = base().port(PortRequest::Fixed(0)).build().unwrap_err();
        assert!(format!("{err}").contains("PortRequest::Any"));
    }

    #[test]
    fn resolved_substitutes_every_token_occurrence() {
        let command = CommandSpec::new("sh", ["-c", "connect {host}:{port} || retry {port}"]);
        let resolved = command.resolved(&[
            ("port".to_owned(), "54321".to_owned()),
            ("host".to_owned(), "localhost".to_owned()),
        ]);
        assert_eq!(resolved.args[1], "connect localhost:54321 || retry 54321");
    }

    #[test]
    fn resolved_leaves_unknown_tokens_untouched() {
        let command = CommandSpec::new("sh", ["-c", "echo {unknown}"]);
        let resolved = command.resolved(&[("port".to_owned(), "1".to_owned())]);
        assert_eq!(resolved.args[1], "echo {unknown}");
    }
}
