//! Orchestration stages and stage-tagged fatal errors.

use anyhow::Error as AnyError;
use std::fmt;

/// Explicit state machine for one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ServicesStarting,
    ServicesReady,
    PluginsInstalling,
    PluginsReady,
    Testing,
    Done,
    Aborted,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Init => "INIT",
            Stage::ServicesStarting => "SERVICES_STARTING",
            Stage::ServicesReady => "SERVICES_READY",
            Stage::PluginsInstalling => "PLUGINS_INSTALLING",
            Stage::PluginsReady => "PLUGINS_READY",
            Stage::Testing => "TESTING",
            Stage::Done => "DONE",
            Stage::Aborted => "ABORTED",
        };
        f.write_str(label)
    }
}

/// An unrecoverable failure tagged with the stage it happened in, so the
/// final log can distinguish an infrastructure abort from a test failure.
#[derive(Debug)]
pub struct StageError {
    stage: Stage,
    source: AnyError,
}

impl StageError {
    pub fn new(stage: Stage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_done_and_aborted_are_terminal() {
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Aborted.is_terminal());
        for stage in [
            Stage::Init,
            Stage::ServicesStarting,
            Stage::ServicesReady,
            Stage::PluginsInstalling,
            Stage::PluginsReady,
            Stage::Testing,
        ] {
            assert!(!stage.is_terminal(), "{stage} should not be terminal");
        }
    }

    #[test]
    fn stage_error_names_the_stage() {
        let err = StageError::new(Stage::PluginsInstalling, anyhow::anyhow!("boom"));
        assert_eq!(err.stage(), Stage::PluginsInstalling);
        assert!(format!("{err}").contains("PLUGINS_INSTALLING"));
    }
}
