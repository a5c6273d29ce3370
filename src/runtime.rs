//! Runtime glue that wires config, run context, the stage machine,
//! telemetry, and the lifecycle runner.

pub mod config;
pub mod context;
pub mod fatal;
pub mod orchestrator;
pub mod runner;
pub mod stage;
pub mod telemetry;
