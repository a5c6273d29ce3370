//! Plugin installation, registration, and group supervision.

pub mod package;
pub mod registrar;
pub mod registry;
pub mod supervisor;
