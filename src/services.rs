//! Service definitions, health probing, and launching.

pub mod health;
pub mod launcher;
pub mod spec;
