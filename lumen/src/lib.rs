//! Shared infrastructure for the `filament` web server: structured logging,
//! wall-clock helpers and small container primitives.

pub mod logging;
pub mod queue;
pub mod time;
