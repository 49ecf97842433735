//! CLI command handlers.

pub mod envelope;
pub mod ping;
pub mod run;
pub mod snapshot;
