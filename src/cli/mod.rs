//! CLI module for shard-recovery
//!
//! Provides command-line interface for:
//! - simulate: Recover objects across an in-memory replica set
//! - check-config: Validate a recovery configuration file

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{run, run_command, SimulationPlan};
pub use errors::{CliError, CliErrorCode, CliResult};
