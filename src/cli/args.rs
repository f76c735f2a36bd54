//! CLI argument definitions using clap
//!
//! Commands:
//! - shard-recovery simulate [--config <path>] [--replicas N] [--objects N] ...
//! - shard-recovery check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// shard-recovery - replica recovery for storage shards
#[derive(Parser, Debug)]
#[command(name = "shard-recovery")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run recovery across an in-memory replica set and print a JSON report
    Simulate {
        /// Path to recovery configuration file (defaults if omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shards in the replica set, primary included
        #[arg(long, default_value_t = 3)]
        replicas: u32,

        /// Objects held by the primary and missing on every replica
        #[arg(long, default_value_t = 4)]
        objects: u32,

        /// Size of each object in bytes
        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        object_size: u64,

        /// Omap entries per object
        #[arg(long, default_value_t = 16)]
        omap_keys: u32,

        /// Override the configured round budget
        #[arg(long)]
        max_push_bytes: Option<u64>,

        /// Seed for generated object contents
        #[arg(long)]
        seed: Option<u64>,

        /// Log every transfer round
        #[arg(long)]
        verbose: bool,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to recovery configuration file
        #[arg(long)]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
