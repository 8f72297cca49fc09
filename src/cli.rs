//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// confcascade - configuration change propagation
#[derive(Parser, Debug)]
#[command(name = "confcascade")]
#[command(version)]
#[command(about = "Cascade configuration changes to the resources that reference them")]
#[command(
    long_about = "confcascade watches shared configuration resources and, when their content changes, sends an empty patch to every dependent whose recorded reference version is out of date."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile every configuration resource in a snapshot and print the patches sent
    Run {
        /// Snapshot file (JSON, or YAML with a .yaml/.yml extension)
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Controller configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List dependents whose reference is stale, without patching anything
    Check {
        /// Snapshot file (JSON, or YAML with a .yaml/.yml extension)
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Controller configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
