use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Relationship and attribute based authorization engine")]
pub struct Cli {
    #[arg(short, long, global = true, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Run a development bundle offline and report every failure.
    Validate {
        /// Path to a JSON bundle with schema, relationships, attributes and scenarios.
        bundle: PathBuf,
    },
    /// Load and validate the configuration, then print it.
    CheckConfig,
}
