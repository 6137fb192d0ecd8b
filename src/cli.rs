//! Command-line interface definition for Procsi
//!
//! This module defines the CLI structure using clap's derive API. The
//! CLI is a thin shell: `start` runs the daemon in the foreground,
//! `status` and `stop` talk to a running daemon through its control
//! socket and pid file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Procsi - per-project HTTP(S) capture and manipulation daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "procsi")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Project root; defaults to $PROJECT_ROOT, then the current directory
    #[arg(short, long, env = "PROJECT_ROOT")]
    pub project_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Procsi
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start {
        /// Proxy port override; 0 lets the OS (or the port hint) decide
        #[arg(short = 'P', long, default_value_t = 0)]
        port: u16,
    },

    /// Show the status of the running daemon
    Status,

    /// Stop the running daemon
    Stop,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
