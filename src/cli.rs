//! Command-line interface for Harbormaster
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::manifest::DEFAULT_MANIFEST;

/// Harbormaster - local process supervisor
#[derive(Parser)]
#[command(name = "harbormaster")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_MANIFEST)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Append daemon logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Launch all components and supervise them until interrupted
    Daemon,

    /// Show component status from the running daemon
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stop a component (it stays stopped until restarted)
    Stop {
        /// Component ID
        component: String,
    },

    /// Restart a component and clear its restart history
    Restart {
        /// Component ID
        component: String,
    },

    /// Validate configuration
    Check,

    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short = 'y', long)]
        force: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "harbormaster", &mut std::io::stdout());
    }
}
