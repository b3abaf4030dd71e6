//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Okteto - activates cloud native development environments.
#[derive(Parser, Debug)]
#[command(name = "okteto")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Activate your development environment.
    Up {
        /// Path to the manifest file.
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Namespace where the up command is executed.
        #[arg(short = 'n', long, env = "OKTETO_NAMESPACE")]
        namespace: Option<String>,

        /// Configure remote execution on the specified port.
        #[arg(short = 'r', long)]
        remote: Option<u16>,

        /// Create the deployment when it doesn't exist in the namespace.
        #[arg(short = 'd', long = "deploy")]
        deploy: bool,

        /// Force the dev image to be pulled again.
        #[arg(long)]
        pull: bool,
    },

    /// Deactivate your development environment and restore the original
    /// deployment.
    Down {
        /// Path to the manifest file.
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Namespace where the down command is executed.
        #[arg(short = 'n', long, env = "OKTETO_NAMESPACE")]
        namespace: Option<String>,

        /// Also remove the persistent volumes and local state.
        #[arg(short = 'v', long)]
        volumes: bool,
    },

    /// Execute a command in your development environment.
    Exec {
        /// Path to the manifest file.
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Namespace where the exec command is executed.
        #[arg(short = 'n', long, env = "OKTETO_NAMESPACE")]
        namespace: Option<String>,

        /// Command to execute.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Print the state of the development environment.
    Status {
        /// Path to the manifest file.
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Namespace of the development environment.
        #[arg(short = 'n', long, env = "OKTETO_NAMESPACE")]
        namespace: Option<String>,
    },
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
