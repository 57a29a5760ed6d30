//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// v6lab - Declarative reconciliation for IPv6-only lab networks.
#[derive(Parser, Debug)]
#[command(name = "v6lab")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the topology file.
    #[arg(short, long, global = true, env = "V6LAB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the IPv6-only lab topology template.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the topology file.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan without changing anything.
    Plan {
        /// Show changed properties for every resource.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge the topology to the declared state.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage the state snapshot.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the committed snapshot.
    Show,

    /// Remove a stale lock.
    Unlock {
        /// Lock ID to release. Defaults to the current lock.
        #[arg(long)]
        lock_id: Option<String>,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_global_flags() {
        let cli = Cli::try_parse_from(["v6lab", "apply", "--yes", "--output", "json", "--log-json"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Apply { yes: true }));
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(cli.log_json);
    }

    #[test]
    fn test_parse_state_unlock() {
        let cli = Cli::try_parse_from(["v6lab", "state", "unlock", "--lock-id", "abc"]).expect("parse");
        match cli.command {
            Commands::State {
                command: StateCommands::Unlock { lock_id },
            } => assert_eq!(lock_id.as_deref(), Some("abc")),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
