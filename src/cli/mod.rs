//! CLI module for the v6lab tool.
//!
//! This module provides the command-line interface for planning and
//! applying lab topologies.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
