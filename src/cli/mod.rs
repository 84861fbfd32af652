//! CLI module for forgeplan.
//!
//! This module provides the command-line interface: argument
//! definitions and output formatting. Command handlers live in the
//! binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
