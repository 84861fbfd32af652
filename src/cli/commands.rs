//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Forgeplan - declarative resource planning and provisioning.
#[derive(Parser, Debug)]
#[command(name = "forgeplan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "FORGEPLAN_CONFIG")]
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

    /// Set a variable (`name=value`); may be repeated.
    #[arg(long = "var", global = true, value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan.
    ///
    /// Exits with 0 when nothing changes, 2 when the plan has changes.
    Plan {
        /// Save the plan to a file for a later `apply --plan-file`.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,

        /// Show attribute-level differences.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply the configuration.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Execute a previously saved plan.
        #[arg(long, value_name = "FILE")]
        plan_file: Option<PathBuf>,

        /// Maximum provisioning calls in flight.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Destroy every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum provisioning calls in flight.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Update state from the real objects.
    Refresh,

    /// Check for drift between state and the real objects.
    Drift,

    /// Print the dependency graph in DOT format.
    Graph,

    /// Inspect and edit state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded addresses.
    List,

    /// Show one record.
    Show {
        /// Resource address.
        address: String,
    },

    /// Forget a record without destroying its object.
    Rm {
        /// Resource address.
        address: String,
    },

    /// Move a record to a new address.
    Mv {
        /// Current address.
        from: String,
        /// New address.
        to: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held.
        #[arg(long)]
        force: bool,
    },

    /// Show run history.
    History {
        /// Number of entries to show.
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
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

/// Parses a `name=value` pair.
fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("variable name is empty in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan_with_vars() {
        let cli = Cli::try_parse_from([
            "forgeplan",
            "--var",
            "region=eu-west-1",
            "--var",
            "greeting=a=b",
            "plan",
            "--out",
            "plan.json",
        ])
        .unwrap();

        assert_eq!(
            cli.vars,
            vec![
                ("region".to_string(), "eu-west-1".to_string()),
                ("greeting".to_string(), "a=b".to_string()),
            ]
        );
        assert!(matches!(cli.command, Commands::Plan { out: Some(_), detailed: false }));
    }

    #[test]
    fn test_parse_state_mv() {
        let cli = Cli::try_parse_from(["forgeplan", "state", "mv", "null_resource.a", "null_resource.b"]).unwrap();
        let Commands::State {
            command: StateCommands::Mv { from, to },
        } = cli.command
        else {
            panic!("expected state mv");
        };
        assert_eq!(from, "null_resource.a");
        assert_eq!(to, "null_resource.b");
    }

    #[test]
    fn test_rejects_malformed_var() {
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
        assert_eq!(parse_var("a=").unwrap(), ("a".to_string(), String::new()));
    }
}
