//! Command-line interface module
//!
//! This module handles argument parsing, prompts and output formatting.
//! The provisioning pipeline itself lives in [`crate::core`].

pub mod commands;
pub mod output;
pub mod prompt;

use anyhow::Result;
use clap::Parser;

use commands::Commands;

/// Weirding - turn a removable drive into a bootable, portable OS module
#[derive(Parser, Debug)]
#[command(name = "weirding")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress log output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Default log directive for the chosen verbosity
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            _ => tracing::Level::DEBUG,
        }
    }

    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        if let Some(cmd) = self.command {
            cmd.run(self.json).await
        } else {
            use clap::CommandFactory;
            let mut cmd = Self::command();
            cmd.print_help()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_follows_flags() {
        let cli = Cli::parse_from(["weirding", "list-drives"]);
        assert_eq!(cli.log_level(), tracing::Level::WARN);
        let cli = Cli::parse_from(["weirding", "-vv", "list-drives"]);
        assert_eq!(cli.log_level(), tracing::Level::DEBUG);
        let cli = Cli::parse_from(["weirding", "-q", "-v", "list-drives"]);
        assert_eq!(cli.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_setup_module_defaults() {
        let cli = Cli::parse_from(["weirding", "setup-module", "--version", "24.04"]);
        match cli.command {
            Some(Commands::SetupModule {
                os,
                version,
                variant,
                reverify,
                ..
            }) => {
                assert_eq!(os, "ubuntu");
                assert_eq!(version.as_deref(), Some("24.04"));
                assert!(variant.is_none());
                assert!(!reverify);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_relabel_requires_device_and_label() {
        assert!(Cli::try_parse_from(["weirding", "relabel-drive", "/dev/sdb"]).is_err());
        assert!(Cli::try_parse_from(["weirding", "relabel-drive", "/dev/sdb", "MODULE"]).is_ok());
    }
}
