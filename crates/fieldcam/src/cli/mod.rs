//! Command-line interface for fieldcam.
//!
//! This module provides the CLI structure for the `fieldcam` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, EvictCommand, SessionsCommand, StatusCommand};

/// fieldcam - Unattended geotagging camera
///
/// Captures images at a fixed cadence, tags each one with the best available
/// position fix and keeps the storage volume within its budget.
#[derive(Debug, Parser)]
#[command(name = "fieldcam")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the capture pipeline in the foreground until interrupted
    Run,

    /// Show storage and catalog status
    Status(StatusCommand),

    /// List session directories, oldest first
    Sessions(SessionsCommand),

    /// Run one storage maintenance pass
    Evict(EvictCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
