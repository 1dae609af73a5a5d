//! Arguments for the individual subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// `fieldcam status`
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Print a JSON document instead of a summary
    #[arg(short, long)]
    pub json: bool,
}

/// `fieldcam sessions`
#[derive(Debug, Args)]
pub struct SessionsCommand {
    /// Print a JSON array instead of a table
    #[arg(short, long)]
    pub json: bool,

    /// Only show the newest N sessions
    #[arg(short = 'n', long, value_name = "N")]
    pub limit: Option<usize>,
}

/// `fieldcam evict`
#[derive(Debug, Args)]
pub struct EvictCommand {
    /// List the sessions that would be removed without deleting anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Print the eviction report as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// `fieldcam config ...`
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (defaults, file and environment merged)
    Show {
        /// Print JSON instead of sections
        #[arg(short, long)]
        json: bool,
    },

    /// Print where the configuration file is read from
    Path,

    /// Load and check a configuration file without starting the pipeline
    Validate {
        /// File to check instead of the default location
        #[arg(short, long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

impl SessionsCommand {
    /// Keep only the newest `limit` of `sessions`, which arrive oldest first.
    pub fn apply_limit<T>(&self, sessions: &mut Vec<T>) {
        if let Some(limit) = self.limit {
            let skip = sessions.len().saturating_sub(limit);
            sessions.drain(..skip);
        }
    }
}
