//! Log output for the camera appliance.
//!
//! Everything goes through `tracing`. Pipeline status events (one per cycle
//! plus health reports) use the [`STATUS_TARGET`] target so a log shipper can
//! pick them out of ordinary diagnostics. They stay at `info` even when
//! `--quiet` is given, since an unattended unit is mostly observed through
//! them.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target used for structured pipeline status events.
pub const STATUS_TARGET: &str = "fieldcam::status";

/// Set by systemd when stderr is connected to the journal.
const JOURNAL_ENV: &str = "JOURNAL_STREAM";

/// How chatty diagnostics are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only, plus status events.
    Quiet,
    /// Info and above.
    #[default]
    Normal,
    /// Debug and above; shows discarded sentences and stage timings.
    Verbose,
    /// Everything.
    Trace,
}

impl Verbosity {
    /// The most detailed level this verbosity lets through.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

/// Resolved output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Diagnostic verbosity.
    pub verbosity: Verbosity,
    /// Under the journal: no ANSI colors and no timestamps, which the
    /// journal records itself.
    pub journald: bool,
}

impl LogOptions {
    /// Options for `verbosity`, detecting whether stderr goes to the journal.
    #[must_use]
    pub fn detect(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            journald: std::env::var_os(JOURNAL_ENV).is_some(),
        }
    }

    /// Default filter directives when `RUST_LOG` is unset.
    #[must_use]
    pub fn directives(&self) -> String {
        let level = self.verbosity.to_level_filter();
        let status = level.max(Level::INFO);
        format!("fieldcam={level},fieldcam_linux={level},{STATUS_TARGET}={status}")
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity.
///
/// Calling this more than once is harmless; later calls are ignored.
///
/// ```no_run
/// use fieldcam::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    init_with(&LogOptions::detect(verbosity));
}

/// Install the global subscriber with explicit options.
pub fn init_with(options: &LogOptions) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.directives()));

    let layer = fmt::layer()
        .with_target(true)
        .with_ansi(!options.journald);
    let result = if options.journald {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time())
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    // Already installed by an earlier call or a test harness
    let _ = result;
}

/// Warnings and errors only, through the test writer.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
