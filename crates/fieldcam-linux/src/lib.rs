//! Linux-specific implementation for fieldcam
//!
//! This crate provides the timing helpers that only make sense on Linux:
//! reading pulse-per-second edges from the kernel PPS subsystem and
//! stepping the system clock.

#![cfg(target_os = "linux")]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::io;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

/// Default sysfs location of the first PPS device's assert timestamp.
pub const DEFAULT_PPS_ASSERT_PATH: &str = "/sys/class/pps/pps0/assert";

/// A pulse edge as reported by the kernel PPS subsystem.
///
/// The timestamp is on the system realtime clock, captured by the kernel
/// in the interrupt handler for the pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseEdge {
    /// Whole seconds since the Unix epoch.
    pub secs: i64,
    /// Nanoseconds within the second.
    pub nanos: u32,
    /// Kernel sequence counter; increments on every edge.
    pub sequence: u64,
}

/// Parse the contents of a sysfs PPS `assert` file.
///
/// The kernel format is `<secs>.<nanos>#<sequence>`, e.g.
/// `1700000000.000001234#42`. A device that has not seen an edge yet
/// reports `0.000000000#0`, which parses to `None`.
#[must_use]
pub fn parse_pps_assert(raw: &str) -> Option<PulseEdge> {
    let (stamp, sequence) = raw.trim().split_once('#')?;
    let (secs, frac) = stamp.split_once('.')?;
    let secs: i64 = secs.parse().ok()?;
    let sequence: u64 = sequence.parse().ok()?;

    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Right-pad so "5" means 500_000_000ns
    let nanos: u32 = format!("{frac:0<9}").parse().ok()?;

    if secs == 0 && sequence == 0 {
        return None;
    }

    Some(PulseEdge {
        secs,
        nanos,
        sequence,
    })
}

/// Read the most recent pulse edge from a sysfs PPS `assert` file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_pps_assert(path: &Path) -> io::Result<Option<PulseEdge>> {
    let raw = std::fs::read_to_string(path)?;
    let edge = parse_pps_assert(&raw);
    debug!(path = %path.display(), ?edge, "Read PPS assert");
    Ok(edge)
}

/// Step the system realtime clock to the given instant.
///
/// Delegates to `date -u -s @<secs>.<nanos>`, which requires
/// `CAP_SYS_TIME`. The process is expected to run under a service
/// account that holds it.
///
/// # Errors
///
/// Returns an error if `date` cannot be spawned or exits unsuccessfully.
pub fn set_system_clock(secs: i64, nanos: u32) -> io::Result<()> {
    let arg = format!("@{secs}.{nanos:09}");
    let status = Command::new("date").args(["-u", "-s", &arg]).status()?;
    if status.success() {
        info!(target_secs = secs, "System clock stepped");
        Ok(())
    } else {
        Err(io::Error::other(format!("date -s exited with {status}")))
    }
}

/// Get platform name
#[must_use]
pub fn platform_name() -> &'static str {
    "Linux"
}
