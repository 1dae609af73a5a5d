//! Time-bucketed session directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;

/// Directory name format for a bucket start, always UTC.
pub const SESSION_NAME_FORMAT: &str = "%Y%m%d_%H%M";

/// Suffix of a session directory whose removal is in progress.
pub const EVICTING_SUFFIX: &str = ".evicting";

/// Start of the bucket containing `time`.
///
/// Buckets are aligned to the Unix epoch, so the result depends only on
/// `time` and `width`.
#[must_use]
pub fn bucket_start(time: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width = i64::try_from(width.as_secs()).unwrap_or(i64::MAX).max(60);
    let secs = time.timestamp();
    let start = secs - secs.rem_euclid(width);
    DateTime::from_timestamp(start, 0).unwrap_or(time)
}

/// Directory name of the bucket starting at `start`.
#[must_use]
pub fn session_name(start: DateTime<Utc>) -> String {
    start.format(SESSION_NAME_FORMAT).to_string()
}

/// Bucket start encoded in a session directory name.
#[must_use]
pub fn parse_session_name(name: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(name, SESSION_NAME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// One bucket directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageSession {
    name: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    path: PathBuf,
}

impl StorageSession {
    /// The session for `time` under `root`.
    #[must_use]
    pub fn for_time(root: &Path, time: DateTime<Utc>, width: Duration) -> Self {
        let start = bucket_start(time, width);
        Self::from_start(root, start, width)
    }

    /// The session starting at `start` under `root`.
    #[must_use]
    pub fn from_start(root: &Path, start: DateTime<Utc>, width: Duration) -> Self {
        let name = session_name(start);
        let end = TimeDelta::from_std(width)
            .ok()
            .and_then(|width| start.checked_add_signed(width))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            path: root.join(&name),
            name,
            start,
            end,
        }
    }

    /// Directory name, also the session identity.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket start (inclusive).
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Bucket end (exclusive).
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `time` falls inside this bucket.
    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }
}
