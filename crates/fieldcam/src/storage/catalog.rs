//! `SQLite` index of persisted images.
//!
//! The files on disk are the source of truth; the catalog answers status
//! queries and lets sequence numbering continue across restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::position::FixValidity;
use crate::time::TimestampSource;

use super::migrations;

/// One catalogued image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub time_source: TimestampSource,
    pub session: String,
    pub file_name: String,
    pub fix: FixValidity,
    pub latitude: f64,
    pub longitude: f64,
    pub satellites: u8,
    pub content_hash: String,
}

/// Aggregate catalog figures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    /// Images catalogued.
    pub total_images: i64,
    /// Images carrying a REAL fix.
    pub real_fixes: i64,
    /// Images carrying the FALLBACK fix.
    pub fallback_fixes: i64,
    /// Distinct sessions with at least one image.
    pub sessions: i64,
    /// Capture time of the oldest image.
    pub oldest: Option<DateTime<Utc>>,
    /// Capture time of the newest image.
    pub newest: Option<DateTime<Utc>>,
    /// Size of the catalog file in bytes.
    pub db_size_bytes: u64,
}

/// The capture catalog.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    conn: Connection,
}

impl Catalog {
    /// Open or create the catalog at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening catalog at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Catalog opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        migrations::initialize_schema(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Path of the catalog file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a persisted image.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, including a duplicate sequence.
    pub fn insert(&self, entry: &CatalogEntry) -> Result<i64> {
        self.conn.execute(
            r"
            INSERT INTO images (sequence, captured_at, time_source, session, file_name,
                                fix_validity, latitude, longitude, satellites, content_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                i64::try_from(entry.sequence).unwrap_or(i64::MAX),
                entry.captured_at.to_rfc3339(),
                entry.time_source.to_string(),
                entry.session,
                entry.file_name,
                entry.fix.to_string(),
                entry.latitude,
                entry.longitude,
                entry.satellites,
                entry.content_hash,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Forget every image in `session`. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete_session(&self, session: &str) -> Result<usize> {
        let affected = self
            .conn
            .execute("DELETE FROM images WHERE session = ?1", [session])?;
        if affected > 0 {
            debug!(session, rows = affected, "Removed session from catalog");
        }
        Ok(affected)
    }

    /// Highest sequence number ever catalogued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn max_sequence(&self) -> Result<Option<u64>> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(sequence) FROM images", [], |row| row.get(0))?;
        Ok(max.and_then(|m| u64::try_from(m).ok()))
    }

    /// Image counts per session, oldest session first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn session_counts(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session, COUNT(*) FROM images GROUP BY session ORDER BY session")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recently captured images, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT sequence, captured_at, time_source, session, file_name, fix_validity,
                   latitude, longitude, satellites, content_hash
            FROM images ORDER BY sequence DESC LIMIT ?1
            ",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map([limit], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Aggregate figures for the status command.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<CatalogStats> {
        let (total_images, real_fixes, sessions, oldest, newest): (
            i64,
            Option<i64>,
            i64,
            Option<String>,
            Option<String>,
        ) = self.conn.query_row(
            r"
            SELECT COUNT(*),
                   SUM(CASE WHEN fix_validity = 'REAL' THEN 1 ELSE 0 END),
                   COUNT(DISTINCT session),
                   MIN(captured_at),
                   MAX(captured_at)
            FROM images
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
        let real_fixes = real_fixes.unwrap_or(0);

        let parse = |s: Option<String>| {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(CatalogStats {
            total_images,
            real_fixes,
            fallback_fixes: total_images - real_fixes,
            sessions,
            oldest: parse(oldest),
            newest: parse(newest),
            db_size_bytes,
        })
    }

    /// Look up one image by sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, sequence: u64) -> Result<Option<CatalogEntry>> {
        let sequence = i64::try_from(sequence).unwrap_or(i64::MAX);
        Ok(self
            .conn
            .query_row(
                r"
                SELECT sequence, captured_at, time_source, session, file_name, fix_validity,
                       latitude, longitude, satellites, content_hash
                FROM images WHERE sequence = ?1
                ",
                [sequence],
                Self::row_to_entry,
            )
            .optional()?)
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CatalogEntry> {
        let sequence: i64 = row.get(0)?;
        let captured_at: String = row.get(1)?;
        let time_source: String = row.get(2)?;
        let fix: String = row.get(5)?;

        let captured_at = DateTime::parse_from_rfc3339(&captured_at)
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |dt| dt.with_timezone(&Utc));
        let time_source = match time_source.as_str() {
            "PULSE" => TimestampSource::Pulse,
            "DEVICE" => TimestampSource::Device,
            "MONOTONIC" => TimestampSource::Monotonic,
            _ => TimestampSource::Wallclock,
        };
        let fix = if fix == "REAL" {
            FixValidity::Real
        } else {
            FixValidity::Fallback
        };

        Ok(CatalogEntry {
            sequence: u64::try_from(sequence).unwrap_or_default(),
            captured_at,
            time_source,
            session: row.get(3)?,
            file_name: row.get(4)?,
            fix,
            latitude: row.get(6)?,
            longitude: row.get(7)?,
            satellites: row.get(8)?,
            content_hash: row.get(9)?,
        })
    }
}
