//! Storage layer for fieldcam.
//!
//! Images live in time-bucketed session directories under one root. The
//! [`StorageManager`] owns that tree: it resolves sessions, writes images
//! and sidecars atomically, samples free space and evicts whole sessions
//! when the volume runs low.
//!
//! Persistence and eviction both hold the writer lock, so a session is never
//! removed while an image is being written into it.

pub mod catalog;
pub mod migrations;
pub mod schema;
pub mod session;
pub mod space;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, BYTES_PER_GB};
use crate::error::{Error, Result};
use crate::pipeline::health::{HealthStatus, SubsystemHealth};
use crate::tagging::TaggedImage;

use self::catalog::{Catalog, CatalogEntry};
pub use self::session::StorageSession;
use self::session::{parse_session_name, EVICTING_SUFFIX};
pub use self::space::{FsSpaceProbe, SpaceProbe, SpaceSample};

/// Catalog file name inside the storage root.
pub const CATALOG_FILE_NAME: &str = "catalog.db";

/// Suffix of files being written.
const TMP_SUFFIX: &str = ".tmp";

/// Space kept free beyond the image itself; below this persist refuses.
const WRITE_RESERVE_BYTES: u64 = 16 * 1024 * 1024;

/// Read-only thresholds evaluated on every maintenance pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionPolicy {
    /// Eviction starts below this much free space.
    pub min_free_bytes: u64,
    /// Eviction tries to recover this much free space.
    pub cleanup_trigger_bytes: u64,
    /// Eviction starts above this usage.
    pub max_usage_percent: f64,
    /// Sessions whose bucket ended longer ago are removed regardless of space.
    pub max_age: Option<Duration>,
    /// Width of a session bucket.
    pub bucket_width: Duration,
    /// Sessions that ended more recently are never evicted for space.
    pub protect_recent: Duration,
}

impl RetentionPolicy {
    /// Thresholds from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_free_bytes: config.storage.min_free_bytes(),
            cleanup_trigger_bytes: config.storage.cleanup_trigger_bytes(),
            max_usage_percent: config.storage.max_usage_percent,
            max_age: config.retention(),
            bucket_width: config.bucket_width(),
            protect_recent: Duration::from_secs(u64::from(config.storage.protect_recent_minutes) * 60),
        }
    }

    /// Whether `sample` is past either high-water mark.
    #[must_use]
    pub fn needs_eviction(&self, sample: &SpaceSample) -> bool {
        sample.free_bytes < self.min_free_bytes || sample.used_percentage() > self.max_usage_percent
    }

    /// Whether `sample` is back within the recovery target.
    #[must_use]
    pub fn is_recovered(&self, sample: &SpaceSample) -> bool {
        sample.free_bytes >= self.cleanup_trigger_bytes
            && sample.used_percentage() <= self.max_usage_percent
    }
}

/// Result of [`StorageManager::check_health`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageHealth {
    /// Healthy, degraded (eviction pending) or error (cannot write).
    pub status: HealthStatus,
    /// Bytes available.
    pub free_space: u64,
    /// Used share of the volume, 0-100.
    pub used_percentage: f64,
    /// Short explanation.
    pub message: String,
}

impl StorageHealth {
    /// As a subsystem entry for the pipeline health report.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_subsystem(&self) -> SubsystemHealth {
        SubsystemHealth::new(
            "storage",
            self.status,
            format!(
                "{} ({:.1} GB free, {:.1}% used)",
                self.message,
                self.free_space as f64 / BYTES_PER_GB,
                self.used_percentage
            ),
        )
    }
}

/// Where one image ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedImage {
    /// Session name.
    pub session: String,
    /// Final image path.
    pub image_path: PathBuf,
    /// Final sidecar path.
    pub sidecar_path: PathBuf,
}

/// A session directory as found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Directory name.
    pub name: String,
    /// Bucket start.
    pub start: DateTime<Utc>,
    /// Bucket end.
    pub end: DateTime<Utc>,
    /// Image files in the session.
    pub images: usize,
    /// Total bytes of all files in the session.
    pub bytes: u64,
    /// Whether this is the session currently written to.
    pub active: bool,
    /// Images the catalog holds for this session; `None` without a catalog.
    pub catalogued: Option<u64>,
}

/// Why a session was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Older than the retention age.
    Age,
    /// Needed to recover free space.
    Space,
}

/// A session removed (or, in a dry run, that would be removed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedSession {
    /// Session name.
    pub name: String,
    /// Bytes the session occupied.
    pub bytes: u64,
    /// Why it was chosen.
    pub reason: EvictionReason,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    /// Sessions removed, in removal order.
    pub evicted: Vec<EvictedSession>,
    /// Interrupted evictions finished first.
    pub resumed: usize,
    /// Free space before the pass.
    pub free_before: Option<u64>,
    /// Free space after the pass (estimated in a dry run).
    pub free_after: Option<u64>,
    /// Whether space eviction was needed.
    pub space_pressure: bool,
    /// Whether free space is within the recovery target afterwards.
    pub recovered: bool,
    /// Nothing was actually deleted.
    pub dry_run: bool,
}

impl EvictionReport {
    /// Total bytes freed.
    #[must_use]
    pub fn freed_bytes(&self) -> u64 {
        self.evicted.iter().map(|s| s.bytes).sum()
    }
}

/// What startup recovery cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Partial writes removed.
    pub temp_files: usize,
    /// Sidecars whose image never landed.
    pub orphan_sidecars: usize,
    /// Interrupted evictions completed.
    pub evictions: usize,
}

#[derive(Debug, Default)]
struct WriterState {
    active: Option<StorageSession>,
}

/// Owns the session tree, the write path and eviction.
#[derive(Debug)]
pub struct StorageManager {
    root: PathBuf,
    policy: RetentionPolicy,
    probe: Box<dyn SpaceProbe>,
    catalog: Option<Mutex<Catalog>>,
    writer: Mutex<WriterState>,
}

impl StorageManager {
    /// Open the storage root, creating it if needed, and recover from any crash.
    ///
    /// A catalog that cannot be opened is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, policy: RetentionPolicy, probe: Box<dyn SpaceProbe>) -> Result<Self> {
        let manager = Self::attach(root, policy, probe)?;
        let recovered = manager.recover()?;
        if recovered != RecoveryReport::default() {
            info!(?recovered, "Recovered storage after unclean shutdown");
        }
        Ok(manager)
    }

    /// Open the storage root without crash recovery.
    ///
    /// For inspecting storage that a running pipeline may be writing to.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn attach(root: impl Into<PathBuf>, policy: RetentionPolicy, probe: Box<dyn SpaceProbe>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| Error::DirectoryCreate {
            path: root.clone(),
            source,
        })?;

        let catalog = match Catalog::open(root.join(CATALOG_FILE_NAME)) {
            Ok(catalog) => Some(Mutex::new(catalog)),
            Err(e) => {
                warn!(error = %e, "Catalog unavailable; continuing without it");
                None
            }
        };

        Ok(Self {
            root,
            policy,
            probe,
            catalog,
            writer: Mutex::new(WriterState::default()),
        })
    }

    /// Attach to the storage described by the application configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::attach(
            config.storage_root(),
            RetentionPolicy::from_config(config),
            Box::new(FsSpaceProbe),
        )
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The thresholds in force.
    #[must_use]
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// The session for `time`, creating its directory if needed.
    ///
    /// Idempotent: the same bucket always yields the same session. The
    /// returned session becomes the active one if it is not older than the
    /// current active session.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn resolve_session(&self, time: DateTime<Utc>) -> Result<StorageSession> {
        let mut writer = self.lock_writer()?;
        self.resolve_locked(&mut writer, time)
    }

    fn resolve_locked(&self, writer: &mut WriterState, time: DateTime<Utc>) -> Result<StorageSession> {
        if let Some(active) = writer.active.as_ref().filter(|s| s.contains(time)) {
            return Ok(active.clone());
        }

        let session = StorageSession::for_time(&self.root, time, self.policy.bucket_width);
        fs::create_dir_all(session.path()).map_err(|source| Error::DirectoryCreate {
            path: session.path().to_path_buf(),
            source,
        })?;

        if writer.active.as_ref().is_none_or(|a| a.start() < session.start()) {
            info!(session = session.name(), "Session opened");
            writer.active = Some(session.clone());
        }
        Ok(session)
    }

    /// The session currently written to.
    #[must_use]
    pub fn active_session(&self) -> Option<StorageSession> {
        self.writer.lock().ok().and_then(|w| w.active.clone())
    }

    /// Write an image and its sidecar into the session for its timestamp.
    ///
    /// Both files are written to temporary names, synced, then renamed; the
    /// sidecar lands first so a visible image always has its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageExhausted`] if there is no room, or
    /// [`Error::Persist`] if a write fails.
    pub fn persist(&self, image: &TaggedImage) -> Result<PersistedImage> {
        let mut writer = self.lock_writer()?;
        let session = self.resolve_locked(&mut writer, image.frame().timestamp().time)?;

        let sidecar = serde_json::to_vec_pretty(&image.sidecar())?;
        let required = (image.encoded().len() + sidecar.len()) as u64 + WRITE_RESERVE_BYTES;
        let sample = self
            .probe
            .sample(&self.root)
            .map_err(|source| Error::Persist {
                path: self.root.clone(),
                source,
            })?;
        if sample.free_bytes < required {
            return Err(Error::StorageExhausted {
                free_bytes: sample.free_bytes,
                required_bytes: required,
            });
        }

        let image_path = session.path().join(image.file_name());
        let sidecar_path = session.path().join(image.sidecar_name());
        let image_tmp = tmp_path(&image_path);
        let sidecar_tmp = tmp_path(&sidecar_path);

        let written = write_synced(&sidecar_tmp, &sidecar)
            .and_then(|()| write_synced(&image_tmp, image.encoded()))
            .and_then(|()| rename(&sidecar_tmp, &sidecar_path))
            .and_then(|()| rename(&image_tmp, &image_path));
        if let Err(e) = written {
            let _ = fs::remove_file(&image_tmp);
            let _ = fs::remove_file(&sidecar_tmp);
            return Err(e);
        }
        sync_dir(session.path());
        drop(writer);

        self.record(image, session.name());
        debug!(path = %image_path.display(), "Image persisted");
        Ok(PersistedImage {
            session: session.name().to_string(),
            image_path,
            sidecar_path,
        })
    }

    fn record(&self, image: &TaggedImage, session: &str) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        let fix = image.fix();
        let entry = CatalogEntry {
            sequence: image.frame().sequence(),
            captured_at: image.frame().timestamp().time,
            time_source: image.frame().timestamp().source,
            session: session.to_string(),
            file_name: image.file_name().to_string(),
            fix: fix.validity,
            latitude: fix.latitude,
            longitude: fix.longitude,
            satellites: fix.satellites,
            content_hash: image.content_hash().to_string(),
        };
        let inserted = catalog
            .lock()
            .map_err(|_| Error::internal("catalog lock poisoned"))
            .and_then(|c| c.insert(&entry));
        if let Err(e) = inserted {
            warn!(sequence = entry.sequence, error = %e, "Failed to catalog image");
        }
    }

    /// Sample free space and classify it.
    #[must_use]
    pub fn check_health(&self) -> StorageHealth {
        let sample = match self.probe.sample(&self.root) {
            Ok(sample) => sample,
            Err(e) => {
                return StorageHealth {
                    status: HealthStatus::Error,
                    free_space: 0,
                    used_percentage: 100.0,
                    message: format!("cannot sample free space: {e}"),
                }
            }
        };

        let (status, message) = if sample.free_bytes < WRITE_RESERVE_BYTES {
            (HealthStatus::Error, "volume full".to_string())
        } else if self.policy.needs_eviction(&sample) {
            (HealthStatus::Degraded, "below free-space threshold".to_string())
        } else {
            (HealthStatus::Healthy, "ok".to_string())
        };

        StorageHealth {
            status,
            free_space: sample.free_bytes,
            used_percentage: sample.used_percentage(),
            message,
        }
    }

    /// One maintenance pass: resume interrupted evictions, apply retention
    /// age, then evict oldest sessions while space is short.
    ///
    /// The active session is never a candidate. Safe to re-run after an
    /// interruption.
    ///
    /// # Errors
    ///
    /// Returns an error if the session tree cannot be read or free space
    /// cannot be sampled.
    pub fn evict(&self, now: DateTime<Utc>) -> Result<EvictionReport> {
        self.maintain(now, false)
    }

    /// Report what [`evict`](Self::evict) would remove without deleting anything.
    ///
    /// Freed space is estimated from session sizes.
    ///
    /// # Errors
    ///
    /// Returns an error if the session tree cannot be read or free space
    /// cannot be sampled.
    pub fn plan_eviction(&self, now: DateTime<Utc>) -> Result<EvictionReport> {
        self.maintain(now, true)
    }

    fn maintain(&self, now: DateTime<Utc>, dry_run: bool) -> Result<EvictionReport> {
        let writer = self.lock_writer()?;
        let mut report = EvictionReport {
            dry_run,
            ..EvictionReport::default()
        };
        if !dry_run {
            report.resumed = self.finish_interrupted_evictions()?;
        }

        let protected = self.protected_sessions(writer.active.as_ref(), now);
        let mut candidates: Vec<SessionInfo> = self
            .scan_sessions(writer.active.as_ref())?
            .into_iter()
            .filter(|s| !protected.contains(&s.name))
            .collect();

        // Age pass
        if let Some(max_age) = self.policy.max_age.and_then(|a| TimeDelta::from_std(a).ok()) {
            let cutoff = now - max_age;
            let (expired, keep): (Vec<_>, Vec<_>) =
                candidates.into_iter().partition(|s| s.end <= cutoff);
            candidates = keep;
            for session in expired {
                self.remove_session(&session, EvictionReason::Age, dry_run, &mut report)?;
            }
        }

        // Space pass
        let mut sample = self.sample()?;
        report.free_before = Some(sample.free_bytes);
        if dry_run {
            sample.free_bytes += report.freed_bytes();
        }
        report.space_pressure = self.policy.needs_eviction(&sample);

        if report.space_pressure {
            let protect = TimeDelta::from_std(self.policy.protect_recent).unwrap_or(TimeDelta::zero());
            let cutoff = now - protect;
            for session in candidates.into_iter().filter(|s| s.end <= cutoff) {
                if self.policy.is_recovered(&sample) {
                    break;
                }
                self.remove_session(&session, EvictionReason::Space, dry_run, &mut report)?;
                if dry_run {
                    sample.free_bytes += session.bytes;
                } else {
                    sample = self.sample()?;
                }
            }
            if !self.policy.is_recovered(&sample) {
                warn!(
                    free_bytes = sample.free_bytes,
                    target_bytes = self.policy.cleanup_trigger_bytes,
                    "No eligible sessions left to evict"
                );
            }
        }

        report.free_after = Some(sample.free_bytes);
        report.recovered = self.policy.is_recovered(&sample);
        drop(writer);

        if !report.evicted.is_empty() && !dry_run {
            info!(
                sessions = report.evicted.len(),
                freed_bytes = report.freed_bytes(),
                free_bytes = sample.free_bytes,
                "Eviction pass complete"
            );
        }
        Ok(report)
    }

    /// Sessions that must never be removed: the active one and the one covering `now`.
    fn protected_sessions(&self, active: Option<&StorageSession>, now: DateTime<Utc>) -> HashSet<String> {
        let current = StorageSession::for_time(&self.root, now, self.policy.bucket_width);
        active
            .map(|s| s.name().to_string())
            .into_iter()
            .chain(std::iter::once(current.name().to_string()))
            .collect()
    }

    fn remove_session(
        &self,
        session: &SessionInfo,
        reason: EvictionReason,
        dry_run: bool,
        report: &mut EvictionReport,
    ) -> Result<()> {
        if !dry_run {
            let path = self.root.join(&session.name);
            let doomed = self.root.join(format!("{}{EVICTING_SUFFIX}", session.name));
            // Rename first: an interrupted removal is recognisable and never looks like a live session
            fs::rename(&path, &doomed)?;
            self.forget_session(&session.name);
            fs::remove_dir_all(&doomed)?;
            info!(session = %session.name, bytes = session.bytes, ?reason, "Session evicted");
        }
        report.evicted.push(EvictedSession {
            name: session.name.clone(),
            bytes: session.bytes,
            reason,
        });
        Ok(())
    }

    fn forget_session(&self, name: &str) {
        if let Some(catalog) = &self.catalog {
            let deleted = catalog
                .lock()
                .map_err(|_| Error::internal("catalog lock poisoned"))
                .and_then(|c| c.delete_session(name));
            if let Err(e) = deleted {
                warn!(session = name, error = %e, "Failed to remove session from catalog");
            }
        }
    }

    fn finish_interrupted_evictions(&self) -> Result<usize> {
        let mut finished = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(session) = name
                .strip_suffix(EVICTING_SUFFIX)
                .filter(|session| parse_session_name(session).is_some())
            else {
                continue;
            };
            fs::remove_dir_all(entry.path())?;
            self.forget_session(session);
            warn!(session, "Finished interrupted eviction");
            finished += 1;
        }
        Ok(finished)
    }

    /// Session directories, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be read.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = {
            let writer = self.lock_writer()?;
            self.scan_sessions(writer.active.as_ref())?
        };
        if let Some(catalogued) = self.catalogued_per_session() {
            for session in &mut sessions {
                session.catalogued = Some(catalogued.get(&session.name).copied().unwrap_or(0));
            }
        }
        Ok(sessions)
    }

    fn catalogued_per_session(&self) -> Option<HashMap<String, u64>> {
        let catalog = self.catalog.as_ref()?;
        let counts = catalog
            .lock()
            .map_err(|_| Error::internal("catalog lock poisoned"))
            .and_then(|c| c.session_counts());
        match counts {
            Ok(counts) => Some(
                counts
                    .into_iter()
                    .map(|(session, n)| (session, u64::try_from(n).unwrap_or(0)))
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Could not read catalog session counts");
                None
            }
        }
    }

    fn scan_sessions(&self, active: Option<&StorageSession>) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(start) = parse_session_name(&name) else {
                continue;
            };
            let session = StorageSession::from_start(&self.root, start, self.policy.bucket_width);
            let (images, bytes) = dir_usage(&entry.path())?;
            sessions.push(SessionInfo {
                active: active.is_some_and(|a| a.name() == name),
                name,
                start,
                end: session.end(),
                images,
                bytes,
                catalogued: None,
            });
        }
        sessions.sort_by_key(|s| s.start);
        Ok(sessions)
    }

    /// Remove partial writes and orphaned sidecars, and finish interrupted evictions.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be read.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let _writer = self.lock_writer()?;
        let mut report = RecoveryReport {
            evictions: self.finish_interrupted_evictions()?,
            ..RecoveryReport::default()
        };

        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();
            // Only session buckets are ours; anything else on the volume is left alone
            if parse_session_name(&name).is_none() || !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if let Err(e) = recover_session(&entry.path(), &mut report) {
                warn!(session = name, error = %e, "Skipping unreadable session during recovery");
            }
        }
        Ok(report)
    }

    /// Highest sequence number already stored, in the catalog or on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the session tree cannot be read.
    pub fn last_sequence(&self) -> Result<Option<u64>> {
        // Catalog inserts can fail without failing the persist, so the files
        // on disk may be ahead of it
        let catalogued = self.catalog.as_ref().and_then(|catalog| {
            catalog
                .lock()
                .map_err(|_| Error::internal("catalog lock poisoned"))
                .and_then(|c| c.max_sequence())
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Catalog sequence query failed; scanning files");
                    None
                })
        });

        let mut max = None;
        for session in self.list_sessions()? {
            for entry in fs::read_dir(self.root.join(&session.name))? {
                let name = entry?.file_name().to_string_lossy().to_string();
                let sequence = name
                    .strip_suffix(".jpg")
                    .and_then(|stem| stem.split('_').next())
                    .and_then(|seq| seq.parse::<u64>().ok());
                max = max.max(sequence);
            }
        }
        Ok(max.max(catalogued))
    }

    /// Catalog statistics, if a catalog is available.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog query fails.
    pub fn catalog_stats(&self) -> Result<Option<catalog::CatalogStats>> {
        match &self.catalog {
            Some(catalog) => {
                let catalog = catalog
                    .lock()
                    .map_err(|_| Error::internal("catalog lock poisoned"))?;
                Ok(Some(catalog.stats()?))
            }
            None => Ok(None),
        }
    }

    /// The most recently catalogued image, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be queried.
    pub fn latest_image(&self) -> Result<Option<CatalogEntry>> {
        match &self.catalog {
            Some(catalog) => {
                let catalog = catalog
                    .lock()
                    .map_err(|_| Error::internal("catalog lock poisoned"))?;
                Ok(catalog.recent(1)?.into_iter().next())
            }
            None => Ok(None),
        }
    }

    fn sample(&self) -> Result<SpaceSample> {
        Ok(self.probe.sample(&self.root)?)
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, WriterState>> {
        self.writer
            .lock()
            .map_err(|_| Error::internal("storage writer lock poisoned"))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let persist_err = |source: io::Error| Error::Persist {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::create(path).map_err(persist_err)?;
    file.write_all(bytes).map_err(persist_err)?;
    file.sync_all().map_err(persist_err)
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|source| Error::Persist {
        path: to.to_path_buf(),
        source,
    })
}

fn sync_dir(path: &Path) {
    // Directory fsync is not supported everywhere; failure only weakens durability
    if let Err(e) = File::open(path).and_then(|dir| dir.sync_all()) {
        debug!(path = %path.display(), error = %e, "Directory sync skipped");
    }
}

/// Clean one session directory of partial writes and orphaned sidecars.
fn recover_session(dir: &Path, report: &mut RecoveryReport) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if name.ends_with(TMP_SUFFIX) {
            fs::remove_file(&path)?;
            report.temp_files += 1;
        } else if name.ends_with(".json") && !path.with_extension("jpg").exists() {
            fs::remove_file(&path)?;
            report.orphan_sidecars += 1;
        }
    }
    Ok(())
}

fn dir_usage(path: &Path) -> Result<(usize, u64)> {
    let mut images = 0;
    let mut bytes = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            bytes += metadata.len();
            if entry.path().extension().is_some_and(|ext| ext == "jpg") {
                images += 1;
            }
        }
    }
    Ok((images, bytes))
}
