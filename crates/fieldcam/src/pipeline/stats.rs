//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the cycle loop and read by health reporting.
#[derive(Debug, Default)]
pub struct PipelineStats {
    cycles: AtomicU64,
    frames_persisted: AtomicU64,
    dropped_frames: AtomicU64,
    capture_timeouts: AtomicU64,
    capture_failures: AtomicU64,
    encode_failures: AtomicU64,
    persist_failures: AtomicU64,
    stage_timeouts: AtomicU64,
    fallback_tags: AtomicU64,
    sessions_evicted: AtomicU64,
}

/// A point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Cycles started.
    pub cycles: u64,
    /// Images written.
    pub frames_persisted: u64,
    /// Cycles that produced no stored image.
    pub dropped_frames: u64,
    /// Captures abandoned at their deadline.
    pub capture_timeouts: u64,
    /// Captures that returned no frame.
    pub capture_failures: u64,
    /// Frames that could not be encoded or tagged.
    pub encode_failures: u64,
    /// Images that could not be written.
    pub persist_failures: u64,
    /// Tag, persist or health stages abandoned at their deadline.
    pub stage_timeouts: u64,
    /// Images stored with a FALLBACK fix.
    pub fallback_tags: u64,
    /// Sessions removed by maintenance.
    pub sessions_evicted: u64,
}

impl PipelineStats {
    /// Count a started cycle.
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a stored image.
    pub fn record_persisted(&self) {
        self.frames_persisted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a cycle that stored nothing.
    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a capture abandoned at its deadline.
    pub fn record_capture_timeout(&self) {
        self.capture_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a capture that returned no frame.
    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a frame that could not be tagged.
    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an image that could not be written.
    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a tag, persist or health stage abandoned at its deadline.
    pub fn record_stage_timeout(&self) {
        self.stage_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an image stored with a FALLBACK fix.
    pub fn record_fallback_tag(&self) {
        self.fallback_tags.fetch_add(1, Ordering::Relaxed);
    }

    /// Add evicted sessions.
    pub fn record_evicted(&self, sessions: u64) {
        self.sessions_evicted.fetch_add(sessions, Ordering::Relaxed);
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            frames_persisted: self.frames_persisted.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            capture_timeouts: self.capture_timeouts.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
            fallback_tags: self.fallback_tags.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(PipelineStats::default().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_counters_increment() {
        let stats = PipelineStats::default();
        stats.record_cycle();
        stats.record_cycle();
        stats.record_capture_timeout();
        stats.record_dropped();
        stats.record_evicted(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.capture_timeouts, 1);
        assert_eq!(snapshot.dropped_frames, 1);
        assert_eq!(snapshot.sessions_evicted, 3);
        assert_eq!(snapshot.frames_persisted, 0);
    }
}
