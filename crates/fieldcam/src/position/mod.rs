//! Position tracking.
//!
//! The [`PositionTracker`] owns the current best-known fix. The fix is an
//! immutable `Arc<PositionFix>` published through a `watch` channel: the
//! single writer swaps in a complete new snapshot, so readers never see a
//! partially-updated fix and never hold a lock across an await point.

pub mod nmea;
pub mod reader;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PositionConfig;
use crate::pipeline::health::{HealthStatus, SubsystemHealth};
use crate::time::{ClockCorrection, ClockDiscipline, ClockModel, PulseSource, Timestamp};

use self::nmea::Sentence;

pub use reader::{spawn_reader, ReaderExit};

/// Whether a fix came from the sensor or is the diagnostic placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixValidity {
    /// Coordinates reported by the position sensor.
    Real,
    /// No usable reading; coordinates are pinned at (0, 0).
    Fallback,
}

impl fmt::Display for FixValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "REAL"),
            Self::Fallback => write!(f, "FALLBACK"),
        }
    }
}

/// A position reading, real or fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Altitude above mean sea level in meters, if reported.
    pub altitude: Option<f64>,
    /// Satellites used in the fix.
    pub satellites: u8,
    /// Fix-quality code as reported by the receiver.
    pub fix_quality: u8,
    /// When the fix was taken, with provenance.
    pub timestamp: Timestamp,
    /// REAL or FALLBACK.
    pub validity: FixValidity,
}

impl PositionFix {
    /// The placeholder fix used whenever no real reading is available.
    #[must_use]
    pub fn fallback(timestamp: Timestamp) -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            satellites: 0,
            fix_quality: 0,
            timestamp,
            validity: FixValidity::Fallback,
        }
    }

    /// Whether this fix came from the sensor.
    #[must_use]
    pub fn is_real(&self) -> bool {
        self.validity == FixValidity::Real
    }
}

/// Something that can answer "where were we at time `t`?".
pub trait FixSource: Send + Sync {
    /// The fix closest to `at` that is not newer than `at + forward_tolerance`
    /// and not older than `at - staleness`.
    fn fix_for(
        &self,
        at: DateTime<Utc>,
        forward_tolerance: Duration,
        staleness: Duration,
    ) -> Option<Arc<PositionFix>>;
}

/// Counters kept by the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    /// Sentences decoded successfully.
    pub sentences: u64,
    /// Lines discarded as malformed.
    pub parse_errors: u64,
    /// Fix updates published.
    pub updates: u64,
    /// Times the tracker fell back after silence.
    pub degradations: u64,
}

#[derive(Debug)]
struct TrackerState {
    last_usable: Option<Instant>,
    last_date: Option<NaiveDate>,
    discipline: Option<ClockDiscipline>,
}

/// Maintains the current best-known position fix.
#[derive(Debug)]
pub struct PositionTracker {
    current: watch::Sender<Arc<PositionFix>>,
    history: Mutex<VecDeque<Arc<PositionFix>>>,
    state: Mutex<TrackerState>,
    pending_correction: Mutex<Option<ClockCorrection>>,
    clock: Arc<ClockModel>,
    pulse: Option<Arc<dyn PulseSource>>,
    silence_timeout: Duration,
    history_len: usize,
    sentences: AtomicU64,
    parse_errors: AtomicU64,
    updates: AtomicU64,
    degradations: AtomicU64,
}

impl PositionTracker {
    /// Create a tracker that starts out at the FALLBACK fix.
    #[must_use]
    pub fn new(config: &PositionConfig, clock: Arc<ClockModel>) -> Self {
        let (current, _) = watch::channel(Arc::new(PositionFix::fallback(clock.now())));
        Self {
            current,
            history: Mutex::new(VecDeque::with_capacity(config.history_len)),
            state: Mutex::new(TrackerState {
                last_usable: None,
                last_date: None,
                discipline: None,
            }),
            pending_correction: Mutex::new(None),
            clock,
            pulse: None,
            silence_timeout: config.silence_timeout(),
            history_len: config.history_len.max(1),
            sentences: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            degradations: AtomicU64::new(0),
        }
    }

    /// Use hardware pulse edges as the preferred timestamp source.
    #[must_use]
    pub fn with_pulse_source(mut self, pulse: Arc<dyn PulseSource>) -> Self {
        self.pulse = Some(pulse);
        self
    }

    /// Let the first REAL fix correct the system clock.
    #[must_use]
    pub fn with_clock_discipline(self, discipline: ClockDiscipline) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.discipline = Some(discipline);
        }
        self
    }

    /// Take the clock correction decided by the last update, if any.
    ///
    /// The tracker never steps the clock itself; the caller applies the
    /// correction where blocking is acceptable.
    pub fn take_clock_correction(&self) -> Option<ClockCorrection> {
        self.pending_correction.lock().ok()?.take()
    }

    /// The shared clock model this tracker anchors.
    #[must_use]
    pub fn clock(&self) -> &Arc<ClockModel> {
        &self.clock
    }

    /// Feed a burst of sentences and publish the strongest usable reading.
    ///
    /// Malformed lines are discarded and counted. Returns `true` when a new
    /// fix was published.
    pub fn update<S: AsRef<str>>(&self, lines: &[S]) -> bool {
        let received_at = Instant::now();
        let mut parsed: Vec<Sentence> = Vec::with_capacity(lines.len());

        for line in lines {
            let line = line.as_ref();
            if line.trim().is_empty() {
                continue;
            }
            match nmea::parse_sentence(line) {
                Ok(Some(sentence)) => {
                    self.sentences.fetch_add(1, Ordering::Relaxed);
                    parsed.push(sentence);
                }
                Ok(None) => trace!(line, "Ignoring sentence without position"),
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, line = line.escape_debug().to_string(), "Discarded sensor input");
                }
            }
        }

        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        if let Some(date) = parsed.iter().rev().find_map(|s| s.date) {
            state.last_date = Some(date);
        }

        // Later sentences win ties so the newest reading of equal strength is used
        let Some(best) = parsed
            .iter()
            .filter(|s| s.usable_coordinates().is_some())
            .fold(None::<&Sentence>, |best, s| match best {
                Some(b) if b.strength() > s.strength() => Some(b),
                _ => Some(s),
            })
        else {
            drop(state);
            self.check_silence();
            return false;
        };
        let Some((latitude, longitude)) = best.usable_coordinates() else {
            return false;
        };

        let date = best.date.or(state.last_date);
        let device_time = match (date, best.time) {
            (Some(date), Some(time)) => Some(date.and_time(time).and_utc()),
            _ => None,
        };
        let timestamp = self
            .clock
            .select(self.pulse.as_ref(), device_time, received_at);
        let mut correction = None;
        if let Some(time) = device_time {
            self.clock.anchor(time, received_at);
            if let Some(discipline) = state.discipline.as_mut() {
                correction = discipline.observe(time, received_at);
            }
        }

        // Altitude and satellite count may come from a weaker sentence in the same burst
        let satellites = best
            .satellites
            .or_else(|| parsed.iter().find_map(|s| s.satellites))
            .unwrap_or(0);
        let altitude = best
            .altitude
            .or_else(|| parsed.iter().find_map(|s| s.altitude));

        let fix = Arc::new(PositionFix {
            latitude,
            longitude,
            altitude,
            satellites,
            fix_quality: best.fix_quality,
            timestamp,
            validity: FixValidity::Real,
        });

        let first = state.last_usable.is_none();
        state.last_usable = Some(received_at);
        drop(state);

        if let Some(correction) = correction {
            if let Ok(mut pending) = self.pending_correction.lock() {
                *pending = Some(correction);
            }
        }

        if let Ok(mut history) = self.history.lock() {
            if history.len() >= self.history_len {
                history.pop_front();
            }
            history.push_back(Arc::clone(&fix));
        }

        let was_real = self.current.send_replace(Arc::clone(&fix)).is_real();
        self.updates.fetch_add(1, Ordering::Relaxed);
        if first || !was_real {
            info!(
                latitude,
                longitude,
                satellites,
                source = %fix.timestamp.source,
                "Position fix acquired"
            );
        } else {
            trace!(latitude, longitude, satellites, "Position fix updated");
        }
        true
    }

    /// Degrade to FALLBACK if no usable reading arrived within the silence timeout.
    ///
    /// Returns `true` if this call caused the degradation.
    pub fn check_silence(&self) -> bool {
        if !self.current.borrow().is_real() {
            return false;
        }
        let silent = self.state.lock().is_ok_and(|state| {
            state
                .last_usable
                .is_some_and(|last| last.elapsed() >= self.silence_timeout)
        });
        if !silent {
            return false;
        }

        self.current
            .send_replace(Arc::new(PositionFix::fallback(self.clock.now())));
        self.degradations.fetch_add(1, Ordering::Relaxed);
        warn!(
            timeout_secs = self.silence_timeout.as_secs(),
            "Position sensor silent; falling back"
        );
        true
    }

    /// The latest fix, or the FALLBACK fix if nothing has validated.
    #[must_use]
    pub fn current_fix(&self) -> Arc<PositionFix> {
        Arc::clone(&self.current.borrow())
    }

    /// Wait until a REAL fix is available or the timeout expires.
    pub async fn wait_for_fix(&self, timeout: Duration) -> Option<Arc<PositionFix>> {
        let mut rx = self.current.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|fix| fix.is_real())
                .await
                .map(|fix| Arc::clone(&fix))
        })
        .await;
        match waited {
            Ok(Ok(fix)) => Some(fix),
            _ => None,
        }
    }

    /// Health of the position subsystem.
    #[must_use]
    pub fn health(&self) -> SubsystemHealth {
        let fix = self.current_fix();
        if fix.is_real() {
            SubsystemHealth::new(
                "position",
                HealthStatus::Healthy,
                format!("{} satellites, quality {}", fix.satellites, fix.fix_quality),
            )
        } else {
            SubsystemHealth::new("position", HealthStatus::Degraded, "no fix (FALLBACK)")
        }
    }

    /// Snapshot of the tracker's counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            sentences: self.sentences.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            degradations: self.degradations.load(Ordering::Relaxed),
        }
    }
}

impl FixSource for PositionTracker {
    fn fix_for(
        &self,
        at: DateTime<Utc>,
        forward_tolerance: Duration,
        staleness: Duration,
    ) -> Option<Arc<PositionFix>> {
        let forward = TimeDelta::from_std(forward_tolerance).ok()?;
        let staleness = TimeDelta::from_std(staleness).ok()?;
        let history = self.history.lock().ok()?;

        history
            .iter()
            .filter(|fix| {
                let offset = at.signed_duration_since(fix.timestamp.time);
                offset >= -forward && offset <= staleness
            })
            .min_by_key(|fix| at.signed_duration_since(fix.timestamp.time).abs())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimestampSource;
    use nmea::with_checksum;

    fn tracker() -> PositionTracker {
        PositionTracker::new(&PositionConfig::default(), Arc::new(ClockModel::new()))
    }

    fn gga(time: &str, lat: &str, lon: &str, quality: u8, sats: u8) -> String {
        with_checksum(&format!(
            "GPGGA,{time},{lat},N,{lon},E,{quality},{sats:02},1.0,100.0,M,,M,,"
        ))
    }

    fn rmc(time: &str, lat: &str, lon: &str, date: &str) -> String {
        with_checksum(&format!("GPRMC,{time},A,{lat},N,{lon},E,0.0,0.0,{date},,"))
    }

    #[derive(Debug, Default)]
    struct CountingSetter(Arc<AtomicU64>);

    impl crate::time::ClockSetter for CountingSetter {
        fn set(&self, _time: DateTime<Utc>) -> std::io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_update_defers_clock_correction_to_caller() {
        let calls = Arc::new(AtomicU64::new(0));
        let tracker = tracker().with_clock_discipline(ClockDiscipline::new(
            Box::new(CountingSetter(Arc::clone(&calls))),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));

        assert!(tracker.update(&[rmc("120000", "4807.038", "01131.000", "010624")]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let correction = tracker.take_clock_correction().unwrap();
        assert_eq!(
            correction.target().date_naive(),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        );
        assert!(tracker.take_clock_correction().is_none());

        correction.apply();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_starts_in_fallback() {
        let tracker = tracker();
        let fix = tracker.current_fix();
        assert_eq!(fix.validity, FixValidity::Fallback);
        assert_eq!(fix.latitude, 0.0);
        assert_eq!(fix.longitude, 0.0);
        assert_eq!(fix.satellites, 0);
    }

    #[tokio::test]
    async fn test_valid_coordinates_make_fix_real() {
        let tracker = tracker();
        let changed = tracker.update(&[gga("120000", "4807.038", "01131.000", 1, 8)]);
        assert!(changed);

        let fix = tracker.current_fix();
        assert!(fix.is_real());
        assert_eq!(fix.satellites, 8);
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_partial_fix_is_accepted_as_real() {
        let tracker = tracker();
        // Quality 0 with only 2 satellites still carries a usable coordinate pair
        assert!(tracker.update(&[gga("120000", "5130.000", "00007.000", 0, 2)]));

        let fix = tracker.current_fix();
        assert_eq!(fix.validity, FixValidity::Real);
        assert_eq!(fix.satellites, 2);
        assert_eq!(fix.fix_quality, 0);
    }

    #[tokio::test]
    async fn test_malformed_input_is_discarded_not_raised() {
        let tracker = tracker();
        let changed = tracker.update(&["garbage", "$GPGGA,broken*00", ""]);
        assert!(!changed);
        assert!(!tracker.current_fix().is_real());
        assert_eq!(tracker.stats().parse_errors, 2);
    }

    #[tokio::test]
    async fn test_line_noise_with_multibyte_characters_is_discarded() {
        let tracker = tracker();
        let noisy = "$GPGGA,123519.\u{e9}\u{e9},4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
        let control = "$GPRMC,12\u{7}3519,A,4807.038,N,01131.000,E,,,230394,,";
        assert!(!tracker.update(&[noisy, control]));
        assert!(!tracker.current_fix().is_real());
        assert_eq!(tracker.stats().parse_errors, 2);

        // The tracker keeps working afterwards
        assert!(tracker.update(&[gga("120000", "4807.038", "01131.000", 1, 8)]));
        assert!(tracker.current_fix().is_real());
    }

    #[tokio::test]
    async fn test_zero_coordinates_rejected() {
        let tracker = tracker();
        assert!(!tracker.update(&[gga("120000", "0000.000", "00000.000", 1, 8)]));
        assert!(!tracker.current_fix().is_real());
    }

    #[tokio::test]
    async fn test_strongest_sentence_wins() {
        let tracker = tracker();
        let weak = gga("120000", "1000.000", "01000.000", 0, 3);
        let strong = rmc("120000", "2000.000", "02000.000", "010624");
        assert!(tracker.update(&[strong, weak]));

        let fix = tracker.current_fix();
        // RMC with status A outranks an unvalidated GGA
        assert!((fix.latitude - 20.0).abs() < 1e-9);
        // Satellite count borrowed from the GGA in the same burst
        assert_eq!(fix.satellites, 3);
    }

    #[tokio::test]
    async fn test_device_time_uses_rmc_date() {
        let tracker = tracker();
        tracker.update(&[rmc("083000", "4807.038", "01131.000", "010624")]);
        tracker.update(&[gga("083001", "4807.038", "01131.000", 1, 7)]);

        let fix = tracker.current_fix();
        assert_eq!(fix.timestamp.source, TimestampSource::Device);
        assert_eq!(fix.timestamp.time.to_rfc3339(), "2024-06-01T08:30:01+00:00");
        assert!(tracker.clock().is_anchored());
    }

    #[tokio::test]
    async fn test_time_without_date_falls_back_to_wallclock() {
        let tracker = tracker();
        tracker.update(&[gga("083001", "4807.038", "01131.000", 1, 7)]);
        let fix = tracker.current_fix();
        assert_eq!(fix.timestamp.source, TimestampSource::Wallclock);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_degrades_to_fallback() {
        let tracker = tracker();
        tracker.update(&[gga("120000", "4807.038", "01131.000", 1, 8)]);
        assert!(!tracker.check_silence());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tracker.check_silence());
        assert!(!tracker.current_fix().is_real());
        assert_eq!(tracker.stats().degradations, 1);

        // Already degraded: no double counting
        assert!(!tracker.check_silence());
    }

    #[tokio::test]
    async fn test_wait_for_fix_times_out() {
        let tracker = tracker();
        assert!(tracker.wait_for_fix(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_fix_returns_when_fix_arrives() {
        let tracker = Arc::new(tracker());
        let writer = Arc::clone(&tracker);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.update(&[gga("120000", "4807.038", "01131.000", 1, 8)]);
        });

        let fix = tracker.wait_for_fix(Duration::from_secs(5)).await;
        assert!(fix.is_some_and(|f| f.is_real()));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fix_for_picks_closest_not_newer() {
        let tracker = tracker();
        tracker.update(&[rmc("120000", "1000.000", "01000.000", "010624")]);
        tracker.update(&[rmc("120010", "2000.000", "02000.000", "010624")]);
        tracker.update(&[rmc("120020", "3000.000", "03000.000", "010624")]);

        let at = DateTime::parse_from_rfc3339("2024-06-01T12:00:12Z")
            .unwrap()
            .with_timezone(&Utc);
        let fix = tracker
            .fix_for(at, Duration::from_millis(500), Duration::from_secs(30))
            .unwrap();
        assert!((fix.latitude - 20.0).abs() < 1e-9);

        // A fix 8s in the future is beyond the forward tolerance
        let at = DateTime::parse_from_rfc3339("2024-06-01T11:59:52Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(tracker
            .fix_for(at, Duration::from_millis(500), Duration::from_secs(30))
            .is_none());
    }

    #[tokio::test]
    async fn test_fix_for_respects_staleness() {
        let tracker = tracker();
        tracker.update(&[rmc("120000", "1000.000", "01000.000", "010624")]);
        let at = DateTime::parse_from_rfc3339("2024-06-01T12:05:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(tracker
            .fix_for(at, Duration::from_millis(500), Duration::from_secs(30))
            .is_none());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = PositionConfig {
            history_len: 2,
            ..PositionConfig::default()
        };
        let tracker = PositionTracker::new(&config, Arc::new(ClockModel::new()));
        for second in ["00", "01", "02", "03"] {
            tracker.update(&[rmc(&format!("1200{second}"), "1000.000", "01000.000", "010624")]);
        }
        assert_eq!(tracker.history.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_reflects_fix() {
        let tracker = tracker();
        assert_eq!(tracker.health().status, HealthStatus::Degraded);
        tracker.update(&[gga("120000", "4807.038", "01131.000", 1, 8)]);
        assert_eq!(tracker.health().status, HealthStatus::Healthy);
    }
}
