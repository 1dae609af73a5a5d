//! Timestamp provenance and clock discipline.
//!
//! Every fix and every frame carries a [`Timestamp`] that records which
//! clock produced it. The selection chain, most precise first, is:
//! pulse edge, device-reported time, monotonic clock anchored to the last
//! device time, and finally the unverified wall clock.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimestampSource {
    /// Hardware pulse-per-second edge.
    Pulse,
    /// Time reported in the position sensor's sentence.
    Device,
    /// Monotonic clock offset from the last device time.
    Monotonic,
    /// System wall clock, possibly never corrected.
    Wallclock,
}

impl TimestampSource {
    /// Rough upper bound on the error of a timestamp from this source.
    #[must_use]
    pub fn precision(self) -> Duration {
        match self {
            Self::Pulse => Duration::from_micros(1),
            Self::Device => Duration::from_millis(100),
            Self::Monotonic => Duration::from_millis(250),
            Self::Wallclock => Duration::from_secs(1),
        }
    }
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pulse => write!(f, "PULSE"),
            Self::Device => write!(f, "DEVICE"),
            Self::Monotonic => write!(f, "MONOTONIC"),
            Self::Wallclock => write!(f, "WALLCLOCK"),
        }
    }
}

/// A UTC instant together with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// The instant, always UTC.
    pub time: DateTime<Utc>,
    /// Which clock produced it.
    pub source: TimestampSource,
}

impl Timestamp {
    /// Create a timestamp.
    #[must_use]
    pub fn new(time: DateTime<Utc>, source: TimestampSource) -> Self {
        Self { time, source }
    }

    /// A wall-clock timestamp for the current instant.
    #[must_use]
    pub fn wallclock_now() -> Self {
        Self::new(Utc::now(), TimestampSource::Wallclock)
    }

    /// Precision estimate of this timestamp.
    #[must_use]
    pub fn precision(&self) -> Duration {
        self.source.precision()
    }
}

/// Supplies the most recent hardware pulse edge.
pub trait PulseSource: Send + Sync + fmt::Debug {
    /// The time of the latest pulse edge on the system clock, if any.
    fn latest_edge(&self) -> Option<DateTime<Utc>>;
}

/// Reads pulse edges from the kernel PPS subsystem.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct SysfsPulseSource {
    path: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl SysfsPulseSource {
    /// Create a pulse source reading the given sysfs `assert` file.
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(target_os = "linux")]
impl PulseSource for SysfsPulseSource {
    fn latest_edge(&self) -> Option<DateTime<Utc>> {
        match fieldcam_linux::read_pps_assert(&self.path) {
            Ok(edge) => edge.and_then(|e| DateTime::from_timestamp(e.secs, e.nanos)),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "PPS read failed");
                None
            }
        }
    }
}

/// A pulse edge is only trusted for this long after it fired.
const PULSE_FRESHNESS: Duration = Duration::from_millis(1100);

/// Maps the monotonic clock onto UTC using the last device time.
///
/// Shared between the position tracker, which anchors it, and the
/// acquisition controller, which stamps frames with it.
#[derive(Debug, Default)]
pub struct ClockModel {
    anchor: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl ClockModel {
    /// Create an unanchored clock model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `time` was the device time at monotonic instant `at`.
    pub fn anchor(&self, time: DateTime<Utc>, at: Instant) {
        if let Ok(mut anchor) = self.anchor.lock() {
            *anchor = Some((at, time));
        }
    }

    /// Whether a device time has ever been observed.
    #[must_use]
    pub fn is_anchored(&self) -> bool {
        self.anchor.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    /// UTC time at monotonic instant `at`, if anchored.
    #[must_use]
    pub fn monotonic_at(&self, at: Instant) -> Option<DateTime<Utc>> {
        let (anchor_at, anchor_time) = (*self.anchor.lock().ok()?)?;
        let delta = if at >= anchor_at {
            TimeDelta::from_std(at - anchor_at).ok()?
        } else {
            -TimeDelta::from_std(anchor_at - at).ok()?
        };
        anchor_time.checked_add_signed(delta)
    }

    /// Best available timestamp for "now" without a sentence in hand.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        match self.monotonic_at(Instant::now()) {
            Some(time) => Timestamp::new(time, TimestampSource::Monotonic),
            None => Timestamp::wallclock_now(),
        }
    }

    /// Pick a timestamp for a sentence received at `received_at`.
    ///
    /// Walks the fallback chain: a fresh pulse edge, then the device time,
    /// then the anchored monotonic clock, then the wall clock.
    #[must_use]
    pub fn select(
        &self,
        pulse: Option<&Arc<dyn PulseSource>>,
        device_time: Option<DateTime<Utc>>,
        received_at: Instant,
    ) -> Timestamp {
        if let Some(edge) = pulse.and_then(|p| p.latest_edge()) {
            let age = Utc::now().signed_duration_since(edge);
            if age >= TimeDelta::zero() && age.to_std().is_ok_and(|a| a <= PULSE_FRESHNESS) {
                return Timestamp::new(edge, TimestampSource::Pulse);
            }
        }
        if let Some(time) = device_time {
            return Timestamp::new(time, TimestampSource::Device);
        }
        if let Some(time) = self.monotonic_at(received_at) {
            return Timestamp::new(time, TimestampSource::Monotonic);
        }
        Timestamp::wallclock_now()
    }
}

/// Steps the system clock on behalf of the tracker.
pub trait ClockSetter: Send + Sync + fmt::Debug {
    /// Set the system clock to `time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock could not be changed.
    fn set(&self, time: DateTime<Utc>) -> std::io::Result<()>;
}

/// A clock setter that only logs; used when clock setting is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyClockSetter;

impl ClockSetter for LogOnlyClockSetter {
    fn set(&self, time: DateTime<Utc>) -> std::io::Result<()> {
        info!(%time, "System clock correction skipped (disabled)");
        Ok(())
    }
}

/// Steps the system clock through `date`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClockSetter;

#[cfg(target_os = "linux")]
impl ClockSetter for SystemClockSetter {
    fn set(&self, time: DateTime<Utc>) -> std::io::Result<()> {
        fieldcam_linux::set_system_clock(time.timestamp(), time.timestamp_subsec_nanos())
    }
}

/// The result of applying a [`ClockCorrection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    /// The one-time correction on the first REAL fix.
    InitialSet,
    /// A periodic drift correction of the given magnitude.
    DriftCorrected(Duration),
    /// A correction was attempted and failed.
    Failed,
}

/// A clock step decided by [`ClockDiscipline::observe`].
///
/// Applying it may block on a system call, so callers run
/// [`apply`](Self::apply) off the async workers and outside any lock.
#[derive(Debug, Clone)]
pub struct ClockCorrection {
    setter: Arc<dyn ClockSetter>,
    target: DateTime<Utc>,
    drift: Option<Duration>,
}

impl ClockCorrection {
    /// The time the clock will be set to.
    #[must_use]
    pub fn target(&self) -> DateTime<Utc> {
        self.target
    }

    /// Step the clock.
    pub fn apply(self) -> ClockAction {
        let Self {
            setter,
            target,
            drift,
        } = self;
        let initial = drift.is_none();
        match (setter.set(target), drift) {
            (Ok(()), None) => {
                info!(%target, "Initial clock correction from first fix");
                ClockAction::InitialSet
            }
            (Ok(()), Some(drift)) => {
                info!(drift_ms = drift.as_millis(), "Clock drift corrected");
                ClockAction::DriftCorrected(drift)
            }
            (Err(e), _) => {
                warn!(error = %e, initial, "Clock correction failed");
                ClockAction::Failed
            }
        }
    }
}

/// One initial clock step, then periodic drift correction.
///
/// Corrections only move the system clock forward in time for future
/// frames; already-tagged images keep the timestamps they were given.
#[derive(Debug)]
pub struct ClockDiscipline {
    setter: Arc<dyn ClockSetter>,
    drift_interval: Duration,
    drift_threshold: Duration,
    initial_done: bool,
    last_check: Option<Instant>,
}

impl ClockDiscipline {
    /// Create a clock discipline around the given setter.
    #[must_use]
    pub fn new(
        setter: Box<dyn ClockSetter>,
        drift_interval: Duration,
        drift_threshold: Duration,
    ) -> Self {
        Self {
            setter: Arc::from(setter),
            drift_interval,
            drift_threshold,
            initial_done: false,
            last_check: None,
        }
    }

    /// Whether the initial correction has been issued.
    #[must_use]
    pub fn initial_done(&self) -> bool {
        self.initial_done
    }

    /// Feed the device time of a REAL fix received at `received_at`.
    ///
    /// Returns the correction to apply, if one is due. Nothing is changed
    /// until the caller applies it.
    pub fn observe(&mut self, device_time: DateTime<Utc>, received_at: Instant) -> Option<ClockCorrection> {
        let now = Instant::now();
        // Account for the time spent since the sentence arrived
        let elapsed = TimeDelta::from_std(now.saturating_duration_since(received_at))
            .unwrap_or_else(|_| TimeDelta::zero());
        let target = device_time + elapsed;

        if !self.initial_done {
            self.initial_done = true;
            self.last_check = Some(now);
            return Some(self.correction(target, None));
        }

        let due = self
            .last_check
            .is_none_or(|last| now.saturating_duration_since(last) >= self.drift_interval);
        if !due {
            return None;
        }
        self.last_check = Some(now);

        let drift = Utc::now().signed_duration_since(target).abs();
        let drift = drift.to_std().unwrap_or_default();
        if drift <= self.drift_threshold {
            debug!(drift_ms = drift.as_millis(), "Clock drift within threshold");
            return None;
        }
        Some(self.correction(target, Some(drift)))
    }

    fn correction(&self, target: DateTime<Utc>, drift: Option<Duration>) -> ClockCorrection {
        ClockCorrection {
            setter: Arc::clone(&self.setter),
            target,
            drift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingSetter {
        calls: Arc<AtomicUsize>,
    }

    impl ClockSetter for CountingSetter {
        fn set(&self, _time: DateTime<Utc>) -> std::io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FixedPulse(Option<DateTime<Utc>>);

    impl PulseSource for FixedPulse {
        fn latest_edge(&self) -> Option<DateTime<Utc>> {
            self.0
        }
    }

    fn device_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_source_precision_ordering() {
        assert!(TimestampSource::Pulse.precision() < TimestampSource::Device.precision());
        assert!(TimestampSource::Device.precision() < TimestampSource::Monotonic.precision());
        assert!(TimestampSource::Monotonic.precision() < TimestampSource::Wallclock.precision());
    }

    #[test]
    fn test_source_display_and_serde() {
        assert_eq!(TimestampSource::Pulse.to_string(), "PULSE");
        let json = serde_json::to_string(&TimestampSource::Wallclock).unwrap();
        assert_eq!(json, "\"WALLCLOCK\"");
    }

    #[tokio::test]
    async fn test_select_prefers_fresh_pulse() {
        let clock = ClockModel::new();
        let pulse: Arc<dyn PulseSource> = Arc::new(FixedPulse(Some(Utc::now())));

        let ts = clock.select(Some(&pulse), Some(device_time()), Instant::now());
        assert_eq!(ts.source, TimestampSource::Pulse);
    }

    #[tokio::test]
    async fn test_select_ignores_stale_pulse() {
        let clock = ClockModel::new();
        let stale = Utc::now() - TimeDelta::seconds(10);
        let pulse: Arc<dyn PulseSource> = Arc::new(FixedPulse(Some(stale)));

        let ts = clock.select(Some(&pulse), Some(device_time()), Instant::now());
        assert_eq!(ts.source, TimestampSource::Device);
        assert_eq!(ts.time, device_time());
    }

    #[tokio::test]
    async fn test_select_falls_back_to_monotonic_then_wallclock() {
        let clock = ClockModel::new();
        let ts = clock.select(None, None, Instant::now());
        assert_eq!(ts.source, TimestampSource::Wallclock);

        let anchored_at = Instant::now();
        clock.anchor(device_time(), anchored_at);
        let ts = clock.select(None, None, anchored_at + Duration::from_secs(2));
        assert_eq!(ts.source, TimestampSource::Monotonic);
        assert_eq!(ts.time, device_time() + TimeDelta::seconds(2));
    }

    #[tokio::test]
    async fn test_monotonic_before_anchor() {
        let clock = ClockModel::new();
        let at = Instant::now();
        clock.anchor(device_time(), at + Duration::from_secs(5));

        let time = clock.monotonic_at(at).unwrap();
        assert_eq!(time, device_time() - TimeDelta::seconds(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discipline_initial_then_drift_checks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let setter = CountingSetter {
            calls: Arc::clone(&calls),
        };
        let mut discipline = ClockDiscipline::new(
            Box::new(setter),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        // First fix: one-time correction regardless of drift
        let correction = discipline.observe(Utc::now(), Instant::now()).unwrap();
        assert!(discipline.initial_done());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(correction.apply(), ClockAction::InitialSet);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Within the drift interval nothing happens, even with large drift
        assert!(discipline.observe(device_time(), Instant::now()).is_none());

        // After the interval, a large drift is corrected
        tokio::time::advance(Duration::from_secs(61)).await;
        let correction = discipline.observe(device_time(), Instant::now()).unwrap();
        assert!(correction.target() >= device_time());
        assert!(matches!(correction.apply(), ClockAction::DriftCorrected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // After another interval, a drift below threshold is left alone
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(discipline.observe(Utc::now(), Instant::now()).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Debug)]
    struct FailingSetter;

    impl ClockSetter for FailingSetter {
        fn set(&self, _time: DateTime<Utc>) -> std::io::Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }
    }

    #[tokio::test]
    async fn test_failed_correction_is_reported() {
        let mut discipline = ClockDiscipline::new(
            Box::new(FailingSetter),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let correction = discipline.observe(device_time(), Instant::now()).unwrap();
        assert_eq!(correction.apply(), ClockAction::Failed);
        // The initial step is attempted once, even when it fails
        assert!(discipline.observe(device_time(), Instant::now()).is_none());
    }
}
