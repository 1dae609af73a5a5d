//! Image acquisition.
//!
//! The [`AcquisitionController`] owns the camera handle. Backends are tried
//! in configured order behind the uniform [`CameraBackend`] interface; the
//! first one that opens wins and is remembered so a later re-open can
//! report what it settled on.

pub mod backends;
pub mod exposure;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{BackendSpec, CaptureConfig};
use crate::error::Result;
use crate::pipeline::health::{HealthStatus, SubsystemHealth};
use crate::time::{ClockModel, Timestamp};

use self::exposure::{ExposureOutcome, ExposureSettings};

pub use backends::{CommandBackend, DefaultBackendFactory, SyntheticBackend};

/// Minimum time between re-open attempts once the camera is unhealthy.
const REOPEN_BACKOFF: Duration = Duration::from_secs(30);

/// An RGB8 image as returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Interleaved RGB bytes, row-major.
    pub pixels: Vec<u8>,
}

impl RawImage {
    /// Whether the buffer length matches the declared dimensions.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let expected = u64::from(self.width) * u64::from(self.height) * 3;
        expected > 0 && self.pixels.len() as u64 == expected
    }
}

/// One acquired frame. Immutable once created.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u64,
    timestamp: Timestamp,
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
    backend: &'static str,
}

impl Frame {
    /// Build a frame, or `None` if the buffer shape is inconsistent.
    #[must_use]
    pub fn new(
        sequence: u64,
        timestamp: Timestamp,
        image: RawImage,
        backend: &'static str,
    ) -> Option<Self> {
        if !image.is_consistent() {
            return None;
        }
        Some(Self {
            sequence,
            timestamp,
            width: image.width,
            height: image.height,
            pixels: image.pixels.into(),
            backend,
        })
    }

    /// Strictly increasing sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Acquisition timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Interleaved RGB bytes.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Name of the backend that produced the frame.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .field("backend", &self.backend)
            .finish()
    }
}

/// What a backend can do beyond plain capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Exposure value and auto modes can be changed.
    pub exposure_control: bool,
}

/// A capture mechanism the controller may try.
#[async_trait::async_trait]
pub trait CameraBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs and metadata.
    fn name(&self) -> &'static str;

    /// Device index this backend was created for.
    fn device_index(&self) -> u32;

    /// What this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// Acquire the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    async fn open(&mut self) -> Result<()>;

    /// Capture a frame for exposure measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if no frame could be read.
    async fn probe(&mut self) -> Result<RawImage> {
        self.read_frame().await
    }

    /// Capture one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if no frame could be read.
    async fn read_frame(&mut self) -> Result<RawImage>;

    /// Apply exposure settings to subsequent frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings were rejected.
    async fn apply_exposure(&mut self, settings: &ExposureSettings) -> Result<()>;

    /// Release the device. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Creates a backend for a configured candidate.
pub trait BackendFactory: Send + Sync + fmt::Debug {
    /// Build (but do not open) the backend for `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend kind is not available on this system.
    fn create(&self, spec: &BackendSpec) -> Result<Box<dyn CameraBackend>>;
}

/// The backend the controller settled on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveBackend {
    /// Position in the candidate list.
    pub candidate: usize,
    /// Backend name.
    pub name: &'static str,
    /// Device index.
    pub device_index: u32,
    /// Result of the startup exposure check.
    pub exposure: Option<ExposureOutcome>,
}

/// Counters kept by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames returned.
    pub frames: u64,
    /// Failed capture attempts.
    pub failures: u64,
    /// Full device re-opens.
    pub reopens: u64,
}

/// Owns the image sensor and hands out sequenced frames.
#[derive(Debug)]
pub struct AcquisitionController {
    candidates: Vec<BackendSpec>,
    factory: Box<dyn BackendFactory>,
    clock: Arc<ClockModel>,
    overexposure_threshold: f64,
    corrected: ExposureSettings,
    max_consecutive_failures: u32,
    backend: Option<Box<dyn CameraBackend>>,
    active: Option<ActiveBackend>,
    next_sequence: u64,
    consecutive_failures: u32,
    unhealthy_since: Option<Instant>,
    last_reopen: Option<Instant>,
    stats: CaptureStats,
}

impl AcquisitionController {
    /// Create a controller over the configured backend candidates.
    #[must_use]
    pub fn new(config: &CaptureConfig, factory: Box<dyn BackendFactory>, clock: Arc<ClockModel>) -> Self {
        Self {
            candidates: config.backends.clone(),
            factory,
            clock,
            overexposure_threshold: config.overexposure_threshold,
            corrected: ExposureSettings::corrected(config.corrected_ev, config.corrected_shutter_us),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            backend: None,
            active: None,
            next_sequence: 0,
            consecutive_failures: 0,
            unhealthy_since: None,
            last_reopen: None,
            stats: CaptureStats::default(),
        }
    }

    /// Try each candidate in order until one opens.
    ///
    /// Runs the exposure check on the backend that opened. Returns `false`
    /// if every candidate failed.
    pub async fn initialize(&mut self) -> bool {
        self.release().await;

        for (index, spec) in self.candidates.iter().enumerate() {
            let mut backend = match self.factory.create(spec) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(candidate = index, kind = %spec.kind, error = %e, "Backend unavailable");
                    continue;
                }
            };

            if let Err(e) = backend.open().await {
                warn!(
                    candidate = index,
                    kind = %spec.kind,
                    device = spec.device_index,
                    error = %e,
                    "Backend failed to open, trying next"
                );
                backend.close().await;
                continue;
            }

            let exposure = match exposure::correct_exposure(
                backend.as_mut(),
                self.overexposure_threshold,
                self.corrected,
            )
            .await
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(candidate = index, error = %e, "Exposure probe failed");
                    None
                }
            };

            let active = ActiveBackend {
                candidate: index,
                name: backend.name(),
                device_index: backend.device_index(),
                exposure,
            };
            info!(
                candidate = index,
                backend = active.name,
                device = active.device_index,
                "Camera initialized"
            );
            self.backend = Some(backend);
            self.active = Some(active);
            self.consecutive_failures = 0;
            self.unhealthy_since = None;
            return true;
        }

        error!(candidates = self.candidates.len(), "All camera backends failed");
        self.unhealthy_since.get_or_insert_with(Instant::now);
        false
    }

    /// Capture one frame, or `None` on failure.
    ///
    /// Sequence numbers are only consumed by frames actually returned.
    pub async fn capture(&mut self) -> Option<Frame> {
        if self.needs_reopen() {
            self.reopen().await;
        }
        let backend = self.backend.as_mut()?;

        let image = match backend.read_frame().await {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, failures = self.consecutive_failures + 1, "Capture failed");
                self.record_failure();
                return None;
            }
        };

        let timestamp = self.clock.now();
        let Some(frame) = Frame::new(self.next_sequence, timestamp, image, backend.name()) else {
            warn!("Frame buffer shape does not match its dimensions");
            self.record_failure();
            return None;
        };

        self.next_sequence += 1;
        self.consecutive_failures = 0;
        self.stats.frames += 1;
        debug!(sequence = frame.sequence(), "Frame captured");
        Some(frame)
    }

    /// Count a capture that was abandoned by its deadline.
    pub fn note_timeout(&mut self) {
        self.record_failure();
    }

    /// Continue numbering after `last_sequence`.
    pub fn resume_after(&mut self, last_sequence: u64) {
        self.next_sequence = self.next_sequence.max(last_sequence.saturating_add(1));
    }

    /// The sequence number the next frame will carry.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// The backend in use, if any.
    #[must_use]
    pub fn active_backend(&self) -> Option<&ActiveBackend> {
        self.active.as_ref()
    }

    /// Whether the controller currently has a usable device.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.backend.is_some() && self.unhealthy_since.is_none()
    }

    /// Health of the camera subsystem.
    #[must_use]
    pub fn health(&self) -> SubsystemHealth {
        match (&self.active, self.is_healthy()) {
            (Some(active), true) if self.consecutive_failures == 0 => SubsystemHealth::new(
                "camera",
                HealthStatus::Healthy,
                format!("{} device {}", active.name, active.device_index),
            ),
            (Some(_), true) => SubsystemHealth::new(
                "camera",
                HealthStatus::Degraded,
                format!("{} consecutive failures", self.consecutive_failures),
            ),
            _ => SubsystemHealth::new("camera", HealthStatus::Error, "no usable backend"),
        }
    }

    /// Snapshot of the controller's counters.
    #[must_use]
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Release the device.
    pub async fn shutdown(&mut self) {
        self.release().await;
        info!(frames = self.stats.frames, "Camera released");
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.stats.failures += 1;
    }

    /// Whether the device should be re-opened before the next capture.
    ///
    /// False while a failed re-open is still backing off.
    #[must_use]
    pub fn needs_reopen(&self) -> bool {
        let wanted = self.backend.is_none() || self.consecutive_failures >= self.max_consecutive_failures;
        wanted && !self.backing_off()
    }

    /// Tear down and re-initialize the device.
    ///
    /// Safe to cancel: an abandoned attempt leaves the controller unhealthy
    /// and backing off, like a failed one.
    pub async fn reopen(&mut self) -> bool {
        self.last_reopen = Some(Instant::now());
        self.unhealthy_since.get_or_insert_with(Instant::now);
        self.stats.reopens += 1;

        warn!(
            failures = self.consecutive_failures,
            "Re-opening camera after repeated failures"
        );
        // `initialize` clears the unhealthy mark on success
        self.initialize().await
    }

    fn backing_off(&self) -> bool {
        self.unhealthy_since.is_some() && self.last_reopen.is_some_and(|last| last.elapsed() < REOPEN_BACKOFF)
    }

    async fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close().await;
        }
    }
}
