//! The capture pipeline.
//!
//! One cooperative loop ticks at the configured cadence and runs
//! capture → best fix → tag → persist → health check, each stage under its
//! own deadline. A stage that fails or overruns is counted and the cycle is
//! abandoned; the next tick starts on time regardless. The position reader
//! runs as its own task so a silent sensor never stalls the cadence.

pub mod health;
pub mod state;
pub mod stats;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::backends::DefaultBackendFactory;
use crate::capture::{AcquisitionController, BackendFactory, Frame};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::position::{spawn_reader, PositionTracker, ReaderExit};
use crate::storage::{FsSpaceProbe, RetentionPolicy, SpaceProbe, StorageHealth, StorageManager};
use crate::tagging::{MetadataTagger, TaggedImage};
use crate::time::{ClockDiscipline, ClockModel, ClockSetter, LogOnlyClockSetter};

pub use self::health::{
    CycleOutcome, HealthReport, HealthStatus, StatusSink, SubsystemHealth, TracingStatusSink,
};
pub use self::state::PipelineState;
pub use self::stats::{PipelineStats, StatsSnapshot};

/// While storage is under pressure, maintenance runs at most this often.
const PRESSURE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for the position reader to release its port.
const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A byte stream carrying position sentences.
pub type PositionStream = Box<dyn AsyncRead + Unpin + Send + Sync>;

/// Read-only view of a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineMonitor {
    report: watch::Receiver<HealthReport>,
}

impl PipelineMonitor {
    /// The latest health report.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.report.borrow().clone()
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.report.borrow().state
    }

    /// Wait until the pipeline reaches `state` or stops.
    pub async fn wait_for(&mut self, state: PipelineState) -> PipelineState {
        let reached = self
            .report
            .wait_for(|r| r.state == state || r.state == PipelineState::Stopped)
            .await;
        match reached {
            Ok(report) => report.state,
            Err(_) => PipelineState::Stopped,
        }
    }
}

/// Builds a [`Pipeline`], with injectable collaborators for tests and
/// bench setups.
pub struct PipelineBuilder {
    config: Config,
    factory: Option<Box<dyn BackendFactory>>,
    probe: Option<Box<dyn SpaceProbe>>,
    position: Option<PositionStream>,
    sink: Option<Arc<dyn StatusSink>>,
    clock_setter: Option<Box<dyn ClockSetter>>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("probe", &self.probe)
            .field("position", &self.position.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Use this camera backend factory instead of the configured one.
    #[must_use]
    pub fn backend_factory(mut self, factory: Box<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use this free-space probe instead of the filesystem.
    #[must_use]
    pub fn space_probe(mut self, probe: Box<dyn SpaceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Read position sentences from `stream` instead of the configured port.
    #[must_use]
    pub fn position_stream(mut self, stream: PositionStream) -> Self {
        self.position = Some(stream);
        self
    }

    /// Send status events to `sink` instead of the log.
    #[must_use]
    pub fn status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use `setter` for system clock corrections.
    #[must_use]
    pub fn clock_setter(mut self, setter: Box<dyn ClockSetter>) -> Self {
        self.clock_setter = Some(setter);
        self
    }

    /// Assemble the pipeline. Nothing is opened until [`Pipeline::run`].
    #[must_use]
    pub fn build(self) -> Pipeline {
        let config = self.config;
        let clock = Arc::new(ClockModel::new());

        let setter = self.clock_setter.unwrap_or_else(|| default_clock_setter(&config));
        let tracker = PositionTracker::new(&config.position, Arc::clone(&clock))
            .with_clock_discipline(ClockDiscipline::new(
                setter,
                config.position.drift_check_interval(),
                config.position.drift_threshold(),
            ));
        #[cfg(target_os = "linux")]
        let tracker = match &config.position.pps_path {
            Some(path) => tracker.with_pulse_source(Arc::new(crate::time::SysfsPulseSource::new(path))),
            None => tracker,
        };

        let factory = self
            .factory
            .unwrap_or_else(|| Box::new(DefaultBackendFactory::from_config(&config.capture)));
        let camera = AcquisitionController::new(&config.capture, factory, clock);

        let stats = Arc::new(PipelineStats::default());
        let (report, _) = watch::channel(HealthReport {
            state: PipelineState::Initializing,
            subsystems: Vec::new(),
            counters: StatsSnapshot::default(),
        });

        Pipeline {
            tagger: Arc::new(MetadataTagger::new(&config)),
            tracker: Arc::new(tracker),
            camera,
            storage: None,
            probe: Some(self.probe.unwrap_or_else(|| Box::new(FsSpaceProbe))),
            position: self.position,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingStatusSink)),
            stats,
            report,
            state: PipelineState::Initializing,
            storage_paused: false,
            config,
        }
    }
}

fn default_clock_setter(config: &Config) -> Box<dyn ClockSetter> {
    #[cfg(target_os = "linux")]
    if config.position.set_system_clock {
        return Box::new(crate::time::SystemClockSetter);
    }
    if config.position.set_system_clock {
        warn!("System clock setting is not supported on this platform");
    }
    Box::new(LogOnlyClockSetter)
}

/// Drives the capture loop and owns every subsystem.
pub struct Pipeline {
    config: Config,
    tracker: Arc<PositionTracker>,
    camera: AcquisitionController,
    tagger: Arc<MetadataTagger>,
    storage: Option<Arc<StorageManager>>,
    probe: Option<Box<dyn SpaceProbe>>,
    position: Option<PositionStream>,
    sink: Arc<dyn StatusSink>,
    stats: Arc<PipelineStats>,
    report: watch::Sender<HealthReport>,
    state: PipelineState,
    storage_paused: bool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("camera", &self.camera)
            .field("storage", &self.storage)
            .field("storage_paused", &self.storage_paused)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Start building a pipeline for `config`.
    #[must_use]
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder {
            config,
            factory: None,
            probe: None,
            position: None,
            sink: None,
            clock_setter: None,
        }
    }

    /// A handle for observing health while [`run`](Self::run) executes.
    #[must_use]
    pub fn monitor(&self) -> PipelineMonitor {
        PipelineMonitor {
            report: self.report.subscribe(),
        }
    }

    /// The position tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    /// Current health of every subsystem.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let storage = match &self.storage {
            Some(storage) => storage.check_health().to_subsystem(),
            None => SubsystemHealth::new("storage", HealthStatus::Error, "storage unavailable"),
        };
        self.report_with(storage)
    }

    /// Run until `cancel` fires.
    ///
    /// Returns the final counters. Resources are released before returning,
    /// whether the loop ended by cancellation or initialization failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if no camera backend could be
    /// opened.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<StatsSnapshot> {
        self.open_storage();
        let reader_cancel = cancel.child_token();
        let reader = self.start_position(reader_cancel.clone());

        if !self.camera.initialize().await {
            self.shutdown(reader, &reader_cancel).await;
            return Err(Error::device_unavailable(
                "camera",
                "all backend candidates failed to open",
            ));
        }
        if let Some(last) = self.last_sequence().await {
            self.camera.resume_after(last);
            info!(next_sequence = self.camera.next_sequence(), "Resuming sequence numbering");
        }

        self.wait_for_startup_fix(&cancel).await;

        let initial = self.health();
        let next = if initial.overall() == HealthStatus::Healthy {
            PipelineState::Running
        } else {
            PipelineState::Degraded
        };
        self.report.send_replace(initial);
        self.transition(next);
        self.sink.health(&self.report.borrow());

        if self.state.is_active() && !cancel.is_cancelled() {
            self.cycle_loop(&cancel).await;
        }

        self.shutdown(reader, &reader_cancel).await;
        Ok(self.stats.snapshot())
    }

    fn start_position(&mut self, cancel: CancellationToken) -> Option<JoinHandle<ReaderExit>> {
        let stream = match self.position.take() {
            Some(stream) => stream,
            None => match self.open_position_port() {
                Some(stream) => stream,
                None => {
                    warn!("No position sensor; images will carry FALLBACK fixes");
                    return None;
                }
            },
        };
        Some(spawn_reader(stream, Arc::clone(&self.tracker), cancel))
    }

    #[cfg(feature = "serial")]
    fn open_position_port(&self) -> Option<PositionStream> {
        let port = self.config.position.port.as_deref()?;
        match crate::position::reader::open_serial(port, self.config.position.baud_rate) {
            Ok(stream) => {
                info!(port, baud = self.config.position.baud_rate, "Position sensor opened");
                Some(Box::new(stream))
            }
            Err(e) => {
                warn!(error = %e, "Position sensor unavailable");
                None
            }
        }
    }

    #[cfg(not(feature = "serial"))]
    fn open_position_port(&self) -> Option<PositionStream> {
        if self.config.position.port.is_some() {
            warn!("Built without serial support; ignoring position port");
        }
        None
    }

    /// Open storage if it is not open yet. Failure leaves persistence paused.
    fn open_storage(&mut self) -> bool {
        if self.storage.is_some() {
            return true;
        }
        let Some(probe) = self.probe.take() else {
            return false;
        };
        let root = self.config.storage_root();
        let policy = RetentionPolicy::from_config(&self.config);
        match StorageManager::open(&root, policy, probe) {
            Ok(storage) => {
                info!(root = %root.display(), "Storage opened");
                self.storage = Some(Arc::new(storage));
                true
            }
            Err(e) => {
                error!(root = %root.display(), error = %e, "Storage unavailable");
                // The probe was consumed by the failed open
                self.probe = Some(Box::new(FsSpaceProbe));
                false
            }
        }
    }

    async fn last_sequence(&self) -> Option<u64> {
        let storage = Arc::clone(self.storage.as_ref()?);
        match tokio::task::spawn_blocking(move || storage.last_sequence()).await {
            Ok(Ok(last)) => last,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read last stored sequence");
                None
            }
            Err(e) => {
                warn!(error = %e, "Sequence scan task failed");
                None
            }
        }
    }

    async fn wait_for_startup_fix(&self, cancel: &CancellationToken) {
        let wait = Duration::from_secs(self.config.position.startup_fix_wait_secs);
        if wait.is_zero() {
            return;
        }
        info!(timeout_secs = wait.as_secs(), "Waiting for position fix");
        tokio::select! {
            () = cancel.cancelled() => {}
            fix = self.tracker.wait_for_fix(wait) => match fix {
                Some(fix) => info!(lat = fix.latitude, lon = fix.longitude, "Position fix acquired"),
                None => warn!("No position fix before startup timeout; starting with FALLBACK"),
            },
        }
    }

    async fn cycle_loop(&mut self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.capture_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let maintenance_interval = self.config.maintenance_interval();
        // Run maintenance on the first cycle
        let mut next_maintenance = Instant::now();
        let mut cycle = 0u64;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            cycle += 1;
            self.stats.record_cycle();

            let outcome = self.run_cycle(cancel).await;
            if let Some(outcome) = &outcome {
                if !matches!(outcome, CycleOutcome::Persisted { .. }) {
                    self.stats.record_dropped();
                }
                self.sink.cycle(cycle, outcome);
            }
            if cancel.is_cancelled() {
                break;
            }

            let storage_health = self.check_storage().await;
            let pressure = storage_health
                .as_ref()
                .is_some_and(|h| h.status != HealthStatus::Healthy);
            if self.storage_paused || pressure {
                next_maintenance = next_maintenance.min(Instant::now() + PRESSURE_MAINTENANCE_INTERVAL);
            }
            let maintained = Instant::now() >= next_maintenance;
            if maintained {
                self.maintain().await;
                next_maintenance = Instant::now() + maintenance_interval;
            }

            self.update_state(storage_health, maintained);
        }
    }

    /// One capture → tag → persist pass. `None` if cancelled mid-cycle.
    async fn run_cycle(&mut self, cancel: &CancellationToken) -> Option<CycleOutcome> {
        let frame = match self.capture().await {
            Ok(frame) => frame,
            Err(outcome) => return Some(outcome),
        };
        if cancel.is_cancelled() {
            return None;
        }

        let sequence = frame.sequence();
        let tagged = match self.tag(frame).await {
            Ok(tagged) => tagged,
            Err(outcome) => return Some(outcome),
        };
        if cancel.is_cancelled() {
            return None;
        }

        Some(self.persist(tagged, sequence).await)
    }

    async fn capture(&mut self) -> std::result::Result<Frame, CycleOutcome> {
        if self.camera.needs_reopen() {
            self.reopen_camera().await;
        }
        let deadline = stage_deadline(self.config.pipeline.capture_timeout_ms);
        match tokio::time::timeout(deadline, self.camera.capture()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                self.stats.record_capture_failure();
                Err(dropped("capture", "no frame"))
            }
            Err(_) => {
                self.camera.note_timeout();
                self.stats.record_capture_timeout();
                warn!(
                    timeout_ms = deadline.as_millis(),
                    next_sequence = self.camera.next_sequence(),
                    "Capture timed out; frame dropped"
                );
                let err = Error::CaptureTimeout {
                    elapsed_ms: duration_ms(deadline),
                };
                Err(dropped("capture", err.to_string()))
            }
        }
    }

    /// Re-open the camera under its own budget, apart from the capture deadline.
    async fn reopen_camera(&mut self) {
        let deadline = stage_deadline(self.config.pipeline.reopen_timeout_ms);
        match tokio::time::timeout(deadline, self.camera.reopen()).await {
            Ok(true) => info!("Camera re-opened"),
            Ok(false) => warn!("Camera re-open failed; backing off"),
            Err(_) => {
                self.stats.record_stage_timeout();
                warn!(timeout_ms = deadline.as_millis(), "Camera re-open timed out; backing off");
            }
        }
    }

    async fn tag(&self, frame: Frame) -> std::result::Result<TaggedImage, CycleOutcome> {
        let tagger = Arc::clone(&self.tagger);
        let tracker = Arc::clone(&self.tracker);
        let sequence = frame.sequence();
        let task = tokio::task::spawn_blocking(move || tagger.tag(frame, &*tracker));

        match self.bounded("tag", self.config.pipeline.tag_timeout_ms, task).await {
            Ok(tagged) => {
                if !tagged.fix().is_real() {
                    self.stats.record_fallback_tag();
                }
                Ok(tagged)
            }
            Err(e) => {
                if !matches!(e, Error::Timeout { .. }) {
                    self.stats.record_encode_failure();
                }
                warn!(sequence, error = %e, "Tagging failed; frame dropped");
                Err(dropped("tag", e.to_string()))
            }
        }
    }

    async fn persist(&mut self, tagged: TaggedImage, sequence: u64) -> CycleOutcome {
        let Some(storage) = self.storage.as_ref().map(Arc::clone) else {
            self.stats.record_persist_failure();
            return CycleOutcome::Paused { sequence };
        };
        if self.storage_paused {
            return CycleOutcome::Paused { sequence };
        }

        let real_fix = tagged.fix().is_real();
        let deadline = stage_deadline(self.config.pipeline.persist_timeout_ms);
        let mut task = tokio::task::spawn_blocking(move || storage.persist(&tagged));
        let joined = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                // A started write cannot be abandoned; its result decides the outcome
                self.stats.record_stage_timeout();
                warn!(
                    sequence,
                    timeout_ms = deadline.as_millis(),
                    "Persist overran its deadline; waiting for the write"
                );
                task.await
            }
        };
        let result = joined
            .map_err(|e| Error::internal(format!("persist task failed: {e}")))
            .and_then(|persisted| persisted);
        match result {
            Ok(persisted) => {
                self.stats.record_persisted();
                debug!(sequence, path = %persisted.image_path.display(), "Frame stored");
                CycleOutcome::Persisted {
                    sequence,
                    session: persisted.session,
                    real_fix,
                }
            }
            Err(e) if e.is_storage_exhausted() => {
                self.stats.record_persist_failure();
                warn!(sequence, error = %e, "Storage exhausted; pausing persistence");
                self.storage_paused = true;
                CycleOutcome::Paused { sequence }
            }
            Err(e) => {
                self.stats.record_persist_failure();
                warn!(sequence, error = %e, "Persist failed; frame dropped");
                dropped("persist", e.to_string())
            }
        }
    }

    async fn check_storage(&mut self) -> Option<StorageHealth> {
        let storage = Arc::clone(self.storage.as_ref()?);
        let task = tokio::task::spawn_blocking(move || Ok(storage.check_health()));
        match self.bounded("health", self.config.pipeline.health_timeout_ms, task).await {
            Ok(health) => {
                if self.storage_paused && health.status != HealthStatus::Error {
                    info!(free_bytes = health.free_space, "Storage recovered; resuming persistence");
                    self.storage_paused = false;
                }
                Some(health)
            }
            Err(e) => {
                warn!(error = %e, "Storage health check failed");
                None
            }
        }
    }

    async fn maintain(&mut self) {
        if !self.open_storage() {
            return;
        }
        let Some(storage) = self.storage.as_ref().map(Arc::clone) else {
            return;
        };
        match tokio::task::spawn_blocking(move || storage.evict(Utc::now())).await {
            Ok(Ok(report)) => {
                self.stats.record_evicted(report.evicted.len() as u64);
                if report.space_pressure && !report.recovered {
                    warn!(
                        free_bytes = report.free_after,
                        "Eviction could not recover the cleanup target"
                    );
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Maintenance pass failed"),
            Err(e) => warn!(error = %e, "Maintenance task failed"),
        }
    }

    /// Publish a fresh report, switching between running and degraded.
    fn update_state(&mut self, storage: Option<StorageHealth>, emit: bool) {
        let storage = match (storage, &self.storage) {
            (Some(health), _) => health.to_subsystem(),
            (None, Some(_)) => SubsystemHealth::new("storage", HealthStatus::Degraded, "health check failed"),
            (None, None) => SubsystemHealth::new("storage", HealthStatus::Error, "storage unavailable"),
        };
        let subsystems = self.report_with(storage).subsystems;
        let healthy = subsystems.iter().all(SubsystemHealth::is_healthy);
        let previous = self.state;
        self.transition(if healthy {
            PipelineState::Running
        } else {
            PipelineState::Degraded
        });

        let report = HealthReport {
            state: self.state,
            subsystems,
            counters: self.stats.snapshot(),
        };
        if emit || previous != self.state {
            self.sink.health(&report);
        }
        self.report.send_replace(report);
    }

    fn report_with(&self, storage: SubsystemHealth) -> HealthReport {
        HealthReport {
            state: self.state,
            subsystems: vec![storage, self.tracker.health(), self.camera.health()],
            counters: self.stats.snapshot(),
        }
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug!(from = %self.state, to = %next, "Ignoring invalid state transition");
            return;
        }
        info!(from = %self.state, to = %next, "Pipeline state changed");
        self.state = next;
        let report = self.health_snapshot();
        self.report.send_replace(report);
    }

    /// The last published report with the current state and counters.
    fn health_snapshot(&self) -> HealthReport {
        let mut report = self.report.borrow().clone();
        if report.subsystems.is_empty() {
            return self.health();
        }
        report.state = self.state;
        report.counters = self.stats.snapshot();
        report
    }

    async fn shutdown(&mut self, reader: Option<JoinHandle<ReaderExit>>, reader_cancel: &CancellationToken) {
        self.transition(PipelineState::ShuttingDown);

        // Reverse dependency order: camera, position, storage
        self.camera.shutdown().await;

        reader_cancel.cancel();
        if let Some(reader) = reader {
            match tokio::time::timeout(READER_SHUTDOWN_TIMEOUT, reader).await {
                Ok(Ok(exit)) => debug!(?exit, "Position reader joined"),
                Ok(Err(e)) => warn!(error = %e, "Position reader task failed"),
                Err(_) => warn!("Position reader did not stop in time"),
            }
        }

        self.storage = None;
        self.transition(PipelineState::Stopped);
        let report = self.health_snapshot();
        self.sink.health(&report);
        info!(
            persisted = report.counters.frames_persisted,
            dropped = report.counters.dropped_frames,
            "Pipeline stopped"
        );
    }

    /// Await a blocking stage under its deadline.
    async fn bounded<T, F>(&self, stage: &'static str, timeout_ms: u64, task: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<Result<T>, tokio::task::JoinError>>,
    {
        match tokio::time::timeout(stage_deadline(timeout_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::internal(format!("{stage} task failed: {e}"))),
            Err(_) => {
                self.stats.record_stage_timeout();
                Err(Error::timeout(stage))
            }
        }
    }
}

fn stage_deadline(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

fn dropped(stage: &'static str, reason: impl Into<String>) -> CycleOutcome {
    CycleOutcome::Dropped {
        stage,
        reason: reason.into(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::capture::exposure::ExposureSettings;
    use crate::capture::{Capabilities, CameraBackend, RawImage};
    use crate::config::{BackendKind, BackendSpec};
    use crate::storage::SpaceSample;

    const GB: u64 = 1024 * 1024 * 1024;

    #[derive(Debug)]
    struct FixedProbe(u64);

    /// Plenty of space, but every sample blocks the calling thread.
    #[derive(Debug)]
    struct SlowProbe(Duration);

    impl SpaceProbe for SlowProbe {
        fn sample(&self, _path: &Path) -> io::Result<SpaceSample> {
            std::thread::sleep(self.0);
            Ok(SpaceSample {
                free_bytes: 100 * GB,
                total_bytes: 200 * GB,
            })
        }
    }

    impl SpaceProbe for FixedProbe {
        fn sample(&self, _path: &Path) -> io::Result<SpaceSample> {
            Ok(SpaceSample {
                free_bytes: self.0,
                total_bytes: 200 * GB,
            })
        }
    }

    /// Opens instantly; every read takes `read_delay`.
    #[derive(Debug)]
    struct SlowBackend {
        read_delay: Duration,
    }

    #[async_trait]
    impl CameraBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn device_index(&self) -> u32 {
            0
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn probe(&mut self) -> Result<RawImage> {
            Ok(RawImage {
                width: 4,
                height: 4,
                pixels: vec![100; 48],
            })
        }

        async fn read_frame(&mut self) -> Result<RawImage> {
            tokio::time::sleep(self.read_delay).await;
            self.probe().await
        }

        async fn apply_exposure(&mut self, _settings: &ExposureSettings) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[derive(Debug)]
    struct SlowFactory(Duration);

    impl BackendFactory for SlowFactory {
        fn create(&self, _spec: &BackendSpec) -> Result<Box<dyn CameraBackend>> {
            Ok(Box::new(SlowBackend { read_delay: self.0 }))
        }
    }

    /// The first device opens and then hangs on reads; later opens never finish.
    #[derive(Debug, Default)]
    struct HangingReopenFactory {
        created: std::sync::atomic::AtomicUsize,
    }

    impl BackendFactory for HangingReopenFactory {
        fn create(&self, _spec: &BackendSpec) -> Result<Box<dyn CameraBackend>> {
            let first = self.created.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0;
            Ok(Box::new(HangingBackend { opens: first }))
        }
    }

    #[derive(Debug)]
    struct HangingBackend {
        opens: bool,
    }

    #[async_trait]
    impl CameraBackend for HangingBackend {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn device_index(&self) -> u32 {
            0
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn open(&mut self) -> Result<()> {
            if !self.opens {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn probe(&mut self) -> Result<RawImage> {
            Ok(RawImage {
                width: 4,
                height: 4,
                pixels: vec![100; 48],
            })
        }

        async fn read_frame(&mut self) -> Result<RawImage> {
            std::future::pending().await
        }

        async fn apply_exposure(&mut self, _settings: &ExposureSettings) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[derive(Debug)]
    struct NoCamera;

    impl BackendFactory for NoCamera {
        fn create(&self, spec: &BackendSpec) -> Result<Box<dyn CameraBackend>> {
            Err(Error::device_unavailable(format!("camera{}", spec.device_index), "absent"))
        }
    }

    /// Records outcomes and cancels after `stop_after` cycles.
    #[derive(Debug)]
    struct RecordingSink {
        outcomes: Mutex<Vec<CycleOutcome>>,
        reports: Mutex<Vec<HealthReport>>,
        cancel: CancellationToken,
        stop_after: usize,
    }

    impl RecordingSink {
        fn new(cancel: CancellationToken, stop_after: usize) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(Vec::new()),
                reports: Mutex::new(Vec::new()),
                cancel,
                stop_after,
            })
        }
    }

    impl StatusSink for RecordingSink {
        fn cycle(&self, _cycle: u64, outcome: &CycleOutcome) {
            let mut outcomes = self.outcomes.lock().unwrap();
            outcomes.push(outcome.clone());
            if outcomes.len() >= self.stop_after {
                self.cancel.cancel();
            }
        }

        fn health(&self, report: &HealthReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    fn test_config(root: &Path, rate_hz: f64) -> Config {
        let mut config = Config::default();
        config.storage.root = Some(root.to_path_buf());
        config.storage.retention_days = 0;
        config.capture.rate_hz = rate_hz;
        config.capture.width = 32;
        config.capture.height = 24;
        config.capture.backends = vec![BackendSpec {
            kind: BackendKind::Synthetic,
            device_index: 0,
        }];
        config.position.port = None;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_timeouts_are_dropped_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 4.0);
        config.pipeline.capture_timeout_ms = 200;

        let cancel = CancellationToken::new();
        let sink = RecordingSink::new(cancel.clone(), 5);
        let pipeline = Pipeline::builder(config)
            .backend_factory(Box::new(SlowFactory(Duration::from_secs(10))))
            .space_probe(Box::new(FixedProbe(100 * GB)))
            .status_sink(sink.clone())
            .build();

        let stats = pipeline.run(cancel).await.unwrap();

        assert_eq!(stats.capture_timeouts, 5);
        assert_eq!(stats.dropped_frames, 5);
        assert_eq!(stats.frames_persisted, 0);
        assert!(stats.cycles >= 5);

        let outcomes = sink.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, CycleOutcome::Dropped { stage: "capture", .. })));
    }

    #[tokio::test]
    async fn test_camera_exhaustion_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder(test_config(dir.path(), 4.0))
            .backend_factory(Box::new(NoCamera))
            .space_probe(Box::new(FixedProbe(100 * GB)))
            .build();
        let monitor = pipeline.monitor();

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
        assert_eq!(monitor.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_no_position_runs_degraded_with_fallback_tags() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new(cancel.clone(), 3);
        let pipeline = Pipeline::builder(test_config(dir.path(), 20.0))
            .space_probe(Box::new(FixedProbe(100 * GB)))
            .status_sink(sink.clone())
            .build();
        let monitor = pipeline.monitor();

        let stats = pipeline.run(cancel).await.unwrap();
        assert_eq!(stats.frames_persisted, 3);
        assert_eq!(stats.fallback_tags, 3);

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.last().unwrap().state, PipelineState::Stopped);
        assert_eq!(monitor.state(), PipelineState::Stopped);

        // Without a position sensor the run never reports fully healthy
        let position = reports[0].subsystem("position").unwrap();
        assert_eq!(position.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_sequence_resumes_after_stored_images() {
        let dir = tempfile::tempdir().unwrap();

        for _ in 0..2 {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new(cancel.clone(), 2);
            let pipeline = Pipeline::builder(test_config(dir.path(), 20.0))
                .space_probe(Box::new(FixedProbe(100 * GB)))
                .status_sink(sink)
                .build();
            pipeline.run(cancel).await.unwrap();
        }

        let storage = StorageManager::open(
            dir.path(),
            RetentionPolicy::from_config(&test_config(dir.path(), 20.0)),
            Box::new(FixedProbe(100 * GB)),
        )
        .unwrap();
        assert_eq!(storage.last_sequence().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_slow_write_counts_as_persisted_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 10.0);
        config.pipeline.persist_timeout_ms = 10;

        let cancel = CancellationToken::new();
        let sink = RecordingSink::new(cancel.clone(), 2);
        let pipeline = Pipeline::builder(config)
            .space_probe(Box::new(SlowProbe(Duration::from_millis(60))))
            .status_sink(sink.clone())
            .build();

        let stats = pipeline.run(cancel).await.unwrap();
        assert_eq!(stats.frames_persisted, 2);
        assert_eq!(stats.dropped_frames, 0);
        assert!(stats.stage_timeouts >= 2);

        let outcomes = sink.outcomes.lock().unwrap();
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, CycleOutcome::Persisted { .. })));

        let stored = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .flat_map(|session| std::fs::read_dir(session.path()).unwrap())
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jpg"))
            .count();
        assert_eq!(stored, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_reopen_does_not_stall_the_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 4.0);
        config.capture.max_consecutive_failures = 1;
        config.pipeline.capture_timeout_ms = 200;
        config.pipeline.reopen_timeout_ms = 100;

        let cancel = CancellationToken::new();
        let sink = RecordingSink::new(cancel.clone(), 4);
        let pipeline = Pipeline::builder(config)
            .backend_factory(Box::new(HangingReopenFactory::default()))
            .space_probe(Box::new(FixedProbe(100 * GB)))
            .status_sink(sink.clone())
            .build();

        let stats = pipeline.run(cancel).await.unwrap();

        // One abandoned re-open, then the controller backs off
        assert_eq!(stats.capture_timeouts, 1);
        assert_eq!(stats.dropped_frames, 4);
        let outcomes = sink.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 4);
    }

    #[tokio::test]
    async fn test_full_volume_pauses_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new(cancel.clone(), 3);
        let pipeline = Pipeline::builder(test_config(dir.path(), 20.0))
            .space_probe(Box::new(FixedProbe(1024)))
            .status_sink(sink.clone())
            .build();

        let stats = pipeline.run(cancel).await.unwrap();
        assert_eq!(stats.frames_persisted, 0);
        assert_eq!(stats.dropped_frames, 3);

        let outcomes = sink.outcomes.lock().unwrap();
        assert!(outcomes.iter().all(|o| matches!(o, CycleOutcome::Paused { .. })));
    }
}
