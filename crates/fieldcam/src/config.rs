//! Configuration management for fieldcam.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "fieldcam";

/// Bytes in one gigabyte, as used by the storage thresholds.
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Slowest accepted cadence: one frame a day.
pub const MIN_RATE_HZ: f64 = 1.0 / 86_400.0;

/// Fastest accepted cadence.
pub const MAX_RATE_HZ: f64 = 100.0;

/// Largest accepted frame edge, in pixels.
pub const MAX_FRAME_EDGE: u32 = 16_384;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FIELDCAM_`, sections split by `__`)
/// 2. TOML config file at `~/.config/fieldcam/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Image acquisition configuration.
    pub capture: CaptureConfig,
    /// Position sensor configuration.
    pub position: PositionConfig,
    /// Storage and retention configuration.
    pub storage: StorageConfig,
    /// Pipeline cadence and stage budgets.
    pub pipeline: PipelineConfig,
    /// Identifiers embedded in every image.
    pub device: DeviceConfig,
}

/// The kind of capture backend to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Run an external still-capture program and decode its output.
    Command,
    /// Generate a test pattern; useful for bench setups.
    Synthetic,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// One entry in the ordered list of capture backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Which backend implementation to use.
    pub kind: BackendKind,
    /// Device index passed to the backend.
    #[serde(default)]
    pub device_index: u32,
}

/// The external program used by the command backend.
///
/// Arguments may contain `{device}`, `{width}`, `{height}`, `{ev}` and
/// `{shutter}` placeholders. The program must write one PNG or JPEG
/// image to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Program to run.
    pub program: String,
    /// Arguments for every capture.
    pub args: Vec<String>,
    /// Extra arguments appended when auto exposure is disabled.
    pub manual_exposure_args: Vec<String>,
}

/// Image acquisition configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target capture rate in frames per second.
    pub rate_hz: f64,
    /// Backends to try, in order.
    pub backends: Vec<BackendSpec>,
    /// Command backend settings.
    pub command: CommandConfig,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Mean brightness (0-255) above which a frame counts as severely overexposed.
    pub overexposure_threshold: f64,
    /// Exposure value applied by the corrective pass.
    pub corrected_ev: f32,
    /// Fixed shutter time in microseconds applied by the corrective pass.
    pub corrected_shutter_us: u32,
    /// Consecutive capture failures before the device is re-opened.
    pub max_consecutive_failures: u32,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
}

/// Position sensor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Serial port of the position sensor. `None` runs in no-position mode.
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Seconds without a usable sentence before the tracker degrades to FALLBACK.
    pub silence_timeout_secs: u64,
    /// Maximum age in seconds of a fix still usable for tagging a frame.
    pub staleness_secs: u64,
    /// How far in milliseconds a fix may be newer than the frame it tags.
    pub forward_tolerance_ms: u64,
    /// Seconds to wait for a REAL fix at startup (0 = don't wait).
    pub startup_fix_wait_secs: u64,
    /// Sysfs PPS assert file for pulse-edge timestamps.
    pub pps_path: Option<PathBuf>,
    /// Whether the first REAL fix may step the system clock.
    pub set_system_clock: bool,
    /// Seconds between drift checks after the initial clock correction.
    pub drift_check_interval_secs: u64,
    /// Drift in milliseconds that triggers a correction.
    pub drift_threshold_ms: u64,
    /// Number of recent fixes kept for frame matching.
    pub history_len: usize,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for session buckets.
    /// Defaults to `~/.local/share/fieldcam/images`
    pub root: Option<PathBuf>,
    /// Free space (GB) below which eviction starts.
    pub min_free_gb: f64,
    /// Free space (GB) eviction tries to recover to.
    pub cleanup_trigger_gb: f64,
    /// Volume usage percentage above which eviction starts.
    pub max_usage_percent: f64,
    /// Maximum age of sessions in days. Set to 0 for unlimited.
    pub retention_days: u32,
    /// Width of a session bucket in minutes.
    pub bucket_minutes: u32,
    /// Sessions younger than this (minutes) are never evicted for space.
    pub protect_recent_minutes: u32,
}

/// Pipeline cadence and stage budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture stage budget in milliseconds.
    pub capture_timeout_ms: u64,
    /// Tagging stage budget in milliseconds.
    pub tag_timeout_ms: u64,
    /// Persist stage budget in milliseconds.
    pub persist_timeout_ms: u64,
    /// Health-check stage budget in milliseconds.
    pub health_timeout_ms: u64,
    /// Budget for a full camera re-open, which runs before the capture stage.
    pub reopen_timeout_ms: u64,
    /// Seconds between retention/eviction passes.
    pub maintenance_interval_secs: u64,
}

/// Device identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Camera make.
    pub make: String,
    /// Camera model.
    pub model: String,
    /// Unit serial number or host name.
    pub serial: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        let args = [
            "--camera", "{device}", "--nopreview", "--immediate", "--width", "{width}",
            "--height", "{height}", "--ev", "{ev}", "--encoding", "png", "-o", "-",
        ];
        Self {
            program: "rpicam-still".to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            manual_exposure_args: vec![
                "--shutter".to_string(),
                "{shutter}".to_string(),
                "--gain".to_string(),
                "1".to_string(),
                "--awb".to_string(),
                "daylight".to_string(),
            ],
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            rate_hz: 1.0,
            backends: vec![
                BackendSpec {
                    kind: BackendKind::Command,
                    device_index: 0,
                },
                BackendSpec {
                    kind: BackendKind::Command,
                    device_index: 1,
                },
            ],
            command: CommandConfig::default(),
            width: 2028,
            height: 1520,
            overexposure_threshold: 230.0,
            corrected_ev: -2.0,
            corrected_shutter_us: 2_000,
            max_consecutive_failures: 5,
            jpeg_quality: 90,
        }
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            silence_timeout_secs: 10,
            staleness_secs: 30,
            forward_tolerance_ms: 500,
            startup_fix_wait_secs: 0,
            pps_path: None,
            set_system_clock: false,
            drift_check_interval_secs: 3600,
            drift_threshold_ms: 1000,
            history_len: 64,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None, // Will be resolved to default at runtime
            min_free_gb: 5.0,
            cleanup_trigger_gb: 10.0,
            max_usage_percent: 95.0,
            retention_days: 30,
            bucket_minutes: 60,
            protect_recent_minutes: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: 5_000,
            tag_timeout_ms: 2_000,
            persist_timeout_ms: 2_000,
            health_timeout_ms: 1_000,
            reopen_timeout_ms: 30_000,
            maintenance_interval_secs: 60,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            make: "fieldcam".to_string(),
            model: "fieldcam-1".to_string(),
            serial: "unknown".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `FIELDCAM_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("FIELDCAM_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::ConfigValidation { message });

        if !(MIN_RATE_HZ..=MAX_RATE_HZ).contains(&self.capture.rate_hz) {
            return invalid(format!(
                "rate_hz must be within {MIN_RATE_HZ:.6}..={MAX_RATE_HZ}, got {}",
                self.capture.rate_hz
            ));
        }
        if self.capture.backends.is_empty() {
            return invalid("at least one capture backend is required".to_string());
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture width and height must be greater than 0".to_string());
        }
        if self.capture.width > MAX_FRAME_EDGE || self.capture.height > MAX_FRAME_EDGE {
            return invalid(format!(
                "capture width and height must be at most {MAX_FRAME_EDGE}, got {}x{}",
                self.capture.width, self.capture.height
            ));
        }
        if !(0.0..=255.0).contains(&self.capture.overexposure_threshold) {
            return invalid("overexposure_threshold must be within 0..=255".to_string());
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return invalid(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            ));
        }

        if self.storage.min_free_gb < 0.0 {
            return invalid("min_free_gb cannot be negative".to_string());
        }
        if self.storage.cleanup_trigger_gb < self.storage.min_free_gb {
            return invalid(format!(
                "cleanup_trigger_gb ({}) cannot be less than min_free_gb ({})",
                self.storage.cleanup_trigger_gb, self.storage.min_free_gb
            ));
        }
        if !(self.storage.max_usage_percent > 0.0 && self.storage.max_usage_percent <= 100.0) {
            return invalid("max_usage_percent must be within (0, 100]".to_string());
        }
        if self.storage.bucket_minutes == 0 {
            return invalid("bucket_minutes must be greater than 0".to_string());
        }

        let pipeline = &self.pipeline;
        for (name, value) in [
            ("capture_timeout_ms", pipeline.capture_timeout_ms),
            ("tag_timeout_ms", pipeline.tag_timeout_ms),
            ("persist_timeout_ms", pipeline.persist_timeout_ms),
            ("health_timeout_ms", pipeline.health_timeout_ms),
            ("reopen_timeout_ms", pipeline.reopen_timeout_ms),
            ("maintenance_interval_secs", pipeline.maintenance_interval_secs),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than 0"));
            }
        }

        if self.position.history_len == 0 {
            return invalid("history_len must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Get the storage root, resolving defaults if not set.
    #[must_use]
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("images"))
    }

    /// Get the interval between capture cycles.
    ///
    /// Rates outside the accepted range are clamped, so this never panics on
    /// an unvalidated config.
    #[must_use]
    pub fn capture_period(&self) -> Duration {
        let rate = if self.capture.rate_hz.is_nan() {
            MIN_RATE_HZ
        } else {
            self.capture.rate_hz.clamp(MIN_RATE_HZ, MAX_RATE_HZ)
        };
        Duration::from_secs_f64(1.0 / rate)
    }

    /// Get the bucket width as a Duration.
    #[must_use]
    pub fn bucket_width(&self) -> Duration {
        Duration::from_secs(u64::from(self.storage.bucket_minutes) * 60)
    }

    /// Get the retention age as a Duration.
    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        if self.storage.retention_days == 0 {
            None
        } else {
            Some(Duration::from_secs(
                u64::from(self.storage.retention_days) * 24 * 60 * 60,
            ))
        }
    }

    /// Get the maintenance interval as a Duration.
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.maintenance_interval_secs)
    }
}

impl StorageConfig {
    /// Low-water mark in bytes.
    #[must_use]
    pub fn min_free_bytes(&self) -> u64 {
        gb_to_bytes(self.min_free_gb)
    }

    /// Recovery target in bytes.
    #[must_use]
    pub fn cleanup_trigger_bytes(&self) -> u64 {
        gb_to_bytes(self.cleanup_trigger_gb)
    }
}

impl PositionConfig {
    /// Get the silence timeout as a Duration.
    #[must_use]
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    /// Get the staleness window as a Duration.
    #[must_use]
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    /// Get the forward tolerance as a Duration.
    #[must_use]
    pub fn forward_tolerance(&self) -> Duration {
        Duration::from_millis(self.forward_tolerance_ms)
    }

    /// Get the drift check interval as a Duration.
    #[must_use]
    pub fn drift_check_interval(&self) -> Duration {
        Duration::from_secs(self.drift_check_interval_secs)
    }

    /// Get the drift threshold as a Duration.
    #[must_use]
    pub fn drift_threshold(&self) -> Duration {
        Duration::from_millis(self.drift_threshold_ms)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * BYTES_PER_GB) as u64
}
