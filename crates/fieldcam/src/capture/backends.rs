//! Concrete camera backends.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, trace};

use super::exposure::ExposureSettings;
use super::{BackendFactory, Capabilities, CameraBackend, RawImage};
use crate::config::{BackendKind, BackendSpec, CaptureConfig, CommandConfig};
use crate::error::{Error, Result};

/// Runs an external still-capture program and decodes its stdout.
#[derive(Debug)]
pub struct CommandBackend {
    config: CommandConfig,
    device_index: u32,
    width: u32,
    height: u32,
    exposure: ExposureSettings,
    pending: Option<RawImage>,
    opened: bool,
}

impl CommandBackend {
    /// Create a command backend for the given device index.
    #[must_use]
    pub fn new(config: CommandConfig, device_index: u32, width: u32, height: u32) -> Self {
        Self {
            config,
            device_index,
            width,
            height,
            exposure: ExposureSettings::default(),
            pending: None,
            opened: false,
        }
    }

    /// The full argument list for one capture with the current exposure.
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        let shutter = self.exposure.shutter_us.unwrap_or_default().to_string();
        let substitute = |arg: &String| {
            arg.replace("{device}", &self.device_index.to_string())
                .replace("{width}", &self.width.to_string())
                .replace("{height}", &self.height.to_string())
                .replace("{ev}", &format!("{:.1}", self.exposure.ev))
                .replace("{shutter}", &shutter)
        };

        let mut args: Vec<String> = self.config.args.iter().map(substitute).collect();
        if !self.exposure.auto {
            args.extend(self.config.manual_exposure_args.iter().map(substitute));
        }
        args
    }

    async fn run_capture(&self) -> Result<RawImage> {
        let args = self.arguments();
        trace!(program = %self.config.program, ?args, "Running capture command");

        let output = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.unavailable(format!("failed to run {}: {e}", self.config.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().next_back().unwrap_or("no output").trim().to_string();
            return Err(self.unavailable(format!("{} ({})", reason, output.status)));
        }
        if output.stdout.is_empty() {
            return Err(self.unavailable("capture produced no data"));
        }

        let bytes = output.stdout;
        let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| Error::internal(format!("decode task failed: {e}")))?
            .map_err(|e| self.unavailable(format!("undecodable capture output: {e}")))?;

        let rgb = decoded.to_rgb8();
        Ok(RawImage {
            width: rgb.width(),
            height: rgb.height(),
            pixels: rgb.into_raw(),
        })
    }

    fn unavailable(&self, message: impl Into<String>) -> Error {
        Error::device_unavailable(format!("camera{}", self.device_index), message)
    }
}

#[async_trait::async_trait]
impl CameraBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn device_index(&self) -> u32 {
        self.device_index
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exposure_control: true,
        }
    }

    async fn open(&mut self) -> Result<()> {
        // The program has no persistent handle; a first capture proves the device exists
        let first = self.run_capture().await?;
        self.pending = Some(first);
        self.opened = true;
        debug!(device = self.device_index, "Command backend opened");
        Ok(())
    }

    async fn probe(&mut self) -> Result<RawImage> {
        match self.pending.take() {
            Some(image) => Ok(image),
            None => self.read_frame().await,
        }
    }

    async fn read_frame(&mut self) -> Result<RawImage> {
        if !self.opened {
            return Err(self.unavailable("backend not open"));
        }
        self.run_capture().await
    }

    async fn apply_exposure(&mut self, settings: &ExposureSettings) -> Result<()> {
        self.exposure = *settings;
        self.pending = None;
        Ok(())
    }

    async fn close(&mut self) {
        self.pending = None;
        self.opened = false;
    }
}

/// Generates a test pattern without any hardware.
#[derive(Debug)]
pub struct SyntheticBackend {
    device_index: u32,
    width: u32,
    height: u32,
    brightness: u8,
    exposure: ExposureSettings,
    frames_read: u64,
    opened: bool,
}

impl SyntheticBackend {
    /// Create a synthetic backend producing frames of the given size.
    #[must_use]
    pub fn new(device_index: u32, width: u32, height: u32) -> Self {
        Self {
            device_index,
            width,
            height,
            brightness: 128,
            exposure: ExposureSettings::default(),
            frames_read: 0,
            opened: false,
        }
    }

    /// Set the base brightness of the pattern at EV 0.
    #[must_use]
    pub fn with_brightness(mut self, brightness: u8) -> Self {
        self.brightness = brightness;
        self
    }

    /// The exposure currently applied.
    #[must_use]
    pub fn exposure(&self) -> ExposureSettings {
        self.exposure
    }

    /// Number of frames produced so far.
    #[must_use]
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn render(&self) -> RawImage {
        let gain = 2f64.powf(f64::from(self.exposure.ev));
        let base = (f64::from(self.brightness) * gain).clamp(0.0, 255.0);
        // Moves one column per frame so consecutive frames differ
        let offset = (self.frames_read % u64::from(self.width.max(1))) as u32;

        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let ripple = f64::from((x % 16 + y % 16) % 16) - 7.5;
                let value = (base + ripple).clamp(0.0, 255.0) as u8;
                let marker = if x == offset { 255 } else { value };
                pixels.extend_from_slice(&[value, marker, value]);
            }
        }
        RawImage {
            width: self.width,
            height: self.height,
            pixels,
        }
    }
}

#[async_trait::async_trait]
impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn device_index(&self) -> u32 {
        self.device_index
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exposure_control: true,
        }
    }

    async fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<RawImage> {
        if !self.opened {
            return Err(Error::device_unavailable("synthetic", "backend not open"));
        }
        let image = self.render();
        self.frames_read += 1;
        Ok(image)
    }

    async fn apply_exposure(&mut self, settings: &ExposureSettings) -> Result<()> {
        self.exposure = *settings;
        Ok(())
    }

    async fn close(&mut self) {
        self.opened = false;
    }
}

/// Builds the backends named in the capture configuration.
#[derive(Debug, Clone)]
pub struct DefaultBackendFactory {
    command: CommandConfig,
    width: u32,
    height: u32,
}

impl DefaultBackendFactory {
    /// Create a factory from the capture configuration.
    #[must_use]
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            command: config.command.clone(),
            width: config.width,
            height: config.height,
        }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, spec: &BackendSpec) -> Result<Box<dyn CameraBackend>> {
        Ok(match spec.kind {
            BackendKind::Command => Box::new(CommandBackend::new(
                self.command.clone(),
                spec.device_index,
                self.width,
                self.height,
            )),
            BackendKind::Synthetic => Box::new(SyntheticBackend::new(
                spec.device_index,
                self.width,
                self.height,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(program: &str, args: &[&str]) -> CommandConfig {
        CommandConfig {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            manual_exposure_args: vec!["--shutter".to_string(), "{shutter}".to_string()],
        }
    }

    #[test]
    fn test_command_arguments_substitute_placeholders() {
        let mut backend = CommandBackend::new(
            command("cam", &["--camera", "{device}", "{width}x{height}", "--ev", "{ev}"]),
            2,
            640,
            480,
        );
        assert_eq!(
            backend.arguments(),
            vec!["--camera", "2", "640x480", "--ev", "0.0"]
        );

        backend.exposure = ExposureSettings::corrected(-2.0, 1500);
        assert_eq!(
            backend.arguments(),
            vec!["--camera", "2", "640x480", "--ev", "-2.0", "--shutter", "1500"]
        );
    }

    #[tokio::test]
    async fn test_command_backend_missing_program_is_unavailable() {
        let mut backend = CommandBackend::new(
            command("/nonexistent/fieldcam-capture", &[]),
            0,
            16,
            16,
        );
        let err = backend.open().await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_failing_program_is_unavailable() {
        let mut backend = CommandBackend::new(command("false", &[]), 0, 16, 16);
        assert!(backend.open().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_rejects_garbage_output() {
        let mut backend = CommandBackend::new(command("echo", &["not an image"]), 0, 16, 16);
        let err = backend.open().await.unwrap_err();
        assert!(err.to_string().contains("undecodable"));
    }

    #[tokio::test]
    async fn test_synthetic_frames_have_consistent_shape() {
        let mut backend = SyntheticBackend::new(0, 8, 4);
        assert!(backend.read_frame().await.is_err());

        backend.open().await.unwrap();
        let frame = backend.read_frame().await.unwrap();
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 4);
        assert_eq!(frame.pixels.len(), 8 * 4 * 3);

        let next = backend.read_frame().await.unwrap();
        assert_ne!(frame.pixels, next.pixels);
    }

    #[test]
    fn test_factory_builds_requested_kind() {
        let factory = DefaultBackendFactory::from_config(&CaptureConfig::default());
        let backend = factory
            .create(&BackendSpec {
                kind: BackendKind::Synthetic,
                device_index: 3,
            })
            .unwrap();
        assert_eq!(backend.name(), "synthetic");
        assert_eq!(backend.device_index(), 3);
    }
}
