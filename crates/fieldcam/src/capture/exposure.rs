//! Brightness probing and the one-shot overexposure correction.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CameraBackend, RawImage};
use crate::error::Result;

/// Upper bound on pixels sampled when measuring brightness.
const MAX_SAMPLES: usize = 65_536;

/// Exposure parameters a backend may accept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureSettings {
    /// Exposure compensation in stops.
    pub ev: f32,
    /// Whether auto exposure and white balance are enabled.
    pub auto: bool,
    /// Fixed shutter time when auto is disabled.
    pub shutter_us: Option<u32>,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            ev: 0.0,
            auto: true,
            shutter_us: None,
        }
    }
}

impl ExposureSettings {
    /// Settings for the corrective pass: lowered EV and auto modes off.
    #[must_use]
    pub fn corrected(ev: f32, shutter_us: u32) -> Self {
        Self {
            ev,
            auto: false,
            shutter_us: Some(shutter_us),
        }
    }
}

/// Result of the startup exposure check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExposureOutcome {
    /// Brightness was below the threshold; nothing changed.
    WithinRange { brightness: f64 },
    /// The corrective pass brought brightness under the threshold.
    Corrected { before: f64, after: f64 },
    /// The corrective pass was applied but the frame is still too bright.
    StillOverexposed { before: f64, after: f64 },
    /// The backend cannot change exposure.
    Unsupported { brightness: f64 },
}

/// Mean luma of an RGB8 image on a 0-255 scale.
///
/// Large frames are sampled at a fixed stride.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_brightness(image: &RawImage) -> f64 {
    let pixel_count = image.pixels.len() / 3;
    if pixel_count == 0 {
        return 0.0;
    }
    let stride = pixel_count.div_ceil(MAX_SAMPLES).max(1);

    let (sum, count) = image
        .pixels
        .chunks_exact(3)
        .step_by(stride)
        .fold((0.0_f64, 0_u64), |(sum, count), px| {
            let luma = 0.299 * f64::from(px[0]) + 0.587 * f64::from(px[1]) + 0.114 * f64::from(px[2]);
            (sum + luma, count + 1)
        });

    sum / count as f64
}

/// Probe brightness and, if severely overexposed, apply one corrective pass.
///
/// The backend is re-probed exactly once after the correction, whatever the
/// result.
///
/// # Errors
///
/// Returns an error if probing or applying the correction fails.
pub async fn correct_exposure(
    backend: &mut dyn CameraBackend,
    threshold: f64,
    corrected: ExposureSettings,
) -> Result<ExposureOutcome> {
    let before = mean_brightness(&backend.probe().await?);
    if before <= threshold {
        return Ok(ExposureOutcome::WithinRange { brightness: before });
    }

    if !backend.capabilities().exposure_control {
        warn!(
            backend = backend.name(),
            brightness = before,
            "Frame overexposed but backend has no exposure control"
        );
        return Ok(ExposureOutcome::Unsupported { brightness: before });
    }

    backend.apply_exposure(&corrected).await?;
    let after = mean_brightness(&backend.probe().await?);

    if after <= threshold {
        info!(backend = backend.name(), before, after, ev = corrected.ev, "Exposure corrected");
        Ok(ExposureOutcome::Corrected { before, after })
    } else {
        warn!(backend = backend.name(), before, after, "Still overexposed after correction");
        Ok(ExposureOutcome::StillOverexposed { before, after })
    }
}
