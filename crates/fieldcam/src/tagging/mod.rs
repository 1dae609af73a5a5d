//! Joining frames with position fixes and encoding them.

pub mod exif;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::Frame;
use crate::config::{Config, DeviceConfig};
use crate::error::{Error, Result};
use crate::position::{FixSource, FixValidity, PositionFix};
use crate::time::TimestampSource;

/// Encodes frames as JPEG with embedded position and device metadata.
#[derive(Debug, Clone)]
pub struct MetadataTagger {
    device: DeviceConfig,
    jpeg_quality: u8,
    forward_tolerance: Duration,
    staleness: Duration,
}

impl MetadataTagger {
    /// Create a tagger from the application configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.device.clone(),
            jpeg_quality: config.capture.jpeg_quality,
            forward_tolerance: config.position.forward_tolerance(),
            staleness: config.position.staleness(),
        }
    }

    /// Tag `frame` with the best fix `source` has for its acquisition time.
    ///
    /// Falls back to the FALLBACK fix when no fix is close enough.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the frame cannot be encoded.
    pub fn tag(&self, frame: Frame, source: &dyn FixSource) -> Result<TaggedImage> {
        let fix = source.fix_for(frame.timestamp().time, self.forward_tolerance, self.staleness);
        self.tag_with_fix(frame, fix)
    }

    /// Tag `frame` with an explicit fix, or the FALLBACK fix if `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the frame cannot be encoded.
    pub fn tag_with_fix(&self, frame: Frame, fix: Option<Arc<PositionFix>>) -> Result<TaggedImage> {
        let fix = fix.unwrap_or_else(|| Arc::new(PositionFix::fallback(frame.timestamp())));
        let sequence = frame.sequence();

        let mut jpeg = Vec::with_capacity(frame.pixels().len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode(frame.pixels(), frame.width(), frame.height(), ExtendedColorType::Rgb8)
            .map_err(|e| Error::encoding(sequence, e.to_string()))?;

        let fields = self.exif_fields(&frame, &fix);
        let app1 = exif::build(&fields)
            .ok_or_else(|| Error::encoding(sequence, "metadata does not fit in one APP1 segment"))?;
        let encoded = insert_app1(&jpeg, &app1)
            .ok_or_else(|| Error::encoding(sequence, "encoder produced an invalid JPEG stream"))?;

        let content_hash = blake3::hash(&encoded).to_hex().to_string();
        let file_name = image_file_name(sequence, &frame.timestamp().time);
        debug!(sequence, bytes = encoded.len(), fix = %fix.validity, "Frame tagged");

        Ok(TaggedImage {
            frame,
            fix,
            encoded,
            file_name,
            content_hash,
            device: self.device.clone(),
        })
    }

    fn exif_fields(&self, frame: &Frame, fix: &PositionFix) -> exif::ExifFields {
        exif::ExifFields {
            make: self.device.make.clone(),
            model: self.device.model.clone(),
            serial: self.device.serial.clone(),
            software: format!("fieldcam {}", env!("CARGO_PKG_VERSION")),
            description: format!("frame {}", frame.sequence()),
            user_comment: format!(
                "fix={} sats={} quality={} time_source={}",
                fix.validity,
                fix.satellites,
                fix.fix_quality,
                frame.timestamp().source
            ),
            captured_at: frame.timestamp().time,
            width: frame.width(),
            height: frame.height(),
            gps: exif::GpsFields {
                latitude: fix.latitude,
                longitude: fix.longitude,
                altitude: fix.altitude,
                satellites: fix.satellites,
                fix_quality: fix.fix_quality,
                real: fix.is_real(),
                time: fix.timestamp.time,
            },
        }
    }
}

/// Insert an APP1 segment after SOI and any JFIF APP0 segment.
fn insert_app1(jpeg: &[u8], payload: &[u8]) -> Option<Vec<u8>> {
    if jpeg.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut at = 2;
    if jpeg.get(at..at + 2)? == [0xFF, 0xE0] {
        let len = usize::from(u16::from_be_bytes([*jpeg.get(at + 2)?, *jpeg.get(at + 3)?]));
        at += 2 + len;
    }
    let segment_len = u16::try_from(payload.len() + 2).ok()?;

    let mut out = Vec::with_capacity(jpeg.len() + payload.len() + 4);
    out.extend_from_slice(jpeg.get(..at)?);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(jpeg.get(at..)?);
    Some(out)
}

/// File name for an image: zero-padded sequence then UTC acquisition time.
#[must_use]
pub fn image_file_name(sequence: u64, captured_at: &DateTime<Utc>) -> String {
    format!("{sequence:08}_{}.jpg", captured_at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// A frame joined with its fix and encoded. Immutable.
#[derive(Debug, Clone)]
pub struct TaggedImage {
    frame: Frame,
    fix: Arc<PositionFix>,
    encoded: Vec<u8>,
    file_name: String,
    content_hash: String,
    device: DeviceConfig,
}

impl TaggedImage {
    /// The source frame.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// The fix embedded in the image. Always present.
    #[must_use]
    pub fn fix(&self) -> &PositionFix {
        &self.fix
    }

    /// The encoded JPEG with metadata.
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Image file name within its session directory.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Sidecar file name within its session directory.
    #[must_use]
    pub fn sidecar_name(&self) -> String {
        match self.file_name.strip_suffix(".jpg") {
            Some(stem) => format!("{stem}.json"),
            None => format!("{}.json", self.file_name),
        }
    }

    /// BLAKE3 hash of the encoded bytes.
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// The metadata record written next to the image.
    #[must_use]
    pub fn sidecar(&self) -> SidecarRecord {
        let frame_ts = self.frame.timestamp();
        SidecarRecord {
            sequence: self.frame.sequence(),
            captured_at: frame_ts.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            time_source: frame_ts.source,
            fix: self.fix.validity,
            latitude: self.fix.latitude,
            longitude: self.fix.longitude,
            altitude: self.fix.altitude,
            satellites: self.fix.satellites,
            fix_quality: self.fix.fix_quality,
            fix_time: self
                .fix
                .timestamp
                .time
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            fix_time_source: self.fix.timestamp.source,
            width: self.frame.width(),
            height: self.frame.height(),
            backend: self.frame.backend().to_string(),
            file: self.file_name.clone(),
            content_hash: self.content_hash.clone(),
            make: self.device.make.clone(),
            model: self.device.model.clone(),
            serial: self.device.serial.clone(),
        }
    }
}

/// Per-image metadata persisted as JSON next to the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub sequence: u64,
    /// Acquisition time, RFC 3339 UTC.
    pub captured_at: String,
    pub time_source: TimestampSource,
    /// REAL or FALLBACK.
    pub fix: FixValidity,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub satellites: u8,
    pub fix_quality: u8,
    pub fix_time: String,
    pub fix_time_source: TimestampSource,
    pub width: u32,
    pub height: u32,
    pub backend: String,
    pub file: String,
    pub content_hash: String,
    pub make: String,
    pub model: String,
    pub serial: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RawImage;
    use crate::time::Timestamp;

    struct NoFix;

    impl FixSource for NoFix {
        fn fix_for(&self, _: DateTime<Utc>, _: Duration, _: Duration) -> Option<Arc<PositionFix>> {
            None
        }
    }

    struct Fixed(Arc<PositionFix>);

    impl FixSource for Fixed {
        fn fix_for(&self, _: DateTime<Utc>, _: Duration, _: Duration) -> Option<Arc<PositionFix>> {
            Some(Arc::clone(&self.0))
        }
    }

    fn captured_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T08:30:15.250Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn frame(sequence: u64) -> Frame {
        let image = RawImage {
            width: 16,
            height: 8,
            pixels: vec![90; 16 * 8 * 3],
        };
        Frame::new(
            sequence,
            Timestamp::new(captured_at(), TimestampSource::Device),
            image,
            "synthetic",
        )
        .unwrap()
    }

    fn partial_fix() -> Arc<PositionFix> {
        Arc::new(PositionFix {
            latitude: 51.5,
            longitude: -0.12,
            altitude: None,
            satellites: 2,
            fix_quality: 0,
            timestamp: Timestamp::new(captured_at(), TimestampSource::Device),
            validity: FixValidity::Real,
        })
    }

    fn tagger() -> MetadataTagger {
        MetadataTagger::new(&Config::default())
    }

    #[test]
    fn test_no_fix_embeds_fallback_marker() {
        let tagged = tagger().tag(frame(3), &NoFix).unwrap();
        assert_eq!(tagged.fix().validity, FixValidity::Fallback);

        let parsed = exif::extract(tagged.encoded()).unwrap();
        assert_eq!(parsed.coordinates(), Some((0.0, 0.0)));
        assert_eq!(parsed.text(exif::tag::GPS_SATELLITES), Some("0"));
        assert_eq!(parsed.text(exif::tag::GPS_PROCESSING_METHOD), Some("FALLBACK"));
        assert_eq!(parsed.text(exif::tag::GPS_STATUS), Some("V"));

        let sidecar = tagged.sidecar();
        assert_eq!(sidecar.fix, FixValidity::Fallback);
        assert_eq!(sidecar.satellites, 0);
    }

    #[test]
    fn test_partial_fix_tags_as_real() {
        let tagged = tagger().tag(frame(4), &Fixed(partial_fix())).unwrap();
        let parsed = exif::extract(tagged.encoded()).unwrap();

        assert_eq!(parsed.text(exif::tag::GPS_SATELLITES), Some("2"));
        assert_eq!(parsed.text(exif::tag::GPS_PROCESSING_METHOD), Some("GPS"));
        let (lat, lon) = parsed.coordinates().unwrap();
        assert!((lat - 51.5).abs() < 1e-5);
        assert!((lon + 0.12).abs() < 1e-5);
        assert_eq!(tagged.sidecar().fix, FixValidity::Real);
    }

    #[test]
    fn test_encoded_output_is_decodable_jpeg() {
        let tagged = tagger().tag(frame(5), &NoFix).unwrap();
        let decoded = image::load_from_memory(tagged.encoded()).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
    }

    #[test]
    fn test_names_and_hash() {
        let tagged = tagger().tag(frame(12), &NoFix).unwrap();
        assert_eq!(tagged.file_name(), "00000012_20240601T083015.250Z.jpg");
        assert_eq!(tagged.sidecar_name(), "00000012_20240601T083015.250Z.json");
        assert_eq!(
            tagged.content_hash(),
            blake3::hash(tagged.encoded()).to_hex().as_str()
        );
    }

    #[test]
    fn test_timestamps_are_utc_throughout() {
        let tagged = tagger().tag(frame(6), &Fixed(partial_fix())).unwrap();
        let parsed = exif::extract(tagged.encoded()).unwrap();
        assert_eq!(parsed.text(exif::tag::DATE_TIME), Some("2024:06:01 08:30:15"));
        assert_eq!(parsed.text(exif::tag::DATE_TIME_ORIGINAL), Some("2024:06:01 08:30:15"));
        assert_eq!(parsed.text(exif::tag::OFFSET_TIME_ORIGINAL), Some("+00:00"));
        assert_eq!(tagged.sidecar().captured_at, "2024-06-01T08:30:15.250Z");
    }

    #[test]
    fn test_sidecar_serializes_marker() {
        let tagged = tagger().tag(frame(7), &NoFix).unwrap();
        let json = serde_json::to_string(&tagged.sidecar()).unwrap();
        assert!(json.contains("\"fix\":\"FALLBACK\""));
        assert!(json.contains("\"sequence\":7"));
    }

    #[test]
    fn test_insert_app1_rejects_non_jpeg() {
        assert!(insert_app1(b"PNG", b"Exif\0\0").is_none());
    }
}
