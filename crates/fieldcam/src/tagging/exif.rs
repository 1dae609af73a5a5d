//! Minimal big-endian EXIF writer and reader.
//!
//! Writes IFD0 with pointers to an Exif IFD and a GPS IFD. The reader only
//! understands what the writer produces and is used to verify output.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Identifier that opens an EXIF APP1 payload.
pub const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

/// Largest payload a JPEG APP1 segment can carry.
pub const MAX_APP1_PAYLOAD: usize = 65_533;

/// Character-code prefix for UNDEFINED text fields.
const ASCII_PREFIX: &[u8; 8] = b"ASCII\0\0\0";

const TIFF_HEADER_LEN: usize = 8;

/// Tags written by this module.
pub mod tag {
    pub const IMAGE_DESCRIPTION: u16 = 0x010E;
    pub const MAKE: u16 = 0x010F;
    pub const MODEL: u16 = 0x0110;
    pub const SOFTWARE: u16 = 0x0131;
    pub const DATE_TIME: u16 = 0x0132;
    pub const EXIF_IFD: u16 = 0x8769;
    pub const GPS_IFD: u16 = 0x8825;

    pub const EXIF_VERSION: u16 = 0x9000;
    pub const DATE_TIME_ORIGINAL: u16 = 0x9003;
    pub const OFFSET_TIME_ORIGINAL: u16 = 0x9011;
    pub const USER_COMMENT: u16 = 0x9286;
    pub const SUB_SEC_TIME_ORIGINAL: u16 = 0x9291;
    pub const PIXEL_X_DIMENSION: u16 = 0xA002;
    pub const PIXEL_Y_DIMENSION: u16 = 0xA003;
    pub const BODY_SERIAL_NUMBER: u16 = 0xA431;

    pub const GPS_VERSION_ID: u16 = 0x0000;
    pub const GPS_LATITUDE_REF: u16 = 0x0001;
    pub const GPS_LATITUDE: u16 = 0x0002;
    pub const GPS_LONGITUDE_REF: u16 = 0x0003;
    pub const GPS_LONGITUDE: u16 = 0x0004;
    pub const GPS_ALTITUDE_REF: u16 = 0x0005;
    pub const GPS_ALTITUDE: u16 = 0x0006;
    pub const GPS_TIME_STAMP: u16 = 0x0007;
    pub const GPS_SATELLITES: u16 = 0x0008;
    pub const GPS_STATUS: u16 = 0x0009;
    pub const GPS_MEASURE_MODE: u16 = 0x000A;
    pub const GPS_PROCESSING_METHOD: u16 = 0x001B;
    pub const GPS_DATE_STAMP: u16 = 0x001D;
    pub const GPS_DIFFERENTIAL: u16 = 0x001E;
}

/// A typed TIFF field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// BYTE values.
    Byte(Vec<u8>),
    /// NUL-terminated ASCII text (terminator not included here).
    Ascii(String),
    /// SHORT values.
    Short(Vec<u16>),
    /// LONG values.
    Long(Vec<u32>),
    /// RATIONAL values as numerator/denominator pairs.
    Rational(Vec<(u32, u32)>),
    /// UNDEFINED bytes.
    Undefined(Vec<u8>),
}

impl Value {
    fn type_code(&self) -> u16 {
        match self {
            Self::Byte(_) => 1,
            Self::Ascii(_) => 2,
            Self::Short(_) => 3,
            Self::Long(_) => 4,
            Self::Rational(_) => 5,
            Self::Undefined(_) => 7,
        }
    }

    fn count(&self) -> usize {
        match self {
            Self::Byte(v) | Self::Undefined(v) => v.len(),
            Self::Ascii(s) => s.len() + 1,
            Self::Short(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Rational(v) => v.len(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Byte(v) | Self::Undefined(v) => v.clone(),
            Self::Ascii(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            Self::Short(v) => v.iter().flat_map(|n| n.to_be_bytes()).collect(),
            Self::Long(v) => v.iter().flat_map(|n| n.to_be_bytes()).collect(),
            Self::Rational(v) => v
                .iter()
                .flat_map(|(n, d)| n.to_be_bytes().into_iter().chain(d.to_be_bytes()))
                .collect(),
        }
    }

    /// The text of an ASCII value, or of an UNDEFINED value with an ASCII prefix.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) => Some(s),
            Self::Undefined(v) => v
                .strip_prefix(ASCII_PREFIX.as_slice())
                .and_then(|text| std::str::from_utf8(text).ok()),
            _ => None,
        }
    }

    /// Rational values converted to floats.
    #[must_use]
    pub fn as_rationals(&self) -> Option<Vec<f64>> {
        match self {
            Self::Rational(v) => Some(
                v.iter()
                    .map(|&(n, d)| if d == 0 { 0.0 } else { f64::from(n) / f64::from(d) })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Text stored as an UNDEFINED field with the ASCII character code.
#[must_use]
pub fn undefined_text(text: &str) -> Value {
    let mut bytes = ASCII_PREFIX.to_vec();
    bytes.extend_from_slice(text.as_bytes());
    Value::Undefined(bytes)
}

/// Position fields for the GPS IFD.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFields {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub satellites: u8,
    pub fix_quality: u8,
    /// `true` for a sensor reading, `false` for the placeholder.
    pub real: bool,
    pub time: DateTime<Utc>,
}

/// Everything embedded in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ExifFields {
    pub make: String,
    pub model: String,
    pub serial: String,
    pub software: String,
    pub description: String,
    pub user_comment: String,
    /// Acquisition time, always UTC.
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub gps: GpsFields,
}

/// Render `time` the way EXIF date fields expect.
#[must_use]
pub fn exif_datetime(time: &DateTime<Utc>) -> String {
    time.format("%Y:%m:%d %H:%M:%S").to_string()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn degrees_to_dms(value: f64) -> Vec<(u32, u32)> {
    let value = value.abs();
    let degrees = value.trunc();
    let minutes_full = (value - degrees) * 60.0;
    let minutes = minutes_full.trunc();
    let seconds = (minutes_full - minutes) * 60.0;
    vec![
        (degrees as u32, 1),
        (minutes as u32, 1),
        ((seconds * 10_000.0).round() as u32, 10_000),
    ]
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn gps_entries(gps: &GpsFields) -> Vec<(u16, Value)> {
    let lat_ref = if gps.latitude < 0.0 { "S" } else { "N" };
    let lon_ref = if gps.longitude < 0.0 { "W" } else { "E" };
    let millis = gps.time.timestamp_subsec_millis();

    let mut entries = vec![
        (tag::GPS_VERSION_ID, Value::Byte(vec![2, 3, 0, 0])),
        (tag::GPS_LATITUDE_REF, Value::Ascii(lat_ref.to_string())),
        (tag::GPS_LATITUDE, Value::Rational(degrees_to_dms(gps.latitude))),
        (tag::GPS_LONGITUDE_REF, Value::Ascii(lon_ref.to_string())),
        (tag::GPS_LONGITUDE, Value::Rational(degrees_to_dms(gps.longitude))),
        (
            tag::GPS_TIME_STAMP,
            Value::Rational(vec![
                (gps.time.hour(), 1),
                (gps.time.minute(), 1),
                (gps.time.second() * 1000 + millis, 1000),
            ]),
        ),
        (tag::GPS_SATELLITES, Value::Ascii(gps.satellites.to_string())),
        (
            tag::GPS_STATUS,
            Value::Ascii(if gps.real { "A" } else { "V" }.to_string()),
        ),
        (
            tag::GPS_MEASURE_MODE,
            Value::Ascii(if gps.altitude.is_some() { "3" } else { "2" }.to_string()),
        ),
        (
            tag::GPS_PROCESSING_METHOD,
            undefined_text(if gps.real { "GPS" } else { "FALLBACK" }),
        ),
        (
            tag::GPS_DATE_STAMP,
            Value::Ascii(format!(
                "{:04}:{:02}:{:02}",
                gps.time.year(),
                gps.time.month(),
                gps.time.day()
            )),
        ),
        (
            tag::GPS_DIFFERENTIAL,
            Value::Short(vec![u16::from(gps.fix_quality == 2)]),
        ),
    ];

    if let Some(altitude) = gps.altitude {
        entries.push((tag::GPS_ALTITUDE_REF, Value::Byte(vec![u8::from(altitude < 0.0)])));
        entries.push((
            tag::GPS_ALTITUDE,
            Value::Rational(vec![((altitude.abs() * 100.0).round() as u32, 100)]),
        ));
    }
    entries
}

/// Serialized length of an IFD including its out-of-line data.
fn ifd_len(entries: &[(u16, Value)]) -> usize {
    let data: usize = entries
        .iter()
        .map(|(_, value)| {
            let len = value.to_bytes().len();
            if len > 4 {
                len + len % 2
            } else {
                0
            }
        })
        .sum();
    2 + entries.len() * 12 + 4 + data
}

/// Append an IFD that starts at TIFF offset `start`.
fn write_ifd(out: &mut Vec<u8>, start: usize, entries: &mut [(u16, Value)]) -> Option<()> {
    entries.sort_by_key(|(id, _)| *id);

    let mut data_offset = start + 2 + entries.len() * 12 + 4;
    let mut data = Vec::new();

    out.extend_from_slice(&u16::try_from(entries.len()).ok()?.to_be_bytes());
    for (id, value) in entries.iter() {
        let bytes = value.to_bytes();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.type_code().to_be_bytes());
        out.extend_from_slice(&u32::try_from(value.count()).ok()?.to_be_bytes());
        if bytes.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..bytes.len()].copy_from_slice(&bytes);
            out.extend_from_slice(&inline);
        } else {
            out.extend_from_slice(&u32::try_from(data_offset).ok()?.to_be_bytes());
            data_offset += bytes.len() + bytes.len() % 2;
            data.extend_from_slice(&bytes);
            if bytes.len() % 2 == 1 {
                data.push(0);
            }
        }
    }
    // No chained IFD
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&data);
    Some(())
}

/// Build the APP1 payload (starting with `Exif\0\0`) for an image.
///
/// Returns `None` if the payload would not fit in one APP1 segment.
#[must_use]
pub fn build(fields: &ExifFields) -> Option<Vec<u8>> {
    let captured = exif_datetime(&fields.captured_at);
    let subsec = format!("{:03}", fields.captured_at.timestamp_subsec_millis());

    let mut ifd0 = vec![
        (tag::IMAGE_DESCRIPTION, Value::Ascii(fields.description.clone())),
        (tag::MAKE, Value::Ascii(fields.make.clone())),
        (tag::MODEL, Value::Ascii(fields.model.clone())),
        (tag::SOFTWARE, Value::Ascii(fields.software.clone())),
        (tag::DATE_TIME, Value::Ascii(captured.clone())),
        (tag::EXIF_IFD, Value::Long(vec![0])),
        (tag::GPS_IFD, Value::Long(vec![0])),
    ];
    let mut exif = vec![
        (tag::EXIF_VERSION, Value::Undefined(b"0232".to_vec())),
        (tag::DATE_TIME_ORIGINAL, Value::Ascii(captured)),
        (tag::OFFSET_TIME_ORIGINAL, Value::Ascii("+00:00".to_string())),
        (tag::SUB_SEC_TIME_ORIGINAL, Value::Ascii(subsec)),
        (tag::USER_COMMENT, undefined_text(&fields.user_comment)),
        (tag::PIXEL_X_DIMENSION, Value::Long(vec![fields.width])),
        (tag::PIXEL_Y_DIMENSION, Value::Long(vec![fields.height])),
        (tag::BODY_SERIAL_NUMBER, Value::Ascii(fields.serial.clone())),
    ];
    let mut gps = gps_entries(&fields.gps);

    let exif_offset = TIFF_HEADER_LEN + ifd_len(&ifd0);
    let gps_offset = exif_offset + ifd_len(&exif);
    for (id, value) in &mut ifd0 {
        match *id {
            tag::EXIF_IFD => *value = Value::Long(vec![u32::try_from(exif_offset).ok()?]),
            tag::GPS_IFD => *value = Value::Long(vec![u32::try_from(gps_offset).ok()?]),
            _ => {}
        }
    }

    let mut out = EXIF_HEADER.to_vec();
    out.extend_from_slice(b"MM\0\x2A");
    out.extend_from_slice(&u32::try_from(TIFF_HEADER_LEN).ok()?.to_be_bytes());

    // Offsets are relative to the TIFF header, which follows the 6-byte identifier
    let mut tiff = Vec::new();
    write_ifd(&mut tiff, TIFF_HEADER_LEN, &mut ifd0)?;
    write_ifd(&mut tiff, exif_offset, &mut exif)?;
    write_ifd(&mut tiff, gps_offset, &mut gps)?;
    out.extend_from_slice(&tiff);

    (out.len() <= MAX_APP1_PAYLOAD).then_some(out)
}

/// Tags read back from an EXIF payload, grouped by IFD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedExif {
    pub ifd0: BTreeMap<u16, Value>,
    pub exif: BTreeMap<u16, Value>,
    pub gps: BTreeMap<u16, Value>,
}

impl ParsedExif {
    /// Signed decimal latitude and longitude from the GPS IFD.
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let decimal = |value_tag: u16, ref_tag: u16, negative: &str| {
            let parts = self.gps.get(&value_tag)?.as_rationals()?;
            let [d, m, s] = parts.as_slice() else {
                return None;
            };
            let value = d + m / 60.0 + s / 3600.0;
            let reference = self.gps.get(&ref_tag)?.as_text()?;
            Some(if reference == negative { -value } else { value })
        };
        Some((
            decimal(tag::GPS_LATITUDE, tag::GPS_LATITUDE_REF, "S")?,
            decimal(tag::GPS_LONGITUDE, tag::GPS_LONGITUDE_REF, "W")?,
        ))
    }

    /// Text of a tag in any IFD.
    #[must_use]
    pub fn text(&self, tag: u16) -> Option<&str> {
        self.ifd0
            .get(&tag)
            .or_else(|| self.exif.get(&tag))
            .or_else(|| self.gps.get(&tag))
            .and_then(Value::as_text)
    }
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn read_ifd(tiff: &[u8], start: usize) -> Option<BTreeMap<u16, Value>> {
    let count = usize::from(be_u16(tiff, start)?);
    let mut entries = BTreeMap::new();

    for i in 0..count {
        let at = start + 2 + i * 12;
        let tag = be_u16(tiff, at)?;
        let type_code = be_u16(tiff, at + 2)?;
        let count = be_u32(tiff, at + 4)? as usize;
        let unit = match type_code {
            1 | 2 | 7 => 1,
            3 => 2,
            4 => 4,
            5 => 8,
            _ => continue,
        };
        let len = count.checked_mul(unit)?;
        let data_at = if len <= 4 {
            at + 8
        } else {
            be_u32(tiff, at + 8)? as usize
        };
        let bytes = tiff.get(data_at..data_at.checked_add(len)?)?;

        let value = match type_code {
            1 => Value::Byte(bytes.to_vec()),
            2 => Value::Ascii(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            3 => Value::Short(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            ),
            4 => Value::Long(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            5 => Value::Rational(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        (
                            u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                            u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
                        )
                    })
                    .collect(),
            ),
            _ => Value::Undefined(bytes.to_vec()),
        };
        entries.insert(tag, value);
    }
    Some(entries)
}

/// Parse an APP1 payload written by [`build`].
#[must_use]
pub fn parse(payload: &[u8]) -> Option<ParsedExif> {
    let tiff = payload.strip_prefix(EXIF_HEADER.as_slice())?;
    if tiff.get(..4)? != b"MM\0\x2A" {
        return None;
    }
    let ifd0 = read_ifd(tiff, be_u32(tiff, 4)? as usize)?;

    let pointer = |tag: u16| match ifd0.get(&tag) {
        Some(Value::Long(v)) => v.first().map(|&o| o as usize),
        _ => None,
    };
    let exif = match pointer(tag::EXIF_IFD) {
        Some(offset) => read_ifd(tiff, offset)?,
        None => BTreeMap::new(),
    };
    let gps = match pointer(tag::GPS_IFD) {
        Some(offset) => read_ifd(tiff, offset)?,
        None => BTreeMap::new(),
    };
    Some(ParsedExif { ifd0, exif, gps })
}

/// Find and parse the EXIF APP1 segment of a JPEG.
#[must_use]
pub fn extract(jpeg: &[u8]) -> Option<ParsedExif> {
    let mut at = 2;
    if jpeg.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    // Walk marker segments until start-of-scan
    while let (Some(&0xFF), Some(&marker)) = (jpeg.get(at), jpeg.get(at + 1)) {
        if marker == 0xDA {
            break;
        }
        let len = usize::from(be_u16(jpeg, at + 2)?);
        let payload = jpeg.get(at + 4..at + 2 + len)?;
        if marker == 0xE1 && payload.starts_with(EXIF_HEADER) {
            return parse(payload);
        }
        at += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T08:30:15.250Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fields(real: bool) -> ExifFields {
        ExifFields {
            make: "fieldcam".to_string(),
            model: "fieldcam-1".to_string(),
            serial: "unit-7".to_string(),
            software: "fieldcam 0.1.0".to_string(),
            description: "frame 12".to_string(),
            user_comment: "fix=REAL".to_string(),
            captured_at: time(),
            width: 640,
            height: 480,
            gps: GpsFields {
                latitude: if real { -33.8568 } else { 0.0 },
                longitude: if real { 151.2153 } else { 0.0 },
                altitude: real.then_some(42.5),
                satellites: if real { 9 } else { 0 },
                fix_quality: u8::from(real),
                real,
                time: time(),
            },
        }
    }

    #[test]
    fn test_build_starts_with_header() {
        let payload = build(&fields(true)).unwrap();
        assert!(payload.starts_with(b"Exif\0\0MM\0\x2A\0\0\0\x08"));
    }

    #[test]
    fn test_parse_reads_back_identity_and_times() {
        let parsed = parse(&build(&fields(true)).unwrap()).unwrap();
        assert_eq!(parsed.text(tag::MAKE), Some("fieldcam"));
        assert_eq!(parsed.text(tag::MODEL), Some("fieldcam-1"));
        assert_eq!(parsed.text(tag::BODY_SERIAL_NUMBER), Some("unit-7"));
        assert_eq!(parsed.text(tag::DATE_TIME_ORIGINAL), Some("2024:06:01 08:30:15"));
        assert_eq!(parsed.text(tag::OFFSET_TIME_ORIGINAL), Some("+00:00"));
        assert_eq!(parsed.text(tag::SUB_SEC_TIME_ORIGINAL), Some("250"));
        assert_eq!(parsed.text(tag::GPS_DATE_STAMP), Some("2024:06:01"));
        assert_eq!(
            parsed.exif.get(&tag::PIXEL_X_DIMENSION),
            Some(&Value::Long(vec![640]))
        );
    }

    #[test]
    fn test_real_fix_coordinates_and_markers() {
        let parsed = parse(&build(&fields(true)).unwrap()).unwrap();
        let (lat, lon) = parsed.coordinates().unwrap();
        assert!((lat + 33.8568).abs() < 1e-5);
        assert!((lon - 151.2153).abs() < 1e-5);
        assert_eq!(parsed.text(tag::GPS_STATUS), Some("A"));
        assert_eq!(parsed.text(tag::GPS_SATELLITES), Some("9"));
        assert_eq!(parsed.text(tag::GPS_PROCESSING_METHOD), Some("GPS"));
        let altitude = parsed.gps[&tag::GPS_ALTITUDE].as_rationals().unwrap();
        assert!((altitude[0] - 42.5).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_markers() {
        let parsed = parse(&build(&fields(false)).unwrap()).unwrap();
        assert_eq!(parsed.coordinates(), Some((0.0, 0.0)));
        assert_eq!(parsed.text(tag::GPS_STATUS), Some("V"));
        assert_eq!(parsed.text(tag::GPS_SATELLITES), Some("0"));
        assert_eq!(parsed.text(tag::GPS_PROCESSING_METHOD), Some("FALLBACK"));
        assert!(!parsed.gps.contains_key(&tag::GPS_ALTITUDE));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mut big = fields(true);
        big.user_comment = "x".repeat(70_000);
        assert!(build(&big).is_none());
    }

    #[test]
    fn test_extract_rejects_non_jpeg() {
        assert!(extract(b"not a jpeg").is_none());
        assert!(extract(&[0xFF, 0xD8, 0xFF, 0xDA]).is_none());
    }

    #[test]
    fn test_degrees_to_dms() {
        let dms = degrees_to_dms(48.1173);
        assert_eq!(dms[0], (48, 1));
        assert_eq!(dms[1], (7, 1));
        // 0.038' = 2.28"
        assert_eq!(dms[2], (22_800, 10_000));
    }
}
