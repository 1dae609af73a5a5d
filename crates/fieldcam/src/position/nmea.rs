//! NMEA 0183 sentence parsing.
//!
//! Only the sentences that carry a position are decoded (GGA, RMC, GLL).
//! Anything else that is well-formed parses to `Ok(None)` so the caller
//! can tell "not interesting" apart from "garbage".

use chrono::{NaiveDate, NaiveTime};

use crate::error::{Error, Result};

/// Sentence types that carry a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentenceKind {
    /// Global positioning system fix data.
    Gga,
    /// Recommended minimum data.
    Rmc,
    /// Geographic position, latitude/longitude.
    Gll,
}

/// A decoded position sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    /// Which sentence this was.
    pub kind: SentenceKind,
    /// UTC time of the fix, if reported.
    pub time: Option<NaiveTime>,
    /// UTC date, only carried by RMC.
    pub date: Option<NaiveDate>,
    /// Latitude in decimal degrees, north positive.
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees, east positive.
    pub longitude: Option<f64>,
    /// Altitude above mean sea level in meters (GGA only).
    pub altitude: Option<f64>,
    /// Satellites used in the fix (GGA only).
    pub satellites: Option<u8>,
    /// GGA fix-quality code, or 1/0 derived from the RMC/GLL status flag.
    pub fix_quality: u8,
    /// Whether the receiver itself claims a valid fix.
    pub receiver_valid: bool,
}

impl Sentence {
    /// The coordinate pair, if present, in range and not the null island.
    #[must_use]
    pub fn usable_coordinates(&self) -> Option<(f64, f64)> {
        let (lat, lon) = (self.latitude?, self.longitude?);
        let in_range = (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon);
        let both_zero = lat == 0.0 && lon == 0.0;
        (in_range && !both_zero).then_some((lat, lon))
    }

    /// Ranking used to pick the strongest sentence out of a burst.
    ///
    /// A receiver-validated fix always outranks an unvalidated one; within
    /// each group GGA beats RMC beats GLL because it carries more fields.
    #[must_use]
    pub fn strength(&self) -> u8 {
        let base = match self.kind {
            SentenceKind::Gga => 3,
            SentenceKind::Rmc => 2,
            SentenceKind::Gll => 1,
        };
        if self.receiver_valid {
            base + 10
        } else {
            base
        }
    }
}

/// Parse one line of NMEA input.
///
/// # Errors
///
/// Returns [`Error::SensorParse`] for lines that are not valid NMEA or whose
/// checksum does not match.
pub fn parse_sentence(line: &str) -> Result<Option<Sentence>> {
    let line = line.trim();
    // NMEA 0183 is printable ASCII; line noise often is not
    if !line.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(Error::sensor_parse("non-ASCII or control bytes in sentence"));
    }
    let body = line
        .strip_prefix('$')
        .ok_or_else(|| Error::sensor_parse("missing '$' start delimiter"))?;

    let body = match body.split_once('*') {
        Some((body, checksum)) => {
            verify_checksum(body, checksum)?;
            body
        }
        None => body,
    };

    let mut fields = body.split(',');
    let address = fields.next().unwrap_or_default();
    // Proprietary sentences ($P...) are vendor-specific and never carry our fields
    if address.starts_with('P') && address.len() > 1 {
        return Ok(None);
    }
    if address.len() != 5 || !address.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::sensor_parse(format!("bad address field '{address}'")));
    }
    let fields: Vec<&str> = fields.collect();

    match &address[2..] {
        "GGA" => parse_gga(&fields).map(Some),
        "RMC" => parse_rmc(&fields).map(Some),
        "GLL" => parse_gll(&fields).map(Some),
        _ => Ok(None),
    }
}

fn verify_checksum(body: &str, checksum: &str) -> Result<()> {
    let expected = u8::from_str_radix(checksum.trim(), 16)
        .map_err(|_| Error::sensor_parse(format!("bad checksum field '{checksum}'")))?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::sensor_parse(format!(
            "checksum mismatch: expected {expected:02X}, computed {actual:02X}"
        )))
    }
}

fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).copied().unwrap_or_default()
}

// $--GGA,hhmmss.ss,llll.ll,a,yyyyy.yy,a,q,nn,h.h,a.a,M,g.g,M,,
fn parse_gga(fields: &[&str]) -> Result<Sentence> {
    if fields.len() < 9 {
        return Err(Error::sensor_parse(format!(
            "GGA has {} fields, need at least 9",
            fields.len()
        )));
    }
    let fix_quality = parse_optional::<u8>(field(fields, 5), "fix quality")?.unwrap_or(0);
    Ok(Sentence {
        kind: SentenceKind::Gga,
        time: parse_time(field(fields, 0))?,
        date: None,
        latitude: parse_coordinate(field(fields, 1), field(fields, 2), 2)?,
        longitude: parse_coordinate(field(fields, 3), field(fields, 4), 3)?,
        altitude: parse_optional::<f64>(field(fields, 8), "altitude")?,
        satellites: parse_optional::<u8>(field(fields, 6), "satellite count")?,
        fix_quality,
        receiver_valid: fix_quality > 0,
    })
}

// $--RMC,hhmmss.ss,A,llll.ll,a,yyyyy.yy,a,x.x,x.x,ddmmyy,x.x,a,m
fn parse_rmc(fields: &[&str]) -> Result<Sentence> {
    if fields.len() < 9 {
        return Err(Error::sensor_parse(format!(
            "RMC has {} fields, need at least 9",
            fields.len()
        )));
    }
    let valid = field(fields, 1) == "A";
    Ok(Sentence {
        kind: SentenceKind::Rmc,
        time: parse_time(field(fields, 0))?,
        date: parse_date(field(fields, 8))?,
        latitude: parse_coordinate(field(fields, 2), field(fields, 3), 2)?,
        longitude: parse_coordinate(field(fields, 4), field(fields, 5), 3)?,
        altitude: None,
        satellites: None,
        fix_quality: u8::from(valid),
        receiver_valid: valid,
    })
}

// $--GLL,llll.ll,a,yyyyy.yy,a,hhmmss.ss,A,m
fn parse_gll(fields: &[&str]) -> Result<Sentence> {
    if fields.len() < 6 {
        return Err(Error::sensor_parse(format!(
            "GLL has {} fields, need at least 6",
            fields.len()
        )));
    }
    let valid = field(fields, 5) == "A";
    Ok(Sentence {
        kind: SentenceKind::Gll,
        time: parse_time(field(fields, 4))?,
        date: None,
        latitude: parse_coordinate(field(fields, 0), field(fields, 1), 2)?,
        longitude: parse_coordinate(field(fields, 2), field(fields, 3), 3)?,
        altitude: None,
        satellites: None,
        fix_quality: u8::from(valid),
        receiver_valid: valid,
    })
}

fn parse_optional<T: std::str::FromStr>(raw: &str, what: &str) -> Result<Option<T>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| Error::sensor_parse(format!("bad {what} '{raw}'")))
}

/// Parse `ddmm.mmmm` / `dddmm.mmmm` plus a hemisphere letter.
fn parse_coordinate(raw: &str, hemisphere: &str, degree_digits: usize) -> Result<Option<f64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.len() < degree_digits + 2 || !raw.is_char_boundary(degree_digits) {
        return Err(Error::sensor_parse(format!("coordinate '{raw}' too short")));
    }
    let (deg, min) = raw.split_at(degree_digits);
    let deg: f64 = deg
        .parse()
        .map_err(|_| Error::sensor_parse(format!("bad degrees in '{raw}'")))?;
    let min: f64 = min
        .parse()
        .map_err(|_| Error::sensor_parse(format!("bad minutes in '{raw}'")))?;
    if !(0.0..60.0).contains(&min) {
        return Err(Error::sensor_parse(format!("minutes out of range in '{raw}'")));
    }
    let value = deg + min / 60.0;
    match hemisphere {
        "N" | "E" => Ok(Some(value)),
        "S" | "W" => Ok(Some(-value)),
        other => Err(Error::sensor_parse(format!("bad hemisphere '{other}'"))),
    }
}

fn parse_time(raw: &str) -> Result<Option<NaiveTime>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let (hms, frac) = raw.split_once('.').unwrap_or((raw, ""));
    if hms.len() != 6 || !hms.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::sensor_parse(format!("bad time '{raw}'")));
    }
    let num = |range: std::ops::Range<usize>| hms[range].parse::<u32>().unwrap_or(99);
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::sensor_parse(format!("bad time fraction '{raw}'")));
    }
    let millis = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().take(3).collect();
        format!("{digits:0<3}")
            .parse::<u32>()
            .map_err(|_| Error::sensor_parse(format!("bad time fraction '{raw}'")))?
    };
    NaiveTime::from_hms_milli_opt(num(0..2), num(2..4), num(4..6), millis)
        .map(Some)
        .ok_or_else(|| Error::sensor_parse(format!("time out of range '{raw}'")))
}

fn parse_date(raw: &str) -> Result<Option<NaiveDate>> {
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.len() != 6 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::sensor_parse(format!("bad date '{raw}'")));
    }
    let num = |range: std::ops::Range<usize>| raw[range].parse::<u32>().unwrap_or(0);
    // Two-digit years; receivers in service today report 20xx
    let year = 2000 + i32::try_from(num(4..6)).unwrap_or(0);
    NaiveDate::from_ymd_opt(year, num(2..4), num(0..2))
        .map(Some)
        .ok_or_else(|| Error::sensor_parse(format!("date out of range '{raw}'")))
}

/// Append a checksum to a sentence body, e.g. for test fixtures or replay.
#[must_use]
pub fn with_checksum(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    #[test]
    fn test_parse_gga() {
        let s = parse_sentence(GGA).unwrap().unwrap();
        assert_eq!(s.kind, SentenceKind::Gga);
        assert!((s.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((s.longitude.unwrap() - 11.516_666).abs() < 1e-4);
        assert_eq!(s.satellites, Some(8));
        assert_eq!(s.fix_quality, 1);
        assert!((s.altitude.unwrap() - 545.4).abs() < 1e-9);
        assert_eq!(s.time, NaiveTime::from_hms_opt(12, 35, 19));
        assert!(s.receiver_valid);
    }

    #[test]
    fn test_parse_rmc() {
        let s = parse_sentence(RMC).unwrap().unwrap();
        assert_eq!(s.kind, SentenceKind::Rmc);
        assert_eq!(s.date, NaiveDate::from_ymd_opt(2094, 3, 23));
        assert!(s.receiver_valid);
    }

    #[test]
    fn test_parse_gll_southern_western() {
        let line = with_checksum("GNGLL,3351.5000,S,15112.0000,W,083000.50,A,A");
        let s = parse_sentence(&line).unwrap().unwrap();
        assert_eq!(s.kind, SentenceKind::Gll);
        assert!((s.latitude.unwrap() + 33.858_333).abs() < 1e-4);
        assert!((s.longitude.unwrap() + 151.2).abs() < 1e-4);
        assert_eq!(s.time, NaiveTime::from_hms_milli_opt(8, 30, 0, 500));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let bad = GGA.replace("*47", "*00");
        let err = parse_sentence(&bad).unwrap_err();
        assert!(matches!(err, Error::SensorParse { .. }));
    }

    #[test]
    fn test_missing_checksum_accepted() {
        let line = GGA.split('*').next().unwrap();
        assert!(parse_sentence(line).unwrap().is_some());
    }

    #[test]
    fn test_unsupported_sentence_is_none() {
        let line = with_checksum("GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00");
        assert!(parse_sentence(&line).unwrap().is_none());
        assert!(parse_sentence(&with_checksum("PUBX,00,081350.00")).unwrap().is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_sentence("").is_err());
        assert!(parse_sentence("hello world").is_err());
        assert!(parse_sentence("$GP").is_err());
        assert!(parse_sentence(&with_checksum("GPGGA,1235")).is_err());
        assert!(parse_sentence(&with_checksum("GPGGA,123519,48x7.038,N,01131.000,E,1,08,0.9,545.4,M")).is_err());
    }

    #[test]
    fn test_non_ascii_time_fraction_is_a_parse_error() {
        let line = "$GPGGA,123519.\u{e9}\u{e9},4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
        let err = parse_sentence(line).unwrap_err();
        assert!(matches!(err, Error::SensorParse { .. }));
    }

    #[test]
    fn test_non_digit_time_fraction_rejected() {
        let line = with_checksum("GPGGA,123519.5x,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert!(parse_sentence(&line).is_err());
    }

    #[test]
    fn test_control_bytes_rejected() {
        assert!(parse_sentence("$GPGGA,1235\u{0}19,4807.038,N").is_err());
        assert!(parse_sentence("$GPRMC,123519,A,\u{fffd}807.038,N,01131.000,E,,,230394,,").is_err());
    }

    #[test]
    fn test_long_time_fraction_truncated_to_millis() {
        let line = with_checksum("GPGGA,123519.1234,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        let s = parse_sentence(&line).unwrap().unwrap();
        assert_eq!(s.time, NaiveTime::from_hms_milli_opt(12, 35, 19, 123));
    }

    #[test]
    fn test_partial_gga_without_fix_keeps_coordinates() {
        // Quality 0 but coordinates present: degraded, still usable
        let line = with_checksum("GPGGA,101010,5130.0000,N,00007.0000,W,0,02,9.9,,M,,M,,");
        let s = parse_sentence(&line).unwrap().unwrap();
        assert!(!s.receiver_valid);
        assert_eq!(s.satellites, Some(2));
        assert!(s.altitude.is_none());
        assert!(s.usable_coordinates().is_some());
    }

    #[test]
    fn test_empty_position_not_usable() {
        let line = with_checksum("GPGGA,101010,,,,,0,00,,,M,,M,,");
        let s = parse_sentence(&line).unwrap().unwrap();
        assert!(s.usable_coordinates().is_none());
    }

    #[test]
    fn test_null_island_not_usable() {
        let line = with_checksum("GPGGA,101010,0000.0000,N,00000.0000,E,1,05,1.0,0.0,M,,M,,");
        let s = parse_sentence(&line).unwrap().unwrap();
        assert!(s.usable_coordinates().is_none());
    }

    #[test]
    fn test_strength_prefers_validated_gga() {
        let gga = parse_sentence(GGA).unwrap().unwrap();
        let rmc = parse_sentence(RMC).unwrap().unwrap();
        let weak = parse_sentence(&with_checksum(
            "GPGGA,101010,5130.0000,N,00007.0000,W,0,02,9.9,,M,,M,,",
        ))
        .unwrap()
        .unwrap();
        assert!(gga.strength() > rmc.strength());
        assert!(rmc.strength() > weak.strength());
    }

    #[test]
    fn test_with_checksum_matches_reference() {
        let body = GGA.trim_start_matches('$').split('*').next().unwrap();
        assert_eq!(with_checksum(body), GGA);
    }
}
