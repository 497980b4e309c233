//! Capture time and GPS extraction from image metadata

use chrono::{Local, NaiveDate, TimeZone};
use exif::{In, Tag, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{Result, ScanError};

/// GPS fix read from a file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// Metadata the pipeline cares about; both fields are optional
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtractedMetadata {
    /// Capture time in milliseconds since the epoch
    pub captured_at: Option<i64>,
    pub gps: Option<GpsPoint>,
}

/// Reads capture time and GPS position for one file
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedMetadata>;
}

/// Extractor backed by kamadak-exif
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifExtractor;

impl MetadataExtractor for ExifExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedMetadata> {
        let file = File::open(path)
            .map_err(|e| ScanError::extract_error(path.to_path_buf(), e.to_string()))?;
        let mut reader = BufReader::new(file);

        let exif = match exif::Reader::new().read_from_container(&mut reader) {
            Ok(exif) => exif,
            // A file without an EXIF block is not an error
            Err(exif::Error::NotFound(_)) => return Ok(ExtractedMetadata::default()),
            Err(e) => return Err(ScanError::extract_error(path.to_path_buf(), e.to_string())),
        };

        Ok(ExtractedMetadata {
            captured_at: capture_time_ms(&exif),
            gps: gps_point(&exif),
        })
    }
}

/// DateTimeOriginal, falling back to DateTime, as local milliseconds
fn capture_time_ms(exif: &exif::Exif) -> Option<i64> {
    [Tag::DateTimeOriginal, Tag::DateTime]
        .iter()
        .filter_map(|tag| exif.get_field(*tag, In::PRIMARY))
        .find_map(|field| match field.value {
            Value::Ascii(ref vec) if !vec.is_empty() => exif::DateTime::from_ascii(&vec[0])
                .ok()
                .and_then(|dt| datetime_to_ms(&dt)),
            _ => None,
        })
}

fn datetime_to_ms(dt: &exif::DateTime) -> Option<i64> {
    let naive = NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?
        .and_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32)?;
    // EXIF times carry no zone; read them as local wall-clock time
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp_millis())
}

fn gps_point(exif: &exif::Exif) -> Option<GpsPoint> {
    let lat_field = exif.get_field(Tag::GPSLatitude, In::PRIMARY)?;
    let lon_field = exif.get_field(Tag::GPSLongitude, In::PRIMARY)?;

    let mut latitude = dms_to_decimal(&lat_field.value)?;
    let mut longitude = dms_to_decimal(&lon_field.value)?;

    if ref_is(exif, Tag::GPSLatitudeRef, "S") {
        latitude = -latitude;
    }
    if ref_is(exif, Tag::GPSLongitudeRef, "W") {
        longitude = -longitude;
    }

    Some(GpsPoint {
        latitude,
        longitude,
        altitude: altitude(exif),
    })
}

fn ref_is(exif: &exif::Exif, tag: Tag, expected: &str) -> bool {
    exif.get_field(tag, In::PRIMARY)
        .map(|f| f.value.display_as(tag).to_string())
        .is_some_and(|s| s.trim().eq_ignore_ascii_case(expected))
}

/// Degrees, minutes, seconds rationals to an unsigned decimal degree
pub fn dms_to_decimal(value: &Value) -> Option<f64> {
    match value {
        Value::Rational(rats) if rats.len() >= 3 => {
            if rats[..3].iter().any(|r| r.denom == 0) {
                return None;
            }
            Some(rats[0].to_f64() + rats[1].to_f64() / 60.0 + rats[2].to_f64() / 3600.0)
        }
        _ => None,
    }
}

fn altitude(exif: &exif::Exif) -> Option<f64> {
    let field = exif.get_field(Tag::GPSAltitude, In::PRIMARY)?;
    let meters = match field.value {
        Value::Rational(ref rats) if !rats.is_empty() && rats[0].denom != 0 => rats[0].to_f64(),
        _ => return None,
    };

    // Ref 1 means below sea level
    let below = matches!(
        exif.get_field(Tag::GPSAltitudeRef, In::PRIMARY).map(|f| &f.value),
        Some(Value::Byte(bytes)) if bytes.first() == Some(&1)
    );
    Some(if below { -meters } else { meters })
}
