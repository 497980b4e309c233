//! Core data models for the photo catalog

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Image category assigned by the classifier or by a manual edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Wechat,
    Meeting,
    Document,
    People,
    Life,
    Game,
    Food,
    Travel,
    Pet,
    /// Catch-all bucket
    Other,
}

impl Category {
    /// All categories in display order
    pub const ALL: [Category; 10] = [
        Category::Wechat,
        Category::Meeting,
        Category::Document,
        Category::People,
        Category::Life,
        Category::Game,
        Category::Food,
        Category::Travel,
        Category::Pet,
        Category::Other,
    ];

    /// Get the stable string id
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Wechat => "wechat",
            Category::Meeting => "meeting",
            Category::Document => "document",
            Category::People => "people",
            Category::Life => "life",
            Category::Game => "game",
            Category::Food => "food",
            Category::Travel => "travel",
            Category::Pet => "pet",
            Category::Other => "other",
        }
    }

    /// Get the localized display label shown in the gallery
    pub fn display_name(&self) -> &'static str {
        match self {
            Category::Wechat => "微信截图",
            Category::Meeting => "会议场景",
            Category::Document => "工作照片",
            Category::People => "社交活动",
            Category::Life => "生活记录",
            Category::Game => "游戏截图",
            Category::Food => "美食记录",
            Category::Travel => "旅行风景",
            Category::Pet => "宠物照片",
            Category::Other => "其他图片",
        }
    }

    /// Parse an id or a display label; returns None for unknown input
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed) || c.display_name() == trimmed)
    }

    /// Normalize any label to a category, unknown labels go to `Other`
    pub fn normalize(input: &str) -> Self {
        Self::parse(input).unwrap_or(Category::Other)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classifier confidence, or the marker for a manual recategorization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Score(f32),
    Manual(ManualMarker),
}

/// Serializes as the literal string `"manual"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualMarker {
    Manual,
}

impl Confidence {
    /// Confidence for a manually assigned category
    pub const MANUAL: Confidence = Confidence::Manual(ManualMarker::Manual);

    /// Check if the category was set by hand
    pub fn is_manual(&self) -> bool {
        matches!(self, Confidence::Manual(_))
    }

    /// Numeric score, manual edits count as certain
    pub fn score(&self) -> f32 {
        match self {
            Confidence::Score(s) => *s,
            Confidence::Manual(_) => 1.0,
        }
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::Score(0.0)
    }
}

/// A single object detection reported by the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detected class label
    pub class: String,
    /// Detection confidence in [0, 1]
    pub confidence: f32,
}

/// Where the location of a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Exif,
    Manual,
    #[default]
    None,
}

/// Geographic information attached to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    /// Distance to the resolved city center in kilometers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_city: Option<f64>,
    #[serde(default)]
    pub source: LocationSource,
}

/// One catalog entry describing a single discovered image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Stable id derived from the uri
    pub id: String,
    pub uri: String,
    pub file_name: String,
    /// File size in bytes
    pub size: u64,
    /// Filesystem time in milliseconds since the epoch
    pub file_time: i64,
    /// EXIF capture time in milliseconds since the epoch
    #[serde(default)]
    pub captured_at: Option<i64>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub id_document_detections: Vec<Detection>,
    #[serde(default)]
    pub general_detections: Vec<Detection>,
    #[serde(default)]
    pub location: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Cache-only selection flag, never persisted
    #[serde(skip)]
    pub selected: bool,
}

impl ImageRecord {
    /// Create a bare record for a discovered file
    pub fn from_entry(entry: &FileEntry) -> Self {
        let now = Utc::now();
        Self {
            id: record_id_for_uri(&entry.uri),
            uri: entry.uri.clone(),
            file_name: entry.file_name.clone(),
            size: entry.size,
            file_time: entry.file_time,
            captured_at: None,
            category: None,
            confidence: Confidence::default(),
            id_document_detections: Vec::new(),
            general_detections: Vec::new(),
            location: None,
            created_at: now,
            updated_at: now,
            selected: false,
        }
    }

    /// Category used for aggregation; unclassified records count as `Other`
    pub fn effective_category(&self) -> Category {
        self.category.unwrap_or(Category::Other)
    }

    /// Resolved city name, if any
    pub fn city(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.city.as_deref())
    }

    /// GPS coordinates, if any
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.location.as_ref().map(|l| (l.latitude, l.longitude))
    }

    /// Recency key: capture time, falling back to the file time
    pub fn sort_time(&self) -> i64 {
        self.captured_at.unwrap_or(self.file_time)
    }
}

/// Derive the stable record id for a uri
pub fn record_id_for_uri(uri: &str) -> String {
    let digest = Md5::digest(uri.as_bytes());
    format!("img_{:x}", digest)
}

/// Build the catalog uri for an absolute path
pub fn path_to_uri(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    if normalized.starts_with('/') {
        format!("file://{}", normalized)
    } else {
        format!("file:///{}", normalized)
    }
}

/// Filesystem path behind a `file://` uri
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

/// A file found on disk by the directory walker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub uri: String,
    pub file_name: String,
    pub size: u64,
    /// ctime falling back to mtime, milliseconds since the epoch
    pub file_time: i64,
    pub path: PathBuf,
}

/// Result of a scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Records removed because their file disappeared
    pub removed: u64,
    /// Records written for new files
    pub added: u64,
    /// New files whose enrichment failed
    pub failed: u64,
    /// Image files found on disk
    pub files_found: u64,
    /// Whether the scan stopped early through its cancel token
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    /// Total scan duration in milliseconds
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_is_pure_function_of_uri() {
        let a = record_id_for_uri("file:///photos/a.jpg");
        let b = record_id_for_uri("file:///photos/a.jpg");
        let c = record_id_for_uri("file:///photos/b.jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("img_"));
        assert_eq!(a.len(), 4 + 32);
    }

    #[test]
    fn test_category_parse_accepts_ids_and_labels() {
        assert_eq!(Category::parse("food"), Some(Category::Food));
        assert_eq!(Category::parse("FOOD"), Some(Category::Food));
        assert_eq!(Category::parse("宠物照片"), Some(Category::Pet));
        assert_eq!(Category::parse("unknown"), None);
        assert_eq!(Category::normalize("unknown"), Category::Other);
    }

    #[test]
    fn test_confidence_serialization() {
        assert_eq!(serde_json::to_string(&Confidence::MANUAL).unwrap(), "\"manual\"");
        assert_eq!(serde_json::to_string(&Confidence::Score(0.5)).unwrap(), "0.5");

        let manual: Confidence = serde_json::from_str("\"manual\"").unwrap();
        assert!(manual.is_manual());
        let score: Confidence = serde_json::from_str("0.75").unwrap();
        assert_eq!(score, Confidence::Score(0.75));
    }

    #[test]
    fn test_selected_flag_is_not_persisted() {
        let entry = FileEntry {
            uri: "file:///p/x.png".to_string(),
            file_name: "x.png".to_string(),
            size: 10,
            file_time: 1_000,
            path: PathBuf::from("/p/x.png"),
        };
        let mut record = ImageRecord::from_entry(&entry);
        record.selected = true;

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("selected"));
        let back: ImageRecord = serde_json::from_str(&json).unwrap();
        assert!(!back.selected);
        assert_eq!(back.id, record.id);
    }

    #[test]
    fn test_sort_time_prefers_capture_time() {
        let entry = FileEntry {
            uri: "file:///p/y.png".to_string(),
            file_name: "y.png".to_string(),
            size: 10,
            file_time: 5_000,
            path: PathBuf::from("/p/y.png"),
        };
        let mut record = ImageRecord::from_entry(&entry);
        assert_eq!(record.sort_time(), 5_000);
        record.captured_at = Some(9_000);
        assert_eq!(record.sort_time(), 9_000);
    }

    #[test]
    fn test_path_to_uri() {
        assert_eq!(path_to_uri(Path::new("/a/b.jpg")), "file:///a/b.jpg");
        assert_eq!(
            uri_to_path("file:///a/b.jpg"),
            Some(PathBuf::from("/a/b.jpg"))
        );
        assert_eq!(uri_to_path("content://media/1"), None);
    }
}
