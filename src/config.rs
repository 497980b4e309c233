//! Configuration for the photo catalog scanner

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Result, ScanError};

/// Default number of enrichment lanes
pub const DEFAULT_LANES: usize = 5;

/// Default batch size for enrichment and store flushes
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of cumulative successes between progress updates
pub const DEFAULT_PROGRESS_EVERY: u64 = 500;

/// Default number of walked entries between scheduler yields
pub const DEFAULT_YIELD_EVERY: usize = 200;

/// Default length of the recent-images list
pub const DEFAULT_RECENT_LIMIT: usize = 20;

/// Deep enough for any real photo tree, shallow enough to stop link loops
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// What to do with a new image whose classification failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Store the image under the catch-all category with zero confidence
    #[default]
    PersistAsOther,
    /// Drop the image from this scan; it is retried on the next one
    Skip,
}

/// Scan, enrichment and catalog settings
///
/// Every field has a default, so a JSON config file only needs the keys it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Gallery folders, walked in order
    pub roots: Vec<PathBuf>,

    /// Lowercase extensions without the dot
    pub extensions: HashSet<String>,

    /// Exact directory names pruned from the walk
    pub ignore_dirs: HashSet<String>,

    /// Number of parallel enrichment lanes
    pub lanes: usize,

    /// Images per enrichment batch and per store flush
    pub batch_size: usize,

    /// Rayon threads shared by all lanes, 0 = one per core
    pub num_threads: usize,

    /// Emit an enrichment progress update every N successes
    pub progress_every: u64,

    /// Yield to the scheduler every N walked entries
    pub yield_every: usize,

    /// Length of the recent-images list kept by the cache
    pub recent_limit: usize,

    /// Policy for images whose classification failed
    pub failure_policy: FailurePolicy,

    /// SQLite catalog file; in-memory when unset
    pub db_path: Option<PathBuf>,

    /// Optional JSON city table for the location resolver
    pub cities_path: Option<PathBuf>,

    pub recursive: bool,

    /// Walk depth limit when `recursive` is set
    pub max_depth: usize,

    pub follow_links: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: to_set(&IMAGE_EXTENSIONS),
            ignore_dirs: to_set(&IGNORED_DIRS),
            lanes: DEFAULT_LANES,
            batch_size: DEFAULT_BATCH_SIZE,
            num_threads: 0,
            progress_every: DEFAULT_PROGRESS_EVERY,
            yield_every: DEFAULT_YIELD_EVERY,
            recent_limit: DEFAULT_RECENT_LIMIT,
            failure_policy: FailurePolicy::default(),
            db_path: None,
            cities_path: None,
            recursive: true,
            max_depth: DEFAULT_MAX_DEPTH,
            follow_links: false,
        }
    }
}

/// Extensions picked up by a default scan
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Trash, NAS thumbnail and tooling directories that never hold gallery photos
const IGNORED_DIRS: [&str; 8] = [
    "$RECYCLE.BIN",
    "System Volume Information",
    ".Trash",
    ".Trash-1000",
    "@eaDir",
    ".thumbnails",
    "node_modules",
    "__pycache__",
];

fn to_set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ScanConfig {
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::default()
    }

    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::io_error(Some(path.to_path_buf()), e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| {
            ScanError::invalid_input(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Whether files with this extension are scanned
    ///
    /// Case-insensitive; a leading dot is ignored. An empty whitelist
    /// accepts everything.
    pub fn should_include_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.extensions.is_empty() || self.extensions.contains(&ext)
    }

    pub fn is_image_file(&self, file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.should_include_extension(ext))
    }

    /// Hidden directories and the configured names are skipped
    pub fn should_ignore_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.ignore_dirs.contains(name)
    }

    /// Rayon pool size; `num_threads == 0` means one per core
    pub fn effective_threads(&self) -> usize {
        match self.num_threads {
            0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        }
    }

    pub fn effective_lanes(&self) -> usize {
        self.lanes.max(1)
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Walk depth handed to walkdir; a flat scan only sees the root's children
    pub fn effective_max_depth(&self) -> usize {
        if self.recursive {
            self.max_depth
        } else {
            1
        }
    }
}

/// Consuming builder for `ScanConfig`
#[derive(Debug, Default)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    /// Start from a loaded config, e.g. one read with `from_json_file`
    pub fn from_config(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.config.roots = roots;
        self
    }

    pub fn add_root(mut self, root: PathBuf) -> Self {
        self.config.roots.push(root);
        self
    }

    pub fn lanes(mut self, lanes: usize) -> Self {
        self.config.lanes = lanes;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// 0 picks one thread per core
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.config.num_threads = num_threads;
        self
    }

    pub fn progress_every(mut self, every: u64) -> Self {
        self.config.progress_every = every;
        self
    }

    pub fn yield_every(mut self, every: usize) -> Self {
        self.config.yield_every = every;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn db_path(mut self, db_path: PathBuf) -> Self {
        self.config.db_path = Some(db_path);
        self
    }

    pub fn cities_path(mut self, cities_path: PathBuf) -> Self {
        self.config.cities_path = Some(cities_path);
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.config.recursive = recursive;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    pub fn build(self) -> ScanConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_gallery_cadence() {
        let config = ScanConfig::default();
        assert_eq!((config.lanes, config.batch_size), (5, 100));
        assert_eq!(config.progress_every, 500);
        assert_eq!(config.recent_limit, 20);
        assert_eq!(config.failure_policy, FailurePolicy::PersistAsOther);
        assert!(config.roots.is_empty() && config.db_path.is_none());
    }

    #[test]
    fn test_flat_scan_depth() {
        let config = ScanConfig::builder().recursive(false).max_depth(9).build();
        assert_eq!(config.effective_max_depth(), 1);
        let config = ScanConfig::builder().max_depth(9).build();
        assert_eq!(config.effective_max_depth(), 9);
    }

    #[test]
    fn test_is_image_file() {
        let config = ScanConfig::default();
        assert!(config.is_image_file("IMG_0001.JPG"));
        assert!(config.is_image_file("shot.webp"));
        assert!(!config.is_image_file("clip.mp4"));
        assert!(!config.is_image_file("README"));
        assert!(config.should_include_extension(".Jpeg"));
    }

    #[test]
    fn test_empty_whitelist_accepts_anything() {
        let mut config = ScanConfig::default();
        config.extensions.clear();
        assert!(config.is_image_file("scan.tiff"));
        assert!(!config.is_image_file("no_extension"));
    }

    #[test]
    fn test_hidden_and_listed_dirs_are_pruned() {
        let config = ScanConfig::default();
        for name in [".git", "$RECYCLE.BIN", "@eaDir", "node_modules"] {
            assert!(config.should_ignore_dir(name), "{}", name);
        }
        assert!(!config.should_ignore_dir("DCIM"));
        assert!(!config.should_ignore_dir("Camera"));
    }

    #[test]
    fn test_config_builder() {
        let config = ScanConfig::builder()
            .add_root(PathBuf::from("/photos"))
            .lanes(3)
            .batch_size(50)
            .num_threads(2)
            .failure_policy(FailurePolicy::Skip)
            .build();

        assert_eq!(config.roots, vec![PathBuf::from("/photos")]);
        assert_eq!(config.lanes, 3);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.effective_threads(), 2);
        assert_eq!(config.failure_policy, FailurePolicy::Skip);
    }

    #[test]
    fn test_zero_lanes_and_batches_are_clamped() {
        let config = ScanConfig::builder().lanes(0).batch_size(0).build();
        assert_eq!(config.effective_lanes(), 1);
        assert_eq!(config.effective_batch_size(), 1);
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{"roots": ["/pics"], "lanes": 2, "failure_policy": "skip"}"#)
            .unwrap();

        let config = ScanConfig::from_json_file(&path).unwrap();
        assert_eq!(config.roots, vec![PathBuf::from("/pics")]);
        assert_eq!(config.lanes, 2);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.failure_policy, FailurePolicy::Skip);
        assert!(config.extensions.contains("jpg"));
    }

    #[test]
    fn test_from_json_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(ScanConfig::from_json_file(&path).is_err());
    }
}
