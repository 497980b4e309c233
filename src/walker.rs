//! Directory walker - enumerates image files under the configured roots

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::models::{path_to_uri, FileEntry};
use crate::scanner::CancelToken;

/// Statistics collected during one walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Configured roots
    pub roots_total: usize,
    /// Roots that could be listed
    pub roots_enumerated: usize,
    /// Roots that do not exist
    pub roots_missing: usize,
    /// Roots that exist but could not be listed
    pub roots_unreadable: usize,
    /// Directories visited
    pub dirs: u64,
    /// Entries skipped because they could not be read
    pub entry_errors: u64,
    /// Files reached twice through overlapping roots or links
    pub duplicates: u64,
    /// Whether the walk stopped early
    pub cancelled: bool,
}

impl WalkStats {
    /// Whether roots were configured but none of them could be listed
    pub fn all_roots_failed(&self) -> bool {
        self.roots_total > 0 && self.roots_enumerated == 0
    }
}

/// Files found by one walk
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<FileEntry>,
    pub stats: WalkStats,
}

/// Walk every configured root and collect image files
///
/// `on_progress` receives the running count of image files every
/// `yield_every` entries; the walker yields the thread at the same points
/// and stops early once `cancel` fires.
pub fn walk_roots(
    config: &ScanConfig,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64),
) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut visited: usize = 0;
    let yield_every = config.yield_every.max(1);

    outcome.stats.roots_total = config.roots.len();

    'roots: for root in &config.roots {
        if let Err(e) = std::fs::read_dir(root) {
            if e.kind() == std::io::ErrorKind::NotFound {
                log::warn!("Scan root does not exist, skipping: {}", root.display());
                outcome.stats.roots_missing += 1;
            } else {
                let err = ScanError::from(e);
                log::warn!("Cannot list scan root {}: {}", root.display(), err.message);
                outcome.stats.roots_unreadable += 1;
            }
            continue;
        }
        outcome.stats.roots_enumerated += 1;

        let root = absolute_root(root);
        let walker = WalkDir::new(&root)
            .max_depth(config.effective_max_depth())
            .follow_links(config.follow_links)
            .into_iter()
            .filter_entry(|e| {
                // The root itself is never filtered, even if it is hidden
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                match e.file_name().to_str() {
                    Some(name) => !config.should_ignore_dir(name),
                    None => true,
                }
            });

        for entry in walker {
            visited += 1;
            if visited % yield_every == 0 {
                on_progress(outcome.files.len() as u64);
                std::thread::yield_now();
                if cancel.is_cancelled() {
                    outcome.stats.cancelled = true;
                    break 'roots;
                }
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let err = ScanError::from(e);
                    log::warn!("Skipping unreadable entry: {}", err);
                    outcome.stats.entry_errors += 1;
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                outcome.stats.dirs += 1;
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().to_string();
            if !config.is_image_file(&file_name) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    let err = ScanError::from(e);
                    log::warn!("Skipping file without metadata: {}", err);
                    outcome.stats.entry_errors += 1;
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let uri = path_to_uri(entry.path());
            if !seen.insert(uri.clone()) {
                outcome.stats.duplicates += 1;
                continue;
            }

            outcome.files.push(FileEntry {
                uri,
                file_name,
                size: metadata.len(),
                file_time: file_time_ms(&metadata),
                path: entry.path().to_path_buf(),
            });
        }
    }

    on_progress(outcome.files.len() as u64);
    log::debug!(
        "Walk finished: {} files, {} dirs, {} entry errors",
        outcome.files.len(),
        outcome.stats.dirs,
        outcome.stats.entry_errors
    );
    outcome
}

fn absolute_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

/// Creation time falling back to modification time, in milliseconds
fn file_time_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
