//! Set difference between stored and on-disk URIs

use std::collections::HashSet;

use crate::models::FileEntry;

/// What a scan has to change
#[derive(Debug, Default)]
pub struct ScanDiff {
    /// Stored URIs no longer on disk
    pub to_remove: Vec<String>,
    /// On-disk files not yet stored, in walk order
    pub to_add: Vec<FileEntry>,
    /// Files present on both sides
    pub unchanged: usize,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Compare stored URIs with the files found on disk
///
/// Unchanged files are left alone; an in-place edit of a known file is not
/// detected.
pub fn compute_diff(existing: &HashSet<String>, current: Vec<FileEntry>) -> ScanDiff {
    let current_uris: HashSet<&str> = current.iter().map(|f| f.uri.as_str()).collect();

    let mut to_remove: Vec<String> = existing
        .iter()
        .filter(|uri| !current_uris.contains(uri.as_str()))
        .cloned()
        .collect();
    to_remove.sort();

    let mut unchanged = 0;
    let mut to_add = Vec::new();
    for file in current {
        if existing.contains(&file.uri) {
            unchanged += 1;
        } else {
            to_add.push(file);
        }
    }

    ScanDiff {
        to_remove,
        to_add,
        unchanged,
    }
}
