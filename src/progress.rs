//! Progress reporting for scan operations
//!
//! A scan publishes `ScanProgress` snapshots over an unbounded crossbeam
//! channel. Sending never blocks; a dropped receiver silently disables
//! delivery. The CLI prints each snapshot to stderr as a compact JSON line.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Sending half of a progress channel
pub type ProgressSender = Sender<ScanProgress>;

/// Scan stage indicator, in the order a scan moves through them
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    #[default]
    Initializing,
    DirectoryScanning,
    FileComparison,
    ProcessingNewImages,
    RemovingFiles,
    UpdatingData,
    Completed,
}

impl ScanStage {
    /// Get string representation of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStage::Initializing => "initializing",
            ScanStage::DirectoryScanning => "directory_scanning",
            ScanStage::FileComparison => "file_comparison",
            ScanStage::ProcessingNewImages => "processing_new_images",
            ScanStage::RemovingFiles => "removing_files",
            ScanStage::UpdatingData => "updating_data",
            ScanStage::Completed => "completed",
        }
    }
}

/// Counters carried by a progress snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub found: u64,
    pub processed: u64,
    pub failed: u64,
}

impl ProgressCounts {
    pub fn found(found: u64) -> Self {
        Self {
            found,
            ..Default::default()
        }
    }
}

/// A progress snapshot sent during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Sequence number, monotonic within one scan
    pub seq: u64,
    pub stage: ScanStage,
    pub files_found: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    /// Human-readable status line
    pub message: String,
    /// Per-lane detail during enrichment, e.g. "lane 1: 100/200, lane 2: 80/200"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Milliseconds since the scan started
    pub elapsed_ms: u64,
}

impl ScanProgress {
    /// Output progress to stderr as JSON
    pub fn print_to_stderr(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            eprintln!("{}", json);
            std::io::stderr().flush().ok();
        }
    }
}

/// Stamps and publishes progress snapshots for one scan
///
/// Shared by reference across enrichment lanes. The sequence counter is
/// held while a snapshot is sent, so the channel delivers seqs in order.
pub struct ProgressEmitter {
    sender: Option<ProgressSender>,
    seq: Mutex<u64>,
    start_time: Instant,
}

impl ProgressEmitter {
    /// Create an emitter; `None` disables delivery
    pub fn new(sender: Option<ProgressSender>) -> Self {
        Self {
            sender,
            seq: Mutex::new(0),
            start_time: Instant::now(),
        }
    }

    /// Create an emitter that drops every snapshot
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Check if the emitter delivers anything
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Get the next sequence number (monotonically increasing)
    pub fn next_seq(&self) -> u64 {
        let mut seq = self.lock_seq();
        let current = *seq;
        *seq += 1;
        current
    }

    fn lock_seq(&self) -> MutexGuard<'_, u64> {
        self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Milliseconds since the emitter was created
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Publish a snapshot
    pub fn emit(
        &self,
        stage: ScanStage,
        counts: ProgressCounts,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        let Some(sender) = &self.sender else {
            return;
        };

        let mut seq = self.lock_seq();
        let progress = ScanProgress {
            seq: *seq,
            stage,
            files_found: counts.found,
            files_processed: counts.processed,
            files_failed: counts.failed,
            message: message.into(),
            detail,
            elapsed_ms: self.elapsed_ms(),
        };

        *seq += 1;

        // Receiver gone: the caller stopped listening, the scan carries on
        if sender.send(progress).is_err() {
            log::debug!("Progress receiver dropped");
        }
    }
}

/// Whether a cumulative counter just crossed a reporting boundary
pub fn crossed_boundary(before: u64, after: u64, every: u64) -> bool {
    if every == 0 {
        return false;
    }
    before / every != after / every
}
