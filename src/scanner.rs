//! Scanner module - the incremental scan state machine
//!
//! initializing → directory_scanning → file_comparison →
//! processing_new_images → removing_files → updating_data → completed
//!
//! Stages with nothing to do are skipped. The cache is never touched until
//! the final full rebuild.

use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::CacheIndex;
use crate::config::ScanConfig;
use crate::db::{RecordStore, LAST_SCAN_TIME_KEY};
use crate::diff::compute_diff;
use crate::error::{Result, ScanError, ScanErrorKind};
use crate::models::ScanSummary;
use crate::pipeline::{Collaborators, EnrichmentPipeline};
use crate::progress::{ProgressCounts, ProgressEmitter, ProgressSender, ScanStage};
use crate::walker::walk_roots;

/// Shared flag that asks a running scan to stop at its next checkpoint
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one scan run needs
pub struct ScanContext<'a> {
    pub config: &'a ScanConfig,
    pub store: &'a dyn RecordStore,
    pub cache: &'a CacheIndex,
    pub collaborators: &'a Collaborators,
}

/// Perform an incremental scan of the configured roots
///
/// New files are enriched and stored, vanished files are deleted, then the
/// cache is rebuilt from the store. A cancelled scan skips the remaining
/// work but still rebuilds the cache.
pub fn run_scan(
    ctx: &ScanContext<'_>,
    progress: Option<ProgressSender>,
    cancel: &CancelToken,
) -> Result<ScanSummary> {
    let start = Instant::now();
    let emitter = ProgressEmitter::new(progress);
    let mut summary = ScanSummary::default();

    info!("Starting incremental scan of {} roots", ctx.config.roots.len());
    emitter.emit(
        ScanStage::Initializing,
        ProgressCounts::default(),
        "Loading catalog",
        None,
    );

    let existing = ctx.store.all_uris().map_err(|e| {
        error!("Cannot read catalog: {}", e);
        e
    })?;

    // Directory walk
    emitter.emit(
        ScanStage::DirectoryScanning,
        ProgressCounts::default(),
        "Scanning directories",
        None,
    );
    let outcome = walk_roots(ctx.config, cancel, &mut |found| {
        emitter.emit(
            ScanStage::DirectoryScanning,
            ProgressCounts::found(found),
            format!("Found {} images", found),
            None,
        );
    });

    if outcome.stats.all_roots_failed() {
        let root = ctx.config.roots.first().cloned().unwrap_or_default();
        error!(
            "None of the {} scan roots could be listed, leaving catalog unchanged",
            outcome.stats.roots_total
        );
        return Err(ScanError::new(
            ScanErrorKind::NotFound,
            Some(root),
            format!(
                "None of the {} scan roots could be listed",
                outcome.stats.roots_total
            ),
        ));
    }

    summary.files_found = outcome.files.len() as u64;
    let found = summary.files_found;

    // Comparison
    let diff = compute_diff(&existing, outcome.files);
    info!(
        "Found {} images: {} new, {} removed, {} unchanged",
        found,
        diff.to_add.len(),
        diff.to_remove.len(),
        diff.unchanged
    );
    emitter.emit(
        ScanStage::FileComparison,
        ProgressCounts::found(found),
        format!(
            "{} new images, {} removed",
            diff.to_add.len(),
            diff.to_remove.len()
        ),
        None,
    );

    // Enrichment
    if !diff.to_add.is_empty() && !cancel.is_cancelled() {
        emitter.emit(
            ScanStage::ProcessingNewImages,
            ProgressCounts::found(found),
            format!("Processing {} new images", diff.to_add.len()),
            None,
        );
        let pipeline =
            EnrichmentPipeline::new(ctx.config, ctx.store, ctx.collaborators, &emitter, cancel);
        match pipeline.run(&diff.to_add, found) {
            Ok(stats) => {
                summary.added = stats.added;
                summary.failed = stats.failed;
            }
            Err(e) => {
                // Earlier batches are already stored; keep the cache honest
                if let Err(rebuild) = ctx.cache.refresh_cache() {
                    warn!("Cache rebuild after failed scan also failed: {}", rebuild);
                }
                return Err(e);
            }
        }
    }

    // Removal
    if !diff.to_remove.is_empty() && !cancel.is_cancelled() {
        emitter.emit(
            ScanStage::RemovingFiles,
            ProgressCounts::found(found),
            format!("Removing {} vanished images", diff.to_remove.len()),
            None,
        );
        summary.removed = ctx.store.delete_by_uris(&diff.to_remove)? as u64;
    }

    // Rebuild
    emitter.emit(
        ScanStage::UpdatingData,
        ProgressCounts::found(found),
        "Updating catalog",
        None,
    );
    ctx.cache.refresh_cache()?;

    summary.cancelled = cancel.is_cancelled();
    if !summary.cancelled {
        if let Err(e) = ctx
            .store
            .set_setting(LAST_SCAN_TIME_KEY, &Utc::now().to_rfc3339())
        {
            warn!("Cannot record scan time: {}", e);
        }
    }
    summary.duration_ms = start.elapsed().as_millis() as u64;

    emitter.emit(
        ScanStage::Completed,
        ProgressCounts {
            found,
            processed: summary.added,
            failed: summary.failed,
        },
        if summary.cancelled {
            "Scan cancelled".to_string()
        } else {
            format!(
                "Scan complete: {} added, {} removed",
                summary.added, summary.removed
            )
        },
        None,
    );
    info!(
        "Scan finished in {}ms: {} added, {} removed, {} failed{}",
        summary.duration_ms,
        summary.added,
        summary.removed,
        summary.failed,
        if summary.cancelled { " (cancelled)" } else { "" }
    );

    Ok(summary)
}
