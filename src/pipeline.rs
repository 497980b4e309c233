//! Enrichment pipeline - turns new files into full catalog records
//!
//! New files are split into lanes that run on scoped threads. Each lane
//! walks its share in batches; a batch is enriched in parallel on a shared
//! rayon pool and then flushed to the store with one `batch_upsert`.

use log::{debug, info, warn};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::classifier::{Classifier, ClassifyHints, HeuristicClassifier};
use crate::config::{FailurePolicy, ScanConfig};
use crate::db::RecordStore;
use crate::error::{Result, ScanError};
use crate::location::{CityTable, LocationResolver};
use crate::metadata::{ExifExtractor, MetadataExtractor};
use crate::models::{Category, Confidence, FileEntry, ImageRecord, Location, LocationSource};
use crate::progress::{crossed_boundary, ProgressCounts, ProgressEmitter, ScanStage};
use crate::scanner::CancelToken;

/// The external services a scan depends on
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn MetadataExtractor>,
    pub classifier: Arc<dyn Classifier>,
    pub resolver: Arc<dyn LocationResolver>,
}

impl Collaborators {
    pub fn new(
        extractor: Arc<dyn MetadataExtractor>,
        classifier: Arc<dyn Classifier>,
        resolver: Arc<dyn LocationResolver>,
    ) -> Self {
        Self {
            extractor,
            classifier,
            resolver,
        }
    }

    /// EXIF extractor, heuristic classifier and the configured city table
    pub fn builtin(config: &ScanConfig) -> Result<Self> {
        let cities = match &config.cities_path {
            Some(path) => CityTable::from_json_file(path)?,
            None => CityTable::builtin(),
        };
        Ok(Self::new(
            Arc::new(ExifExtractor),
            Arc::new(HeuristicClassifier::new()?),
            Arc::new(cities),
        ))
    }
}

/// Classification timing over one enrichment run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSummary {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Result of one enrichment run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichStats {
    /// Records written to the store
    pub added: u64,
    /// Images whose classification failed
    pub failed: u64,
    /// Whether the run stopped at a batch boundary because of cancellation
    pub cancelled: bool,
    pub timing: Option<TimingSummary>,
}

struct ClassifyTiming {
    count: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl ClassifyTiming {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn summary(&self) -> Option<TimingSummary> {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        let total = self.total_us.load(Ordering::Relaxed) as f64;
        Some(TimingSummary {
            count,
            avg_ms: total / count as f64 / 1000.0,
            min_ms: self.min_us.load(Ordering::Relaxed) as f64 / 1000.0,
            max_ms: self.max_us.load(Ordering::Relaxed) as f64 / 1000.0,
        })
    }
}

enum ItemOutcome {
    Enriched(ImageRecord),
    /// Classification failed; carries the catch-all fallback record
    Failed(ImageRecord),
    Fatal(ScanError),
}

/// State shared by every lane of one run
struct LaneShared {
    failed: AtomicU64,
    /// Records the store accepted; the `files_processed` of every update
    written: AtomicU64,
    lane_done: Vec<AtomicU64>,
    lane_total: Vec<u64>,
    abort: AtomicBool,
    fatal: Mutex<Option<ScanError>>,
    timing: ClassifyTiming,
}

impl LaneShared {
    fn fail(&self, err: ScanError) {
        log::error!("Enrichment aborted: {}", err);
        if let Ok(mut slot) = self.fatal.lock() {
            slot.get_or_insert(err);
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn detail(&self) -> String {
        self.lane_total
            .iter()
            .enumerate()
            .map(|(i, total)| {
                format!(
                    "lane {}: {}/{}",
                    i + 1,
                    self.lane_done[i].load(Ordering::Relaxed),
                    total
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Runs enrichment for the files a scan found to be new
pub struct EnrichmentPipeline<'a> {
    config: &'a ScanConfig,
    store: &'a dyn RecordStore,
    collaborators: &'a Collaborators,
    progress: &'a ProgressEmitter,
    cancel: &'a CancelToken,
}

impl<'a> EnrichmentPipeline<'a> {
    pub fn new(
        config: &'a ScanConfig,
        store: &'a dyn RecordStore,
        collaborators: &'a Collaborators,
        progress: &'a ProgressEmitter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            config,
            store,
            collaborators,
            progress,
            cancel,
        }
    }

    /// Enrich and persist `files`
    ///
    /// Per-image failures are counted; a store or collaborator outage stops
    /// every lane and is returned as the error.
    pub fn run(&self, files: &[FileEntry], files_found: u64) -> Result<EnrichStats> {
        if files.is_empty() {
            return Ok(EnrichStats::default());
        }
        self.collaborators.classifier.ready()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.effective_threads())
            .build()
            .map_err(|e| ScanError::unavailable(format!("Cannot start worker pool: {}", e)))?;

        let lanes = self.config.effective_lanes().min(files.len());
        let lane_size = files.len().div_ceil(lanes);
        let chunks: Vec<&[FileEntry]> = files.chunks(lane_size).collect();

        let shared = LaneShared {
            failed: AtomicU64::new(0),
            written: AtomicU64::new(0),
            lane_done: chunks.iter().map(|_| AtomicU64::new(0)).collect(),
            lane_total: chunks.iter().map(|c| c.len() as u64).collect(),
            abort: AtomicBool::new(false),
            fatal: Mutex::new(None),
            timing: ClassifyTiming::new(),
        };

        info!(
            "Enriching {} new images in {} lanes (batch size {})",
            files.len(),
            chunks.len(),
            self.config.effective_batch_size()
        );

        std::thread::scope(|s| {
            for (lane, chunk) in chunks.iter().enumerate() {
                let shared = &shared;
                let pool = &pool;
                s.spawn(move || self.run_lane(lane, chunk, pool, shared, files_found));
            }
        });

        let counts = ProgressCounts {
            found: files_found,
            processed: shared.written.load(Ordering::SeqCst),
            failed: shared.failed.load(Ordering::SeqCst),
        };
        self.progress.emit(
            ScanStage::ProcessingNewImages,
            counts,
            format!(
                "Stored {} new images, {} failed classification",
                counts.processed, counts.failed
            ),
            Some(shared.detail()),
        );

        let timing = shared.timing.summary();
        if let Some(t) = timing {
            info!(
                "Classification timing: {} images, avg {:.1}ms, min {:.1}ms, max {:.1}ms",
                t.count, t.avg_ms, t.min_ms, t.max_ms
            );
        }

        let fatal = shared
            .fatal
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(err) = fatal {
            return Err(err);
        }

        Ok(EnrichStats {
            added: shared.written.load(Ordering::SeqCst),
            failed: shared.failed.load(Ordering::SeqCst),
            cancelled: self.cancel.is_cancelled(),
            timing,
        })
    }

    fn run_lane(
        &self,
        lane: usize,
        files: &[FileEntry],
        pool: &rayon::ThreadPool,
        shared: &LaneShared,
        files_found: u64,
    ) {
        for batch in files.chunks(self.config.effective_batch_size()) {
            if self.cancel.is_cancelled() || shared.abort.load(Ordering::SeqCst) {
                debug!("Lane {} stopping early", lane + 1);
                return;
            }

            let outcomes: Vec<ItemOutcome> =
                pool.install(|| batch.par_iter().map(|f| self.enrich_one(f, shared)).collect());

            let mut records = Vec::with_capacity(outcomes.len());
            let mut failed = 0u64;
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Enriched(record) => records.push(record),
                    ItemOutcome::Failed(record) => {
                        failed += 1;
                        if self.config.failure_policy == FailurePolicy::PersistAsOther {
                            records.push(record);
                        }
                    }
                    ItemOutcome::Fatal(err) => {
                        shared.fail(err);
                        return;
                    }
                }
            }

            let written = match self.store.batch_upsert(&records) {
                Ok(n) => n as u64,
                Err(e) => {
                    shared.fail(e);
                    return;
                }
            };
            debug!("Lane {} flushed {} records", lane + 1, written);

            shared.lane_done[lane].fetch_add(batch.len() as u64, Ordering::Relaxed);
            shared.failed.fetch_add(failed, Ordering::SeqCst);
            let before = shared.written.fetch_add(written, Ordering::SeqCst);
            let after = before + written;

            if crossed_boundary(before, after, self.config.progress_every) {
                self.progress.emit(
                    ScanStage::ProcessingNewImages,
                    ProgressCounts {
                        found: files_found,
                        processed: after,
                        failed: shared.failed.load(Ordering::SeqCst),
                    },
                    format!("Stored {} new images", after),
                    Some(shared.detail()),
                );
            }
        }
    }

    fn enrich_one(&self, file: &FileEntry, shared: &LaneShared) -> ItemOutcome {
        let mut record = ImageRecord::from_entry(file);

        let metadata = match self.collaborators.extractor.extract(&file.path) {
            Ok(m) => m,
            Err(e) => {
                debug!("No metadata for {}: {}", file.file_name, e.message);
                Default::default()
            }
        };
        record.captured_at = metadata.captured_at;

        if let Some(gps) = metadata.gps {
            let mut location = Location {
                latitude: gps.latitude,
                longitude: gps.longitude,
                altitude: gps.altitude,
                source: LocationSource::Exif,
                ..Default::default()
            };
            if let Some(city) = self
                .collaborators
                .resolver
                .nearest_city(gps.latitude, gps.longitude)
            {
                location.city = Some(city.name);
                location.province = Some(city.province);
                location.distance_to_city = Some(city.distance_km);
            }
            record.location = Some(location);
        }

        let hints = ClassifyHints {
            file_name: &file.file_name,
            size: file.size,
            timestamp: record.sort_time(),
        };
        let started = Instant::now();
        let result = self.collaborators.classifier.classify(&file.uri, &hints);
        shared.timing.record(started.elapsed());

        match result {
            Ok(c) => {
                record.category = Some(c.category);
                record.confidence = Confidence::Score(c.confidence);
                record.id_document_detections = c.id_document_detections;
                record.general_detections = c.general_detections;
                ItemOutcome::Enriched(record)
            }
            Err(e) if !e.is_per_item() => ItemOutcome::Fatal(e),
            Err(e) => {
                warn!("Classification failed for {}: {}", file.file_name, e.message);
                record.category = Some(Category::Other);
                record.confidence = Confidence::Score(0.0);
                ItemOutcome::Failed(record)
            }
        }
    }
}
