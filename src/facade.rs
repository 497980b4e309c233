//! Synchronized access to the catalog
//!
//! Every mutation goes through `SyncFacade`: the store is written first,
//! then the cache gets a precise update. When the precise update cannot be
//! applied the cache is rebuilt from the store before the call returns, so
//! the cache never runs ahead of what is durable.
//!
//! Each write holds the cache's write gate from its first store access until
//! the cache has caught up. Overlapping writes and rebuilds therefore reach
//! the store and the cache in the same order.

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cache::{
    CacheEvent, CacheIndex, CacheStatus, ListenerId, SelectionEvent, SelectionFilter,
    SelectionStats, WriteGate,
};
use crate::config::ScanConfig;
use crate::db::{RecordStore, SqliteRecordStore, LAST_SCAN_TIME_KEY};
use crate::error::{Result, ScanError};
use crate::models::{uri_to_path, Category, Confidence, ImageRecord, ScanSummary};
use crate::pipeline::Collaborators;
use crate::progress::{ProgressSender, ScanProgress};
use crate::scanner::{run_scan, CancelToken, ScanContext};

/// What `write_deletes` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Drop catalog records only
    #[default]
    RecordOnly,
    /// Delete the files too; a record is dropped only once its file is gone
    RecordAndFile,
}

/// Result of `write_deletes`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub files_deleted: usize,
    pub files_failed: usize,
    /// Files that were already missing or whose record was unknown
    pub files_skipped: usize,
    pub records_removed: usize,
}

/// Result of `backfill_city_info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillOutcome {
    pub updated: usize,
    /// Records with coordinates that match no known city
    pub skipped: usize,
}

/// Store plus cache, kept in step
#[derive(Clone)]
pub struct SyncFacade {
    store: Arc<dyn RecordStore>,
    cache: Arc<CacheIndex>,
    config: ScanConfig,
    collaborators: Collaborators,
}

impl SyncFacade {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<CacheIndex>,
        config: ScanConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            collaborators,
        }
    }

    /// Open the configured database with the built-in collaborators
    ///
    /// Without a `db_path` the catalog lives in memory.
    pub fn open(config: ScanConfig) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match &config.db_path {
            Some(path) => Arc::new(SqliteRecordStore::open(path)?),
            None => Arc::new(SqliteRecordStore::open_memory()?),
        };
        let cache = Arc::new(CacheIndex::new(store.clone(), config.recent_limit));
        let collaborators = Collaborators::builtin(&config)?;
        Ok(Self::new(store, cache, config, collaborators))
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheIndex> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ---- scanning ---------------------------------------------------------

    /// Run an incremental scan on the calling thread
    pub fn scan_with_progress(
        &self,
        progress: Option<ProgressSender>,
        cancel: &CancelToken,
    ) -> Result<ScanSummary> {
        let ctx = ScanContext {
            config: &self.config,
            store: self.store.as_ref(),
            cache: &self.cache,
            collaborators: &self.collaborators,
        };
        run_scan(&ctx, progress, cancel)
    }

    /// Run an incremental scan on a background thread
    ///
    /// The receiver disconnects once the scan is over.
    pub fn spawn_scan(
        &self,
        cancel: CancelToken,
    ) -> (Receiver<ScanProgress>, JoinHandle<Result<ScanSummary>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let facade = self.clone();
        let handle = std::thread::spawn(move || facade.scan_with_progress(Some(tx), &cancel));
        (rx, handle)
    }

    /// Time of the last scan that ran to completion
    pub fn last_scan_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get_setting(LAST_SCAN_TIME_KEY)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(time) => Ok(Some(time.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring malformed last scan time {:?}: {}", raw, e);
                Ok(None)
            }
        }
    }

    // ---- writes -----------------------------------------------------------

    /// Manually recategorize one record
    pub fn write_classification(&self, id: &str, category: Category) -> Result<ImageRecord> {
        let gate = self.cache.write_gate()?;
        let mut record = self
            .store
            .get_by_id(id)?
            .ok_or_else(|| ScanError::record_not_found(id))?;
        let now = Utc::now();
        record.category = Some(category);
        record.confidence = Confidence::MANUAL;
        record.updated_at = now;
        self.store.batch_upsert(std::slice::from_ref(&record))?;

        let applied = self.cache.update_image_classification(id, category, now);
        rebuild_unless(&gate, applied, "classification")?;
        info!("Recategorized {} as {}", id, category);
        Ok(record)
    }

    /// Drop one record; returns whether it existed
    pub fn write_delete(&self, id: &str) -> Result<bool> {
        let outcome = self.write_deletes(&[id.to_string()], DeleteMode::RecordOnly)?;
        Ok(outcome.records_removed == 1)
    }

    /// Drop records, and in `RecordAndFile` mode their files
    pub fn write_deletes(&self, ids: &[String], mode: DeleteMode) -> Result<DeleteOutcome> {
        let gate = self.cache.write_gate()?;
        let mut outcome = DeleteOutcome::default();
        let doomed: Vec<String> = match mode {
            DeleteMode::RecordOnly => ids.to_vec(),
            DeleteMode::RecordAndFile => self.delete_files(ids, &mut outcome)?,
        };
        if doomed.is_empty() {
            return Ok(outcome);
        }

        outcome.records_removed = self.store.delete_by_ids(&doomed)?;
        let cached = self.cache.remove_images(&doomed);
        rebuild_unless(&gate, cached == outcome.records_removed, "delete")?;
        Ok(outcome)
    }

    /// Delete files behind `ids`, returning the ids whose file is now gone
    fn delete_files(&self, ids: &[String], outcome: &mut DeleteOutcome) -> Result<Vec<String>> {
        let mut gone = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(path) = self
                .store
                .get_by_id(id)?
                .and_then(|record| uri_to_path(&record.uri))
            else {
                outcome.files_skipped += 1;
                continue;
            };

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    outcome.files_deleted += 1;
                    gone.push(id.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    outcome.files_skipped += 1;
                    gone.push(id.clone());
                }
                Err(e) => {
                    let err = ScanError::from(e);
                    warn!("Cannot delete {}: {}", path.display(), err.message);
                    outcome.files_failed += 1;
                }
            }
        }
        Ok(gone)
    }

    /// Overwrite records with richer versions
    ///
    /// Records not yet cached make the cache rebuild.
    pub fn write_detailed_info_batch(&self, records: &[ImageRecord]) -> Result<usize> {
        let gate = self.cache.write_gate()?;
        self.write_detailed_info_gated(&gate, records)
    }

    fn write_detailed_info_gated(
        &self,
        gate: &WriteGate<'_>,
        records: &[ImageRecord],
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let stamped: Vec<ImageRecord> = records
            .iter()
            .map(|r| ImageRecord {
                updated_at: now,
                ..r.clone()
            })
            .collect();
        let written = self.store.batch_upsert(&stamped)?;

        let applied = self.cache.replace_records(&stamped);
        rebuild_unless(gate, applied, "detailed info")?;
        Ok(written)
    }

    /// Resolve cities for records that have coordinates but no city
    pub fn backfill_city_info(&self) -> Result<BackfillOutcome> {
        let gate = self.cache.write_gate()?;
        let mut outcome = BackfillOutcome::default();
        let mut updated = Vec::new();

        for mut record in self.store.get_all()? {
            let Some(location) = record.location.as_mut() else {
                continue;
            };
            if location.city.is_some() {
                continue;
            }
            match self
                .collaborators
                .resolver
                .nearest_city(location.latitude, location.longitude)
            {
                Some(city) => {
                    location.city = Some(city.name);
                    location.province = Some(city.province);
                    location.distance_to_city = Some(city.distance_km);
                    updated.push(record);
                }
                None => outcome.skipped += 1,
            }
        }

        outcome.updated = self.write_detailed_info_gated(&gate, &updated)?;
        info!(
            "City backfill: {} updated, {} without a nearby city",
            outcome.updated, outcome.skipped
        );
        Ok(outcome)
    }

    /// Wipe every record and setting
    pub fn clear_all_data(&self) -> Result<()> {
        let _gate = self.cache.write_gate()?;
        self.store.clear()?;
        self.cache.clear_cache();
        info!("Catalog cleared");
        Ok(())
    }

    // ---- reads ------------------------------------------------------------

    pub fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.get(id))
    }

    pub fn all_images(&self) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.records())
    }

    pub fn images_by_category(&self, category: Category) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.get_images_by_category(category))
    }

    pub fn images_by_city(&self, city: &str) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.get_images_by_city(city))
    }

    pub fn category_counts(&self) -> Result<BTreeMap<Category, usize>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.category_counts())
    }

    pub fn city_counts(&self) -> Result<BTreeMap<String, usize>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.city_counts())
    }

    /// Most recent images, newest first
    pub fn recent_images(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.recent_images(limit))
    }

    pub fn recent_by_category(&self, category: Category, limit: usize) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.recent_by_category(category, limit))
    }

    pub fn recent_by_city(&self, city: &str, limit: usize) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.recent_by_city(city, limit))
    }

    pub fn selected_images(&self, filter: &SelectionFilter) -> Result<Vec<ImageRecord>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.selected_images(filter))
    }

    pub fn selection_stats(&self) -> Result<SelectionStats> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.selection_stats())
    }

    pub fn status(&self) -> CacheStatus {
        self.cache.status()
    }

    // ---- selection --------------------------------------------------------

    /// Flip one record's selection; None if the id is unknown
    pub fn toggle_selection(&self, id: &str) -> Result<Option<bool>> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.toggle_image_selection(id))
    }

    pub fn set_selection(&self, ids: &[String], selected: bool) -> Result<usize> {
        self.cache.ensure_loaded()?;
        Ok(self.cache.set_image_selection_batch(ids, selected))
    }

    pub fn clear_selection(&self) -> usize {
        self.cache.clear_selection()
    }

    /// Select every image in a category, returning how many flipped
    pub fn select_by_category(&self, category: Category) -> Result<usize> {
        let ids = ids_of(self.images_by_category(category)?);
        Ok(self.cache.add_to_selection(&ids))
    }

    pub fn select_by_city(&self, city: &str) -> Result<usize> {
        let ids = ids_of(self.images_by_city(city)?);
        Ok(self.cache.add_to_selection(&ids))
    }

    pub fn clear_category_selection(&self, category: Category) -> Result<usize> {
        let ids = ids_of(self.images_by_category(category)?);
        Ok(self.cache.deselect_batch(&ids))
    }

    pub fn deselect_by_city(&self, city: &str) -> Result<usize> {
        let ids = ids_of(self.images_by_city(city)?);
        Ok(self.cache.deselect_batch(&ids))
    }

    // ---- listeners --------------------------------------------------------

    pub fn subscribe_structural(
        &self,
        callback: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.cache.subscribe_structural(callback)
    }

    pub fn unsubscribe_structural(&self, id: ListenerId) -> bool {
        self.cache.unsubscribe_structural(id)
    }

    pub fn subscribe_selection(
        &self,
        callback: impl Fn(&SelectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.cache.subscribe_selection(callback)
    }

    pub fn unsubscribe_selection(&self, id: ListenerId) -> bool {
        self.cache.unsubscribe_selection(id)
    }
}

fn rebuild_unless(gate: &WriteGate<'_>, applied: bool, what: &str) -> Result<()> {
    if !applied {
        debug!("Precise cache update failed for {}, rebuilding", what);
        gate.rebuild()?;
    }
    Ok(())
}

fn ids_of(records: Vec<ImageRecord>) -> Vec<String> {
    records.into_iter().map(|r| r.id).collect()
}
