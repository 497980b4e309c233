//! In-memory catalog index mirrored from the record store
//!
//! `CacheIndex` holds every record plus the aggregates the gallery reads
//! all the time: per-category and per-city counts, the recent list, and the
//! selection with its own incrementally maintained counts. All state sits
//! behind one `RwLock`; listeners are called after the lock is released.

use chrono::{DateTime, Local, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::db::RecordStore;
use crate::error::{Result, ScanError};
use crate::models::{Category, Confidence, ImageRecord};

/// Handle returned by `subscribe_*`, used to unsubscribe
pub type ListenerId = u64;

/// Structural change to the cached records
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Rebuilt { total: usize },
    Added { id: String },
    Updated { ids: Vec<String> },
    Removed { ids: Vec<String> },
    Cleared,
}

/// Selection change
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionEvent {
    /// Records whose flag actually flipped
    pub ids: Vec<String>,
    pub selected: bool,
    /// Selected records after the change
    pub selected_total: usize,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks that can be added and removed by id
struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Listeners<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, callback: Callback<T>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((id, callback));
        }
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.entries.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|(entry, _)| *entry != id);
                entries.len() != before
            }
            Err(_) => false,
        }
    }

    fn notify(&self, event: &T) {
        // Snapshot so a callback may subscribe or unsubscribe
        let callbacks: Vec<Callback<T>> = match self.entries.lock() {
            Ok(entries) => entries.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Optional filter for selection queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionFilter {
    pub category: Option<Category>,
    pub city: Option<String>,
}

impl SelectionFilter {
    fn matches(&self, record: &ImageRecord) -> bool {
        self.category
            .map_or(true, |c| record.effective_category() == c)
            && self
                .city
                .as_deref()
                .map_or(true, |city| record.city() == Some(city))
    }
}

/// Summary of the current selection
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SelectionStats {
    pub total: usize,
    pub total_size: u64,
    pub by_category: BTreeMap<Category, usize>,
    pub by_city: BTreeMap<String, usize>,
    /// Local calendar day (YYYY-MM-DD) of capture or file time
    pub by_day: BTreeMap<String, usize>,
}

/// Load state of the cache
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStatus {
    pub loaded: bool,
    pub records: usize,
    pub selected: usize,
    /// Completed full builds since startup
    pub builds: u64,
    pub last_built: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CacheState {
    records: Vec<ImageRecord>,
    id_to_position: HashMap<String, usize>,
    category_counts: BTreeMap<Category, usize>,
    city_counts: BTreeMap<String, usize>,
    selected_category_counts: BTreeMap<Category, usize>,
    selected_city_counts: BTreeMap<String, usize>,
    /// Ids ordered newest first
    recent: Vec<String>,
    loaded: bool,
    last_built: Option<DateTime<Utc>>,
}

fn inc<K: Ord>(map: &mut BTreeMap<K, usize>, key: K) {
    *map.entry(key).or_insert(0) += 1;
}

fn dec<K: Ord>(map: &mut BTreeMap<K, usize>, key: &K) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

impl CacheState {
    fn rebuild_index(&mut self) {
        self.id_to_position = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
    }

    fn rebuild_category_counts(&mut self) {
        self.category_counts.clear();
        for record in &self.records {
            inc(&mut self.category_counts, record.effective_category());
        }
    }

    fn rebuild_city_counts(&mut self) {
        self.city_counts.clear();
        for record in &self.records {
            if let Some(city) = record.city() {
                inc(&mut self.city_counts, city.to_string());
            }
        }
    }

    fn rebuild_selected_counts(&mut self) {
        self.selected_category_counts.clear();
        self.selected_city_counts.clear();
        for record in self.records.iter().filter(|r| r.selected) {
            inc(&mut self.selected_category_counts, record.effective_category());
            if let Some(city) = record.city() {
                inc(&mut self.selected_city_counts, city.to_string());
            }
        }
    }

    fn rebuild_recent(&mut self, limit: usize) {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        order.sort_by_key(|&i| Reverse(self.records[i].sort_time()));
        self.recent = order
            .into_iter()
            .take(limit)
            .map(|i| self.records[i].id.clone())
            .collect();
    }

    fn rebuild_all(&mut self, recent_limit: usize) {
        self.rebuild_index();
        self.rebuild_category_counts();
        self.rebuild_city_counts();
        self.rebuild_selected_counts();
        self.rebuild_recent(recent_limit);
    }

    fn sort_time_of(&self, id: &str) -> Option<i64> {
        self.id_to_position
            .get(id)
            .map(|&pos| self.records[pos].sort_time())
    }

    /// Insert one id into the recent list, keeping it sorted and bounded
    fn extend_recent(&mut self, id: &str, time: i64, limit: usize) {
        let at = self
            .recent
            .iter()
            .position(|other| self.sort_time_of(other).is_some_and(|t| t < time))
            .unwrap_or(self.recent.len());
        if at < limit {
            self.recent.insert(at, id.to_string());
            self.recent.truncate(limit);
        }
    }

    /// Flip one record's flag and adjust only its selected aggregates
    fn apply_selection(&mut self, pos: usize, selected: bool) -> bool {
        let record = &mut self.records[pos];
        if record.selected == selected {
            return false;
        }
        record.selected = selected;

        let category = record.effective_category();
        let city = record.city().map(str::to_string);
        if selected {
            inc(&mut self.selected_category_counts, category);
            if let Some(city) = city {
                inc(&mut self.selected_city_counts, city);
            }
        } else {
            dec(&mut self.selected_category_counts, &category);
            if let Some(city) = city {
                dec(&mut self.selected_city_counts, &city);
            }
        }
        true
    }

    fn selected_total(&self) -> usize {
        self.selected_category_counts.values().sum()
    }

    fn lookup(&self, id: &str) -> Option<&ImageRecord> {
        self.id_to_position.get(id).map(|&pos| &self.records[pos])
    }
}

/// Exclusive hold on cache builds
///
/// A writer takes the gate before touching the store and keeps it until the
/// cache reflects the write, so no rebuild or other gated write can land in
/// between. Listeners fired during a gated write run with the gate held:
/// they may read the cache but must not build it or write through it.
pub struct WriteGate<'a> {
    cache: &'a CacheIndex,
    _guard: MutexGuard<'a, ()>,
}

impl WriteGate<'_> {
    /// Full build from the store, without releasing the gate
    pub fn rebuild(&self) -> Result<()> {
        self.cache.rebuild_locked()
    }
}

/// In-memory mirror of the record store
pub struct CacheIndex {
    store: Arc<dyn RecordStore>,
    recent_limit: usize,
    state: RwLock<CacheState>,
    build_gate: Mutex<()>,
    builds: AtomicU64,
    structural: Listeners<CacheEvent>,
    selection: Listeners<SelectionEvent>,
}

impl CacheIndex {
    pub fn new(store: Arc<dyn RecordStore>, recent_limit: usize) -> Self {
        Self {
            store,
            recent_limit,
            state: RwLock::new(CacheState::default()),
            build_gate: Mutex::new(()),
            builds: AtomicU64::new(0),
            structural: Listeners::new(),
            selection: Listeners::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    // ---- building ------------------------------------------------------

    /// Take the gate shared by builds and synchronized writes
    pub fn write_gate(&self) -> Result<WriteGate<'_>> {
        let guard = self
            .build_gate
            .lock()
            .map_err(|_| ScanError::store_error("Cache build gate poisoned"))?;
        Ok(WriteGate {
            cache: self,
            _guard: guard,
        })
    }

    /// Load everything from the store
    ///
    /// Concurrent callers share one build: a caller that had to wait for a
    /// build in progress returns once that build is done.
    pub fn build_cache(&self) -> Result<()> {
        let observed = self.builds.load(Ordering::SeqCst);
        let gate = self.write_gate()?;
        if self.builds.load(Ordering::SeqCst) != observed {
            return Ok(());
        }
        gate.rebuild()
    }

    /// Full build that is guaranteed to start after this call
    pub fn refresh_cache(&self) -> Result<()> {
        self.write_gate()?.rebuild()
    }

    /// Build only if nothing was ever loaded
    pub fn ensure_loaded(&self) -> Result<()> {
        if self.read().loaded {
            return Ok(());
        }
        self.build_cache()
    }

    fn rebuild_locked(&self) -> Result<()> {
        let mut records = self.store.get_all()?;

        let (total, dropped, selected_total) = {
            let mut state = self.write();
            let mut selected: HashSet<String> = state
                .records
                .iter()
                .filter(|r| r.selected)
                .map(|r| r.id.clone())
                .collect();
            for record in &mut records {
                record.selected = selected.remove(&record.id);
            }

            state.records = records;
            state.rebuild_all(self.recent_limit);
            state.loaded = true;
            state.last_built = Some(Utc::now());
            let mut dropped: Vec<String> = selected.into_iter().collect();
            dropped.sort();
            (state.records.len(), dropped, state.selected_total())
        };

        self.builds.fetch_add(1, Ordering::SeqCst);
        log::debug!("Cache rebuilt with {} records", total);
        self.structural.notify(&CacheEvent::Rebuilt { total });
        self.notify_selection(dropped, false, selected_total);
        Ok(())
    }

    fn notify_selection(&self, ids: Vec<String>, selected: bool, selected_total: usize) {
        if ids.is_empty() {
            return;
        }
        self.selection.notify(&SelectionEvent {
            ids,
            selected,
            selected_total,
        });
    }

    /// Drop every cached record; the next read reloads from the store
    pub fn clear_cache(&self) {
        *self.write() = CacheState::default();
        self.structural.notify(&CacheEvent::Cleared);
    }

    // ---- structural updates -------------------------------------------

    /// Append one record; returns false if its id is already cached
    pub fn add_image_to_cache(&self, record: ImageRecord) -> bool {
        let id = record.id.clone();
        {
            let mut state = self.write();
            if state.id_to_position.contains_key(&id) {
                return false;
            }

            let time = record.sort_time();
            inc(&mut state.category_counts, record.effective_category());
            if let Some(city) = record.city() {
                inc(&mut state.city_counts, city.to_string());
            }
            if record.selected {
                inc(&mut state.selected_category_counts, record.effective_category());
                if let Some(city) = record.city() {
                    inc(&mut state.selected_city_counts, city.to_string());
                }
            }

            let pos = state.records.len();
            state.records.push(record);
            state.id_to_position.insert(id.clone(), pos);
            state.extend_recent(&id, time, self.recent_limit);
        }
        self.structural.notify(&CacheEvent::Added { id });
        true
    }

    /// Apply a manual recategorization written at `at`
    ///
    /// Returns false if the id is not cached.
    pub fn update_image_classification(
        &self,
        id: &str,
        category: Category,
        at: DateTime<Utc>,
    ) -> bool {
        let (moved, selected_total) = {
            let mut state = self.write();
            let Some(&pos) = state.id_to_position.get(id) else {
                return false;
            };

            let record = &mut state.records[pos];
            let old = record.effective_category();
            let moved = record.selected && old != category;
            record.category = Some(category);
            record.confidence = Confidence::MANUAL;
            record.updated_at = at;

            state.rebuild_category_counts();
            if moved {
                dec(&mut state.selected_category_counts, &old);
                inc(&mut state.selected_category_counts, category);
            }
            (moved, state.selected_total())
        };
        self.structural.notify(&CacheEvent::Updated {
            ids: vec![id.to_string()],
        });
        if moved {
            self.notify_selection(vec![id.to_string()], true, selected_total);
        }
        true
    }

    /// Swap in new versions of cached records, keeping their selection
    ///
    /// Returns false without changing anything if any id is not cached.
    pub fn replace_records(&self, records: &[ImageRecord]) -> bool {
        if records.is_empty() {
            return true;
        }
        let (regrouped, selected_total) = {
            let mut state = self.write();
            if records
                .iter()
                .any(|r| !state.id_to_position.contains_key(&r.id))
            {
                return false;
            }
            let mut regrouped = Vec::new();
            for record in records {
                let pos = state.id_to_position[&record.id];
                let old = &state.records[pos];
                let selected = old.selected;
                if selected
                    && (old.effective_category() != record.effective_category()
                        || old.city() != record.city())
                {
                    regrouped.push(record.id.clone());
                }
                state.records[pos] = ImageRecord {
                    selected,
                    ..record.clone()
                };
            }
            state.rebuild_category_counts();
            state.rebuild_city_counts();
            state.rebuild_selected_counts();
            state.rebuild_recent(self.recent_limit);
            (regrouped, state.selected_total())
        };
        self.structural.notify(&CacheEvent::Updated {
            ids: records.iter().map(|r| r.id.clone()).collect(),
        });
        self.notify_selection(regrouped, true, selected_total);
        true
    }

    /// Remove one record; returns false if it was not cached
    pub fn remove_image(&self, id: &str) -> bool {
        self.remove_images(&[id.to_string()]) == 1
    }

    /// Remove records by id, returning how many were cached
    pub fn remove_images(&self, ids: &[String]) -> usize {
        let (removed, deselected, selected_total) = {
            let mut state = self.write();
            let doomed: HashSet<&str> = ids
                .iter()
                .map(String::as_str)
                .filter(|id| state.id_to_position.contains_key(*id))
                .collect();
            if doomed.is_empty() {
                return 0;
            }

            let mut deselected = Vec::new();
            for id in &doomed {
                let pos = state.id_to_position[*id];
                if state.apply_selection(pos, false) {
                    deselected.push(id.to_string());
                }
            }

            let doomed: HashSet<String> = doomed.into_iter().map(str::to_string).collect();
            state.records.retain(|r| !doomed.contains(&r.id));
            state.rebuild_index();
            state.rebuild_category_counts();
            state.rebuild_city_counts();
            state.rebuild_recent(self.recent_limit);
            (
                doomed.into_iter().collect::<Vec<String>>(),
                deselected,
                state.selected_total(),
            )
        };

        let count = removed.len();
        self.structural
            .notify(&CacheEvent::Removed { ids: removed });
        self.notify_selection(deselected, false, selected_total);
        count
    }

    // ---- reads ----------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        self.read().lookup(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().id_to_position.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Every cached record in insertion order
    pub fn records(&self) -> Vec<ImageRecord> {
        self.read().records.clone()
    }

    pub fn get_images_by_category(&self, category: Category) -> Vec<ImageRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.effective_category() == category)
            .cloned()
            .collect()
    }

    pub fn get_images_by_city(&self, city: &str) -> Vec<ImageRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.city() == Some(city))
            .cloned()
            .collect()
    }

    pub fn category_counts(&self) -> BTreeMap<Category, usize> {
        self.read().category_counts.clone()
    }

    pub fn city_counts(&self) -> BTreeMap<String, usize> {
        self.read().city_counts.clone()
    }

    pub fn selected_category_counts(&self) -> BTreeMap<Category, usize> {
        self.read().selected_category_counts.clone()
    }

    pub fn selected_city_counts(&self) -> BTreeMap<String, usize> {
        self.read().selected_city_counts.clone()
    }

    /// Newest records first, at most `min(limit, recent_limit)`
    pub fn recent_images(&self, limit: usize) -> Vec<ImageRecord> {
        let state = self.read();
        state
            .recent
            .iter()
            .take(limit)
            .filter_map(|id| state.lookup(id).cloned())
            .collect()
    }

    /// Newest records of one category
    pub fn recent_by_category(&self, category: Category, limit: usize) -> Vec<ImageRecord> {
        self.recent_matching(limit, |r| r.effective_category() == category)
    }

    /// Newest records taken in one city
    pub fn recent_by_city(&self, city: &str, limit: usize) -> Vec<ImageRecord> {
        self.recent_matching(limit, |r| r.city() == Some(city))
    }

    fn recent_matching(&self, limit: usize, keep: impl Fn(&ImageRecord) -> bool) -> Vec<ImageRecord> {
        let state = self.read();
        let mut matching: Vec<&ImageRecord> = state.records.iter().filter(|r| keep(r)).collect();
        matching.sort_by_key(|r| Reverse(r.sort_time()));
        matching.into_iter().take(limit).cloned().collect()
    }

    // ---- selection ------------------------------------------------------

    /// Flip one record's selection; returns the new state
    pub fn toggle_image_selection(&self, id: &str) -> Option<bool> {
        let (selected, total) = {
            let mut state = self.write();
            let pos = *state.id_to_position.get(id)?;
            let selected = !state.records[pos].selected;
            state.apply_selection(pos, selected);
            (selected, state.selected_total())
        };
        self.selection.notify(&SelectionEvent {
            ids: vec![id.to_string()],
            selected,
            selected_total: total,
        });
        Some(selected)
    }

    /// Set one record's selection; returns false if it is not cached
    pub fn set_image_selection(&self, id: &str, selected: bool) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.set_image_selection_batch(&[id.to_string()], selected);
        true
    }

    /// Set the selection of many records; returns how many flipped
    pub fn set_image_selection_batch(&self, ids: &[String], selected: bool) -> usize {
        let (changed, total) = {
            let mut state = self.write();
            let mut changed = Vec::new();
            for id in ids {
                if let Some(&pos) = state.id_to_position.get(id) {
                    if state.apply_selection(pos, selected) {
                        changed.push(id.clone());
                    }
                }
            }
            (changed, state.selected_total())
        };

        let count = changed.len();
        if count > 0 {
            self.selection.notify(&SelectionEvent {
                ids: changed,
                selected,
                selected_total: total,
            });
        }
        count
    }

    pub fn add_to_selection(&self, ids: &[String]) -> usize {
        self.set_image_selection_batch(ids, true)
    }

    pub fn deselect_batch(&self, ids: &[String]) -> usize {
        self.set_image_selection_batch(ids, false)
    }

    /// Deselect everything; returns how many were selected
    pub fn clear_selection(&self) -> usize {
        let ids: Vec<String> = self
            .read()
            .records
            .iter()
            .filter(|r| r.selected)
            .map(|r| r.id.clone())
            .collect();
        self.deselect_batch(&ids)
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.read().lookup(id).is_some_and(|r| r.selected)
    }

    pub fn selected_count(&self) -> usize {
        self.read().selected_total()
    }

    pub fn selected_images(&self, filter: &SelectionFilter) -> Vec<ImageRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.selected && filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn selection_stats(&self) -> SelectionStats {
        let state = self.read();
        let mut stats = SelectionStats {
            by_category: state.selected_category_counts.clone(),
            by_city: state.selected_city_counts.clone(),
            ..Default::default()
        };
        for record in state.records.iter().filter(|r| r.selected) {
            stats.total += 1;
            stats.total_size += record.size;
            if let Some(day) = DateTime::from_timestamp_millis(record.sort_time()) {
                let day = day.with_timezone(&Local).format("%Y-%m-%d").to_string();
                inc(&mut stats.by_day, day);
            }
        }
        stats
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.read();
        CacheStatus {
            loaded: state.loaded,
            records: state.records.len(),
            selected: state.selected_total(),
            builds: self.builds.load(Ordering::SeqCst),
            last_built: state.last_built,
        }
    }

    // ---- listeners ------------------------------------------------------

    pub fn subscribe_structural(
        &self,
        callback: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.structural.subscribe(Arc::new(callback))
    }

    pub fn unsubscribe_structural(&self, id: ListenerId) -> bool {
        self.structural.unsubscribe(id)
    }

    pub fn subscribe_selection(
        &self,
        callback: impl Fn(&SelectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.selection.subscribe(Arc::new(callback))
    }

    pub fn unsubscribe_selection(&self, id: ListenerId) -> bool {
        self.selection.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Location;
    use crate::testutil::{record, FlakyStore};
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::time::Duration;

    fn located(name: &str, time: i64, category: Category, city: &str) -> ImageRecord {
        let mut r = record(name, time);
        r.category = Some(category);
        r.location = Some(Location {
            latitude: 30.0,
            longitude: 120.0,
            city: Some(city.to_string()),
            ..Default::default()
        });
        r
    }

    fn cache_with(records: &[ImageRecord]) -> (Arc<FlakyStore>, CacheIndex) {
        let store = Arc::new(FlakyStore::new());
        store.batch_upsert(records).unwrap();
        let cache = CacheIndex::new(store.clone(), 20);
        cache.build_cache().unwrap();
        (store, cache)
    }

    /// Every aggregate must equal a from-scratch recomputation
    fn assert_consistent(cache: &CacheIndex) {
        let state = cache.read();
        assert_eq!(state.id_to_position.len(), state.records.len());
        for (i, r) in state.records.iter().enumerate() {
            assert_eq!(state.id_to_position[&r.id], i);
        }

        assert_eq!(state.category_counts.values().sum::<usize>(), state.records.len());
        let mut expected = BTreeMap::new();
        let mut expected_city = BTreeMap::new();
        for r in state.records.iter().filter(|r| r.selected) {
            inc(&mut expected, r.effective_category());
            if let Some(c) = r.city() {
                inc(&mut expected_city, c.to_string());
            }
        }
        assert_eq!(state.selected_category_counts, expected);
        assert_eq!(state.selected_city_counts, expected_city);
    }

    #[test]
    fn test_build_counts_and_recent() {
        let records = vec![
            located("a.jpg", 1_000, Category::Food, "杭州"),
            located("b.jpg", 3_000, Category::Food, "上海"),
            record("c.jpg", 2_000),
        ];
        let (_, cache) = cache_with(&records);

        assert_eq!(cache.len(), 3);
        let counts = cache.category_counts();
        assert_eq!(counts[&Category::Food], 2);
        // Unclassified records count as other
        assert_eq!(counts[&Category::Other], 1);
        assert_eq!(cache.city_counts()["杭州"], 1);

        let recent: Vec<String> = cache.recent_images(20).into_iter().map(|r| r.file_name).collect();
        assert_eq!(recent, vec!["b.jpg", "c.jpg", "a.jpg"]);
        assert_eq!(cache.recent_by_city("杭州", 5).len(), 1);
        assert_eq!(cache.recent_by_category(Category::Food, 1)[0].file_name, "b.jpg");
        assert_consistent(&cache);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let records: Vec<ImageRecord> = (0..30).map(|i| record(&format!("{}.jpg", i), i)).collect();
        let (_, cache) = cache_with(&records);
        let first = (cache.records(), cache.category_counts(), cache.recent_images(20));
        cache.refresh_cache().unwrap();
        let second = (cache.records(), cache.category_counts(), cache.recent_images(20));
        assert_eq!(first, second);
        assert_eq!(cache.recent_images(100).len(), 20);
    }

    #[test]
    fn test_add_is_noop_for_known_id() {
        let a = record("a.jpg", 1);
        let (_, cache) = cache_with(&[a.clone()]);
        assert!(!cache.add_image_to_cache(a));
        assert_eq!(cache.len(), 1);

        let b = record("b.jpg", 5);
        assert!(cache.add_image_to_cache(b));
        assert_eq!(cache.recent_images(1)[0].file_name, "b.jpg");
        assert_consistent(&cache);
    }

    #[test]
    fn test_incremental_recent_matches_full_recompute() {
        let (_, cache) = cache_with(&[]);
        for (i, t) in [5, 1, 9, 9, 3, 7, 0, 12].iter().enumerate() {
            cache.add_image_to_cache(record(&format!("{}.jpg", i), *t));
        }
        let incremental: Vec<String> = cache.recent_images(20).into_iter().map(|r| r.id).collect();
        cache.write().rebuild_recent(20);
        let full: Vec<String> = cache.recent_images(20).into_iter().map(|r| r.id).collect();
        assert_eq!(incremental, full);
    }

    #[test]
    fn test_index_stays_in_sync_after_removals() {
        let records: Vec<ImageRecord> = (0..10).map(|i| record(&format!("{}.jpg", i), i)).collect();
        let (_, cache) = cache_with(&records);

        assert!(cache.remove_image(&records[3].id));
        assert!(!cache.remove_image(&records[3].id));
        assert_eq!(
            cache.remove_images(&[records[0].id.clone(), records[9].id.clone(), "img_x".into()]),
            2
        );

        assert_eq!(cache.len(), 7);
        for r in &records[4..9] {
            assert_eq!(cache.get(&r.id).map(|c| c.file_name), Some(r.file_name.clone()));
        }
        assert_consistent(&cache);
    }

    #[test]
    fn test_selection_changes_one_aggregate_entry() {
        let records = vec![
            located("a.jpg", 1, Category::Food, "杭州"),
            located("b.jpg", 2, Category::Pet, "杭州"),
            located("c.jpg", 3, Category::Pet, "上海"),
        ];
        let (_, cache) = cache_with(&records);

        let before_cat = cache.selected_category_counts();
        let before_city = cache.selected_city_counts();
        assert_eq!(cache.toggle_image_selection(&records[1].id), Some(true));

        let after_cat = cache.selected_category_counts();
        let after_city = cache.selected_city_counts();
        assert_eq!(after_cat.get(&Category::Pet), Some(&1));
        assert_eq!(after_cat.len(), before_cat.len() + 1);
        assert_eq!(after_city.get("杭州"), Some(&1));
        assert_eq!(after_city.len(), before_city.len() + 1);

        assert_eq!(cache.toggle_image_selection(&records[1].id), Some(false));
        assert_eq!(cache.selected_category_counts(), before_cat);
        assert_eq!(cache.selected_city_counts(), before_city);
        assert_eq!(cache.toggle_image_selection("img_missing"), None);
    }

    #[test]
    fn test_reclassify_moves_selected_count() {
        let a = located("a.jpg", 1, Category::Food, "杭州");
        let (_, cache) = cache_with(&[a.clone()]);
        cache.set_image_selection(&a.id, true);

        assert!(cache.update_image_classification(&a.id, Category::Travel, Utc::now()));
        let updated = cache.get(&a.id).unwrap();
        assert_eq!(updated.category, Some(Category::Travel));
        assert!(updated.confidence.is_manual());
        assert_eq!(cache.selected_category_counts().get(&Category::Travel), Some(&1));
        assert_eq!(cache.selected_category_counts().get(&Category::Food), None);
        assert!(!cache.update_image_classification("img_missing", Category::Pet, Utc::now()));
        assert_consistent(&cache);
    }

    #[test]
    fn test_removing_selected_record_decrements_selection() {
        let a = located("a.jpg", 1, Category::Food, "杭州");
        let b = located("b.jpg", 2, Category::Food, "杭州");
        let (_, cache) = cache_with(&[a.clone(), b.clone()]);
        cache.add_to_selection(&[a.id.clone(), b.id.clone()]);
        assert_eq!(cache.selected_count(), 2);

        cache.remove_image(&a.id);
        assert_eq!(cache.selected_count(), 1);
        assert_eq!(cache.selected_city_counts()["杭州"], 1);
        assert_consistent(&cache);
    }

    #[test]
    fn test_selection_survives_rebuild() {
        let a = record("a.jpg", 1);
        let b = record("b.jpg", 2);
        let (store, cache) = cache_with(&[a.clone(), b.clone()]);
        cache.add_to_selection(&[a.id.clone(), b.id.clone()]);

        store.delete_by_ids(&[b.id.clone()]).unwrap();
        cache.refresh_cache().unwrap();

        assert!(cache.is_selected(&a.id));
        assert_eq!(cache.selected_count(), 1);
        assert_consistent(&cache);
    }

    fn record_selection_events(cache: &CacheIndex) -> Arc<Mutex<Vec<SelectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        cache.subscribe_selection(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn test_removing_selected_record_notifies_selection() {
        let a = record("a.jpg", 1);
        let b = record("b.jpg", 2);
        let (_, cache) = cache_with(&[a.clone(), b.clone()]);
        cache.set_image_selection(&a.id, true);
        let events = record_selection_events(&cache);

        cache.remove_image(&b.id);
        assert!(events.lock().unwrap().is_empty());

        assert!(cache.remove_image(&a.id));
        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![SelectionEvent {
                ids: vec![a.id.clone()],
                selected: false,
                selected_total: 0,
            }]
        );
    }

    #[test]
    fn test_reclassifying_selected_record_notifies_selection() {
        let a = located("a.jpg", 1, Category::Food, "杭州");
        let b = located("b.jpg", 2, Category::Food, "杭州");
        let (_, cache) = cache_with(&[a.clone(), b.clone()]);
        cache.set_image_selection(&a.id, true);
        let events = record_selection_events(&cache);

        cache.update_image_classification(&b.id, Category::Pet, Utc::now());
        cache.update_image_classification(&a.id, Category::Food, Utc::now());
        assert!(events.lock().unwrap().is_empty());

        cache.update_image_classification(&a.id, Category::Travel, Utc::now());
        let mut moved = located("a.jpg", 1, Category::Travel, "上海");
        moved.confidence = Confidence::MANUAL;
        assert!(cache.replace_records(&[moved]));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.ids == vec![a.id.clone()] && e.selected));
        assert_eq!(events[1].selected_total, 1);
        assert_eq!(cache.selected_city_counts().get("上海"), Some(&1));
    }

    #[test]
    fn test_rebuild_reports_vanished_selection() {
        let a = record("a.jpg", 1);
        let b = record("b.jpg", 2);
        let (store, cache) = cache_with(&[a.clone(), b.clone()]);
        cache.add_to_selection(&[a.id.clone(), b.id.clone()]);
        let events = record_selection_events(&cache);

        cache.refresh_cache().unwrap();
        assert!(events.lock().unwrap().is_empty());

        store.delete_by_ids(&[b.id.clone()]).unwrap();
        cache.refresh_cache().unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ids, vec![b.id.clone()]);
        assert!(!events[0].selected);
        assert_eq!(events[0].selected_total, 1);
    }

    #[test]
    fn test_write_gate_holds_off_rebuilds() {
        let (_, cache) = cache_with(&[record("a.jpg", 1)]);
        let builds = cache.status().builds;

        std::thread::scope(|s| {
            let gate = cache.write_gate().unwrap();
            let waiter = s.spawn(|| cache.refresh_cache().unwrap());
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(cache.status().builds, builds);

            gate.rebuild().unwrap();
            assert_eq!(cache.status().builds, builds + 1);
            drop(gate);
            waiter.join().unwrap();
        });
        assert_eq!(cache.status().builds, builds + 2);
    }

    #[test]
    fn test_selection_queries_and_stats() {
        let a = located("a.jpg", 1, Category::Food, "杭州");
        let b = located("b.jpg", 2, Category::Pet, "上海");
        let c = record("c.jpg", 3);
        let (_, cache) = cache_with(&[a.clone(), b.clone(), c.clone()]);
        cache.add_to_selection(&[a.id.clone(), b.id.clone(), c.id.clone()]);
        assert_eq!(cache.deselect_batch(&[c.id.clone()]), 1);

        let food = cache.selected_images(&SelectionFilter {
            category: Some(Category::Food),
            city: None,
        });
        assert_eq!(food.len(), 1);
        let shanghai = cache.selected_images(&SelectionFilter {
            category: None,
            city: Some("上海".to_string()),
        });
        assert_eq!(shanghai[0].id, b.id);

        let stats = cache.selection_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.total_size, 2000);
        assert_eq!(stats.by_day.values().sum::<usize>(), 2);

        assert_eq!(cache.clear_selection(), 2);
        assert_eq!(cache.selected_count(), 0);
    }

    #[test]
    fn test_listeners_are_separate_and_unsubscribable() {
        let a = record("a.jpg", 1);
        let (_, cache) = cache_with(&[a.clone()]);
        let structural = Arc::new(Mutex::new(Vec::new()));
        let selection = Arc::new(AtomicU64::new(0));

        let sink = structural.clone();
        let s_id = cache.subscribe_structural(move |e| sink.lock().unwrap().push(e.clone()));
        let counter = selection.clone();
        cache.subscribe_selection(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.toggle_image_selection(&a.id);
        cache.add_image_to_cache(record("b.jpg", 2));
        assert_eq!(selection.load(Ordering::SeqCst), 1);
        assert_eq!(structural.lock().unwrap().len(), 1);

        assert!(cache.unsubscribe_structural(s_id));
        assert!(!cache.unsubscribe_structural(s_id));
        cache.refresh_cache().unwrap();
        assert_eq!(structural.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listener_can_read_cache() {
        let store = Arc::new(FlakyStore::new());
        let cache = Arc::new(CacheIndex::new(store, 20));
        let seen = Arc::new(AtomicU64::new(0));

        let reader = Arc::downgrade(&cache);
        let sink = seen.clone();
        cache.subscribe_structural(move |_| {
            if let Some(cache) = reader.upgrade() {
                sink.store(cache.len() as u64, Ordering::SeqCst);
            }
        });
        cache.add_image_to_cache(record("a.jpg", 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_builds_share_one_load() {
        let store = Arc::new(FlakyStore::new().with_delay(Duration::from_millis(100)));
        store.batch_upsert(&[record("a.jpg", 1)]).unwrap();
        let cache = CacheIndex::new(store.clone(), 20);
        let barrier = Barrier::new(4);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    cache.build_cache().unwrap();
                });
            }
        });

        assert!(store.get_all_calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.status().loaded);
    }

    #[test]
    fn test_ensure_loaded_builds_once() {
        let (store, cache) = cache_with(&[record("a.jpg", 1)]);
        let calls = store.get_all_calls.load(Ordering::SeqCst);
        cache.ensure_loaded().unwrap();
        assert_eq!(store.get_all_calls.load(Ordering::SeqCst), calls);

        cache.clear_cache();
        assert!(!cache.status().loaded);
        cache.ensure_loaded().unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
        RemoveMany(Vec<usize>),
        Toggle(usize),
        Reclassify(usize, usize),
        Replace(usize, usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..12usize).prop_map(Op::Add),
            (0..12usize).prop_map(Op::Remove),
            prop::collection::vec(0..12usize, 0..4).prop_map(Op::RemoveMany),
            (0..12usize).prop_map(Op::Toggle),
            (0..12usize, 0..10usize).prop_map(|(i, c)| Op::Reclassify(i, c)),
            (0..12usize, 0..3usize).prop_map(|(i, c)| Op::Replace(i, c)),
        ]
    }

    proptest! {
        #[test]
        fn test_aggregates_hold_after_any_sequence(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let cities = ["杭州", "上海", "北京"];
            let pool: Vec<ImageRecord> = (0..12)
                .map(|i| {
                    let category = Category::ALL[i % Category::ALL.len()];
                    if i % 3 == 0 {
                        record(&format!("{}.jpg", i), i as i64)
                    } else {
                        located(&format!("{}.jpg", i), i as i64, category, cities[i % 3])
                    }
                })
                .collect();
            let (_, cache) = cache_with(&pool[..6]);

            for op in ops {
                match op {
                    Op::Add(i) => { cache.add_image_to_cache(pool[i].clone()); }
                    Op::Remove(i) => { cache.remove_image(&pool[i].id); }
                    Op::RemoveMany(is) => {
                        let ids: Vec<String> = is.iter().map(|&i| pool[i].id.clone()).collect();
                        cache.remove_images(&ids);
                    }
                    Op::Toggle(i) => { cache.toggle_image_selection(&pool[i].id); }
                    Op::Reclassify(i, c) => {
                        cache.update_image_classification(&pool[i].id, Category::ALL[c], Utc::now());
                    }
                    Op::Replace(i, c) => {
                        let moved = located(&format!("{}.jpg", i), i as i64, Category::ALL[i % 10], cities[c]);
                        cache.replace_records(&[moved]);
                    }
                }
                assert_consistent(&cache);
            }
        }
    }
}
