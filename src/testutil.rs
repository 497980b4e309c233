//! Test helpers shared by the cache, facade and scanner tests

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::db::{RecordStore, SqliteRecordStore};
use crate::error::{Result, ScanError};
use crate::models::{path_to_uri, FileEntry, ImageRecord};

/// In-memory store that can be told to fail writes or slow down loads
///
/// Delays are applied after the inner call, so a slow load returns data
/// that may already be stale.
pub struct FlakyStore {
    inner: SqliteRecordStore,
    pub fail_writes: AtomicBool,
    pub get_all_calls: AtomicU64,
    pub get_all_delay: Duration,
    upsert_pause: Mutex<Option<Duration>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteRecordStore::open_memory().unwrap(),
            fail_writes: AtomicBool::new(false),
            get_all_calls: AtomicU64::new(0),
            get_all_delay: Duration::ZERO,
            upsert_pause: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.get_all_delay = delay;
        self
    }

    /// Make the next `batch_upsert` stall for `delay` after it commits
    pub fn pause_next_upsert(&self, delay: Duration) {
        *self.upsert_pause.lock().unwrap() = Some(delay);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ScanError::store_error("disk full"));
        }
        Ok(())
    }
}

impl RecordStore for FlakyStore {
    fn all_uris(&self) -> Result<HashSet<String>> {
        self.inner.all_uris()
    }

    fn get_all(&self) -> Result<Vec<ImageRecord>> {
        self.get_all_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.inner.get_all()?;
        if !self.get_all_delay.is_zero() {
            std::thread::sleep(self.get_all_delay);
        }
        Ok(records)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<ImageRecord>> {
        self.inner.get_by_id(id)
    }

    fn batch_upsert(&self, records: &[ImageRecord]) -> Result<usize> {
        self.check_write()?;
        let written = self.inner.batch_upsert(records)?;
        let pause = self.upsert_pause.lock().unwrap().take();
        if let Some(delay) = pause {
            std::thread::sleep(delay);
        }
        Ok(written)
    }

    fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        self.check_write()?;
        self.inner.delete_by_ids(ids)
    }

    fn delete_by_uris(&self, uris: &[String]) -> Result<usize> {
        self.check_write()?;
        self.inner.delete_by_uris(uris)
    }

    fn count(&self) -> Result<u64> {
        self.inner.count()
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_setting(key)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check_write()?;
        self.inner.set_setting(key, value)
    }

    fn clear(&self) -> Result<()> {
        self.check_write()?;
        self.inner.clear()
    }
}

/// A bare record for `/photos/<name>` with the given file time
pub fn record(name: &str, file_time: i64) -> ImageRecord {
    let path = PathBuf::from(format!("/photos/{}", name));
    ImageRecord::from_entry(&FileEntry {
        uri: path_to_uri(&path),
        file_name: name.to_string(),
        size: 1000,
        file_time,
        path,
    })
}
