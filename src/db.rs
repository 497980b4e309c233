//! Durable record storage for the catalog
//!
//! `RecordStore` is the seam the scanner, cache and facade talk to.
//! `SqliteRecordStore` keeps one JSON body per record plus a few indexed
//! columns, and a small settings table for scan bookkeeping.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, ScanError};
use crate::models::ImageRecord;

/// Settings key holding the RFC 3339 time of the last completed scan
pub const LAST_SCAN_TIME_KEY: &str = "last_scan_time";

/// Durable key-value persistence for image records
///
/// Implementations must be safe to call from several enrichment lanes at
/// once; each `batch_upsert` is all-or-nothing.
pub trait RecordStore: Send + Sync {
    /// URIs of every stored record
    fn all_uris(&self) -> Result<HashSet<String>>;

    /// Every stored record in insertion order
    fn get_all(&self) -> Result<Vec<ImageRecord>>;

    /// Look up one record by id
    fn get_by_id(&self, id: &str) -> Result<Option<ImageRecord>>;

    /// Insert or overwrite records by id, returning the number written
    fn batch_upsert(&self, records: &[ImageRecord]) -> Result<usize>;

    /// Delete records by id, returning the number removed
    fn delete_by_ids(&self, ids: &[String]) -> Result<usize>;

    /// Delete records by uri, returning the number removed
    fn delete_by_uris(&self, uris: &[String]) -> Result<usize>;

    /// Number of stored records
    fn count(&self) -> Result<u64>;

    /// Read a settings value
    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Write a settings value
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Remove every record and setting
    fn clear(&self) -> Result<()>;
}

/// SQLite-backed record store
///
/// A single connection sits behind a mutex, so concurrent batch writes
/// from different lanes are serialized, one transaction each.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ScanError::store_error("Store connection lock poisoned"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                uri TEXT NOT NULL UNIQUE,
                category TEXT,
                updated_at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_images_category ON images(category);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn delete_by_column(&self, column: &str, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare(&format!("DELETE FROM images WHERE {} = ?1", column))?;
            for key in keys {
                removed += stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

impl RecordStore for SqliteRecordStore {
    fn all_uris(&self) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT uri FROM images")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut uris = HashSet::new();
        for row in rows {
            uris.insert(row?);
        }
        Ok(uris)
    }

    fn get_all(&self) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM images ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM images WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn batch_upsert(&self, records: &[ImageRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        // Encode outside the lock
        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            encoded.push((record, serde_json::to_string(record)?));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            // ON CONFLICT keeps the rowid, so insertion order survives overwrites
            let mut stmt = tx.prepare(
                "INSERT INTO images (id, uri, category, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    uri = excluded.uri,
                    category = excluded.category,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
            )?;

            for (record, body) in &encoded {
                stmt.execute(params![
                    record.id,
                    record.uri,
                    record.category.map(|c| c.as_str()),
                    record.updated_at.to_rfc3339(),
                    body,
                ])?;
            }
        }
        tx.commit()?;
        Ok(encoded.len())
    }

    fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        self.delete_by_column("id", ids)
    }

    fn delete_by_uris(&self, uris: &[String]) -> Result<usize> {
        self.delete_by_column("uri", uris)
    }

    fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.conn()?
            .execute_batch("DELETE FROM images; DELETE FROM settings;")?;
        Ok(())
    }
}
