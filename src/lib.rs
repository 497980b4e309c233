//! Incremental gallery scanning with a synchronized catalog cache
//!
//! A scan walks the configured roots, diffs what it finds against the
//! durable record store, enriches new images in parallel lanes and finally
//! rebuilds the in-memory `CacheIndex`. All later edits go through
//! `SyncFacade`, which writes the store first and then patches the cache.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod facade;
pub mod location;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod scanner;
pub mod walker;

#[cfg(test)]
mod testutil;

pub use cache::{
    CacheEvent, CacheIndex, CacheStatus, SelectionEvent, SelectionFilter, SelectionStats, WriteGate,
};
pub use classifier::{Classification, Classifier, HeuristicClassifier};
pub use config::{FailurePolicy, ScanConfig};
pub use db::{RecordStore, SqliteRecordStore};
pub use error::{Result, ScanError, ScanErrorKind};
pub use facade::{BackfillOutcome, DeleteMode, DeleteOutcome, SyncFacade};
pub use location::{CityTable, LocationResolver};
pub use metadata::{ExifExtractor, MetadataExtractor};
pub use models::{Category, Confidence, FileEntry, ImageRecord, Location, ScanSummary};
pub use pipeline::Collaborators;
pub use progress::{ScanProgress, ScanStage};
pub use scanner::{run_scan, CancelToken};
