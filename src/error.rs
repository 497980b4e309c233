//! Error types for the photo catalog

use std::path::PathBuf;
use thiserror::Error;

/// Broad classes of failure, used to decide whether a scan carries on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanErrorKind {
    PermissionDenied,
    /// Missing file, directory, root or record
    NotFound,
    IoError,
    /// The record store rejected a read or write
    StoreError,
    /// EXIF could not be read from one file
    ExtractError,
    /// One image could not be classified
    ClassifyError,
    /// A collaborator is down; fatal for the whole scan
    Unavailable,
    InvalidInput,
    Cancelled,
    Unknown,
}

/// Error raised anywhere in the catalog
#[derive(Debug, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct ScanError {
    pub kind: ScanErrorKind,
    /// File or directory involved, when there is one
    pub path: Option<PathBuf>,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    pub fn new(kind: ScanErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    pub fn record_not_found(id: &str) -> Self {
        Self::new(ScanErrorKind::NotFound, None, format!("No record with id {}", id))
    }

    pub fn io_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::IoError, path, message)
    }

    pub fn store_error(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::StoreError, None, message)
    }

    pub fn extract_error(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::ExtractError, Some(path), message)
    }

    pub fn classify_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::ClassifyError, path, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::Unavailable, None, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::InvalidInput, None, message)
    }

    /// Whether the failure is confined to one file and the scan may go on
    pub fn is_per_item(&self) -> bool {
        matches!(
            self.kind,
            ScanErrorKind::PermissionDenied
                | ScanErrorKind::IoError
                | ScanErrorKind::ExtractError
                | ScanErrorKind::ClassifyError
        )
    }
}

fn kind_of(err: &std::io::Error) -> ScanErrorKind {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => ScanErrorKind::PermissionDenied,
        std::io::ErrorKind::NotFound => ScanErrorKind::NotFound,
        _ => ScanErrorKind::IoError,
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        Self::new(kind_of(&err), None, err.to_string())
    }
}

impl From<walkdir::Error> for ScanError {
    fn from(err: walkdir::Error) -> Self {
        let kind = err.io_error().map_or(ScanErrorKind::IoError, kind_of);
        Self::new(kind, err.path().map(|p| p.to_path_buf()), err.to_string())
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        Self::store_error(err.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        Self::store_error(format!("Record encoding failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: ScanError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind, ScanErrorKind::NotFound);

        let err: ScanError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind, ScanErrorKind::PermissionDenied);
        assert!(err.is_per_item());
    }

    #[test]
    fn test_collaborator_errors_are_not_per_item() {
        assert!(!ScanError::unavailable("classifier offline").is_per_item());
        assert!(!ScanError::store_error("disk full").is_per_item());
        assert!(ScanError::classify_error(None, "bad pixels").is_per_item());
    }
}
