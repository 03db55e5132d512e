//! Filesystem errors.

use owfs_cache::CacheError;
use owfs_common::ErrorKind;
use thiserror::Error;

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum FsError {
    /// The path does not follow the name grammar.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// A path element does not exist.
    #[error("file not found: {path}")]
    NotFound { path: String },

    /// The destination of a create or rename already exists.
    #[error("file already exists: {path}")]
    AlreadyExists { path: String },

    /// Another handle has the file open for writing.
    #[error("file already opened to write: {path}")]
    OpenForWrite { path: String },

    /// The file is marked read-only.
    #[error("file is read only: {path}")]
    ReadOnly { path: String },

    /// The directory still has entries.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    /// A file operation named a directory.
    #[error("not a file: {path}")]
    NotAFile { path: String },

    /// A directory operation named a file.
    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    /// The handle was closed.
    #[error("file descriptor is closed")]
    Closed,

    /// The handle has not been opened or created.
    #[error("file not open: {path}")]
    NotOpen { path: String },

    /// The handle was not created for writing.
    #[error("file not opened to write: {path}")]
    NotOpenForWrite { path: String },

    /// `reset` after reading past the mark limit.
    #[error("file read beyond mark limit of {limit} bytes")]
    MarkExpired { limit: usize },

    /// Two handles on different device groups.
    #[error("source and destination are on different device groups")]
    CrossDevice,

    /// On-media structures failed validation.
    #[error("invalid filesystem: {reason}")]
    Corrupt { reason: String },

    /// No free page was left for an allocation.
    #[error("out of space on 1-Wire device")]
    OutOfSpace,

    /// The device group cannot hold the requested layout.
    #[error("invalid device group: {reason}")]
    InvalidGeometry { reason: String },

    /// Page cache failure.
    #[error("page cache error: {0}")]
    Cache(#[from] CacheError),
}

impl FsError {
    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Creates a not found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates a corruption error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    /// Creates an invalid geometry error.
    pub fn invalid_geometry(reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            reason: reason.into(),
        }
    }

    /// Returns the stable error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. }
            | Self::OpenForWrite { .. }
            | Self::ReadOnly { .. }
            | Self::DirectoryNotEmpty { .. }
            | Self::NotAFile { .. } => ErrorKind::Busy,
            Self::NotADirectory { .. }
            | Self::Closed
            | Self::NotOpen { .. }
            | Self::NotOpenForWrite { .. }
            | Self::MarkExpired { .. } => ErrorKind::InvalidState,
            Self::CrossDevice => ErrorKind::InvalidArgument,
            Self::Corrupt { .. } => ErrorKind::Corruption,
            Self::OutOfSpace => ErrorKind::OutOfSpace,
            Self::InvalidGeometry { .. } => ErrorKind::InvalidGeometry,
            Self::Cache(err) => err.kind(),
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cache(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error indicates damaged media.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        use std::io::ErrorKind as Io;

        let kind = match err.kind() {
            ErrorKind::NotFound => Io::NotFound,
            ErrorKind::Busy => Io::AlreadyExists,
            ErrorKind::InvalidPath | ErrorKind::InvalidArgument => Io::InvalidInput,
            ErrorKind::Corruption | ErrorKind::SyncVerification => Io::InvalidData,
            _ => Io::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owfs_common::PageNumber;

    #[test]
    fn test_kinds() {
        assert_eq!(
            FsError::invalid_path("/ABCDE", "name too long").kind(),
            ErrorKind::InvalidPath
        );
        assert_eq!(FsError::not_found("/A").kind(), ErrorKind::NotFound);
        assert_eq!(
            FsError::DirectoryNotEmpty {
                path: "/SUB".into()
            }
            .kind(),
            ErrorKind::Busy
        );
        assert_eq!(FsError::Closed.kind(), ErrorKind::InvalidState);
        assert_eq!(FsError::OutOfSpace.kind(), ErrorKind::OutOfSpace);
    }

    #[test]
    fn test_cache_errors_pass_through() {
        let err: FsError = CacheError::CrcMismatch {
            page: PageNumber::new(4),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_into_io_error() {
        let err: std::io::Error = FsError::not_found("/A.1").into();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

        let err: std::io::Error = FsError::corrupt("bad marker").into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
