//! Error types shared across the tree.
//!
//! `CursorError` is the corruption family: it is raised while decoding a page
//! whose bytes cannot be what the reader expects. It is kept apart from I/O
//! failures so callers and the consistency checker can tell a damaged file
//! from a failing disk.

use crate::config::ConfigError;
use crate::latch::LatchError;
use crate::page::{PageId, PageType};
use crate::paged_file::PagedFileError;

/// Corruption detected while reading a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// The page carries a different type tag than the accessor requires.
    UnexpectedPageType {
        page_id: PageId,
        expected: PageType,
        found: u8,
    },
    /// A tree node page with a node type byte that is neither leaf nor internal.
    UnknownNodeType { page_id: PageId, found: u8 },
    /// A key count that cannot fit in the page.
    UnreasonableKeyCount { page_id: PageId, key_count: u32 },
    /// An offload record declaring a negative key or value size.
    NegativeOffloadSize {
        page_id: PageId,
        key_size: i32,
        value_size: i32,
    },
    /// An offload record declaring more bytes than the page holds.
    OffloadSizeOutOfBounds {
        page_id: PageId,
        declared: usize,
        capacity: usize,
    },
    /// Space bookkeeping of a dynamic node points outside the page.
    InvalidNodeSpace { page_id: PageId, message: String },
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedPageType {
                page_id,
                expected,
                found,
            } => write!(
                f,
                "page {page_id}: expected page type {expected:?}, found 0x{found:02x}"
            ),
            Self::UnknownNodeType { page_id, found } => {
                write!(f, "page {page_id}: unknown tree node type 0x{found:02x}")
            }
            Self::UnreasonableKeyCount { page_id, key_count } => {
                write!(f, "page {page_id}: unreasonable key count {key_count}")
            }
            Self::NegativeOffloadSize {
                page_id,
                key_size,
                value_size,
            } => write!(
                f,
                "page {page_id}: negative offload size (key {key_size}, value {value_size})"
            ),
            Self::OffloadSizeOutOfBounds {
                page_id,
                declared,
                capacity,
            } => write!(
                f,
                "page {page_id}: offload record of {declared} bytes exceeds capacity {capacity}"
            ),
            Self::InvalidNodeSpace { page_id, message } => {
                write!(f, "page {page_id}: invalid node space: {message}")
            }
        }
    }
}

impl std::error::Error for CursorError {}

/// Errors returned by tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// I/O error.
    Io(std::io::Error),
    /// Paged file error.
    PagedFile(PagedFileError),
    /// Page content is corrupt.
    Cursor(CursorError),
    /// The caller passed something the tree can never accept.
    IllegalArgument(String),
    /// The call is not allowed in the current state.
    IllegalState(String),
    /// Structural invariant broken at runtime.
    TreeInconsistency(String),
    /// The file was created with a different layout or page size.
    MetadataMismatch(String),
    /// A recovery cleanup job failed.
    Cleanup(Box<TreeError>),
    /// Invalid configuration.
    Config(ConfigError),
}

impl TreeError {
    /// Whether this error signals corrupt page content.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Cursor(_))
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PagedFile(e) => write!(f, "paged file error: {e}"),
            Self::Cursor(e) => write!(f, "corrupt page: {e}"),
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Self::TreeInconsistency(msg) => write!(f, "tree inconsistency: {msg}"),
            Self::MetadataMismatch(msg) => write!(f, "metadata mismatch: {msg}"),
            Self::Cleanup(e) => write!(f, "recovery cleanup failed: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::PagedFile(e) => Some(e),
            Self::Cursor(e) => Some(e),
            Self::Cleanup(e) => Some(e.as_ref()),
            Self::Config(e) => Some(e),
            Self::IllegalArgument(_)
            | Self::IllegalState(_)
            | Self::TreeInconsistency(_)
            | Self::MetadataMismatch(_) => None,
        }
    }
}

impl From<std::io::Error> for TreeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PagedFileError> for TreeError {
    fn from(e: PagedFileError) -> Self {
        match e {
            PagedFileError::Io(io_err) => Self::Io(io_err),
            other => Self::PagedFile(other),
        }
    }
}

impl From<CursorError> for TreeError {
    fn from(e: CursorError) -> Self {
        Self::Cursor(e)
    }
}

impl From<LatchError> for TreeError {
    fn from(e: LatchError) -> Self {
        Self::IllegalState(e.to_string())
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = TreeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_error_is_corruption() {
        let err = TreeError::from(CursorError::UnknownNodeType {
            page_id: 9,
            found: 0x42,
        });
        assert!(err.is_corruption());
        assert!(err.to_string().contains("page 9"));

        let io = TreeError::from(std::io::Error::other("disk on fire"));
        assert!(!io.is_corruption());
    }

    #[test]
    fn test_cleanup_error_exposes_source() {
        let inner = TreeError::IllegalState("closed".to_string());
        let err = TreeError::Cleanup(Box::new(inner));
        let source = std::error::Error::source(&err).expect("should have source");
        assert!(source.to_string().contains("closed"));
    }
}
