//! Error types for QuarryDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in QuarryDB operations.
///
/// Absent keys are not errors: lookups return `Option` and removals return
/// `bool`. Invariant breaches (invalid frame ids, removing a pinned frame,
/// page type confusion) abort via assertions instead of surfacing here.
#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}
