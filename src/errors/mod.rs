//! Centralized error handling for the image loader
//!
//! # Error Categories
//!
//! - **Fetch Errors**: network or local read failures for the source image
//! - **Decode Errors**: unreadable or corrupt image data
//! - **Storage Errors**: cache database unavailable or a failed transaction
//! - **Admission**: a result larger than the whole cache budget
//!
//! Cancellation is not an error: an aborted job drops its response channel.
//! Storage errors never reach the caller. The cache fails open and the
//! request continues as a fresh download.

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for pipeline Results
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Convenience type alias for cache storage Results
pub type StorageResult<T> = Result<T, StorageError>;
