//! Error type definitions for the image loader
//!
//! This module defines the error hierarchy used by the cache, the request
//! pipeline and the process shell around them.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Request pipeline errors
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors that terminate, or silently end, a single image job
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The source could not be read
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The source bytes are not a decodable image, or re-encoding failed
    #[error("Decode failed: {message}")]
    Decode { message: String },

    /// The cache backend failed; callers treat this as a miss or skipped write
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The encoded result is larger than the entire cache budget
    #[error("Admission rejected: {size} bytes exceeds budget of {budget} bytes")]
    AdmissionRejected { size: u64, budget: u64 },
}

/// Source fetch errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Transport-level failure talking to a remote source
    #[error("Network error: {url} - {message}")]
    Network { url: String, message: String },

    /// Remote source answered with something other than 200
    #[error("HTTP error: {url} - status {status}")]
    Status { url: String, status: u16 },

    /// Local file could not be read
    #[error("Read error: {path} - {message}")]
    Read { path: String, message: String },

    /// Locator could not be understood
    #[error("Invalid source: {locator} - {message}")]
    InvalidSource { locator: String, message: String },

    /// Source is larger than the configured ceiling
    #[error("Source too large: {locator} - exceeds {limit} bytes")]
    TooLarge { locator: String, limit: u64 },
}

/// Cache storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store never opened, or failed to initialize
    #[error("Cache storage unavailable")]
    Unavailable,

    /// SQL execution failure
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Metadata and payload rows disagree for a key
    #[error("Inconsistent cache entry: {key}")]
    Inconsistent { key: String },
}

impl AppError {
    /// Create a configuration error with a custom message
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl LoaderError {
    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<image::ImageError> for LoaderError {
    fn from(err: image::ImageError) -> Self {
        Self::decode(err.to_string())
    }
}

impl FetchError {
    /// Create a network error
    pub fn network<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a read error
    pub fn read<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::Read {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid source error
    pub fn invalid_source<L: Into<String>, M: Into<String>>(locator: L, message: M) -> Self {
        Self::InvalidSource {
            locator: locator.into(),
            message: message.into(),
        }
    }

    /// Create a too-large error
    pub fn too_large<L: Into<String>>(locator: L, limit: u64) -> Self {
        Self::TooLarge {
            locator: locator.into(),
            limit,
        }
    }
}

impl StorageError {
    /// Create an inconsistency error
    pub fn inconsistent<K: Into<String>>(key: K) -> Self {
        Self::Inconsistent { key: key.into() }
    }
}
