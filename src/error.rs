use std::io;
use thiserror::Error;

use crate::rate_limit::OperationClass;

/// type alias for all operations on the store that could fail with a [`StoreError`]
pub type Result<T> = std::result::Result<T, StoreError>;

/// The Error variants used by the store.
/// It wraps lower level errors from third party crates and the std library, so callers can
/// decide on user-visible behavior with a single `match`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// the underlying disk read/write failed
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] io::Error),

    /// on-disk content of a collection or snapshot could not be parsed
    #[error("malformed content in {name}: {source}")]
    MalformedContent {
        /// the file (or collection) whose content was malformed
        name: String,
        /// the underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// a client exceeded the request quota of an operation class
    #[error("rate limit exceeded for {client} on {class} requests, please try again later")]
    QuotaExceeded {
        /// the client that was denied
        client: String,
        /// the guarded operation class
        class: OperationClass,
    },

    /// a remote server refused the request because of its rate limit
    #[error("{0}")]
    RateLimited(String),

    /// a backup or export task failed (only ever logged)
    #[error("background task failed: {0}")]
    BackgroundTask(String),

    /// Serde Error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// a write payload was not a JSON object
    #[error("data must be a JSON object")]
    NotAnObject,

    /// the requested snapshot has neither of its encodings on disk
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// variant for errors that occur while parsing user input
    #[error("{0}")]
    Parsing(String),

    /// catch all variant, mostly used for errors reported by a remote server
    #[error("{0}")]
    StringErr(String),
}

impl StoreError {
    /// returns `true` if the caller may retry the same operation later and expect it to succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::QuotaExceeded { .. } | StoreError::RateLimited(_)
        )
    }
}
