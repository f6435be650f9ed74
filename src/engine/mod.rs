//! This module provides the durable storage layer underneath the cache.
//! The only implementation shipped is [`FileStore`], which keeps one JSON document per
//! collection in a data directory and replaces documents atomically (temp file + rename).
//!
//! The [`Persistence`] trait exists so the cache can be driven against other backends, which
//! is how the tests inject read and write failures.
use std::time::SystemTime;

use crate::collection::{Collection, CollectionName};
use crate::Result;

/// The modification marker of a durable collection: its modification time at the full
/// precision the filesystem offers, or `None` when no file exists.
pub type Marker = Option<SystemTime>;

/// A trait for the basic functionality of a durable collection store
pub trait Persistence: Send + Sync + 'static {
    /// Loads the durable value of the collection `name`.
    ///
    /// Returns an empty collection if nothing has been stored yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StorageUnavailable` if the underlying read fails and
    /// `StoreError::MalformedContent` if the stored content is not a JSON object.
    fn load(&self, name: CollectionName) -> Result<Collection>;

    /// Replaces the durable value of the collection `name` with `collection`.
    ///
    /// Implementations must be all-or-nothing: readers see either the old or the new value.
    fn save(&self, name: CollectionName, collection: &Collection) -> Result<()>;

    /// Returns the current modification marker of the collection `name`.
    fn marker(&self, name: CollectionName) -> Marker;
}

/// Returns `true` if a value derived from a file with marker `cached` may still be served
/// given the file's `on_disk` marker.
pub fn is_fresh(cached: Marker, on_disk: Marker) -> bool {
    match (cached, on_disk) {
        (None, None) => true,
        (Some(cached), Some(on_disk)) => cached >= on_disk,
        // created or deleted behind our back
        _ => false,
    }
}

mod file_store;

pub use self::file_store::FileStore;
pub(crate) use self::file_store::write_atomic;
