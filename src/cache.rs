//! The write-through cache sitting between request handlers and the persistence layer.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, instrument, warn};

use crate::collection::{merge, Collection, CollectionName};
use crate::engine::{is_fresh, FileStore, Marker, Persistence};
use crate::error::{Result, StoreError};

/// In-memory shadow of a collection plus the marker of the durable copy it was derived from.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Collection,
    marker: Marker,
}

/// A write-through, read-allocate cache in front of a [`Persistence`] implementation.
///
/// The persistence layer is always the source of truth. A cached value is only served while
/// its marker is at least as new as the durable copy's marker, so external modifications
/// of the data files are picked up on the next read.
///
/// All entries are guarded by a single lock which is held for a whole
/// check / load / merge / save sequence. Two writers of the same collection therefore never
/// interleave, and a concurrent miss can't clobber a fresher write.
#[derive(Debug)]
pub struct CacheStore<P: Persistence = FileStore> {
    persistence: P,
    entries: Mutex<HashMap<CollectionName, CacheEntry>>,
}

impl<P: Persistence> CacheStore<P> {
    /// creates an empty cache over `persistence`
    pub fn new(persistence: P) -> Self {
        CacheStore {
            persistence,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// the persistence layer backing this cache
    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Returns the current value of collection `name`.
    ///
    /// Storage failures are never surfaced here: unreadable or malformed data is logged and an
    /// empty collection is returned (without caching it, so the next call retries the disk).
    pub fn get(&self, name: CollectionName) -> Collection {
        let mut entries = self.lock();
        self.get_locked(&mut entries, name)
    }

    /// Merges `delta` into collection `name` and writes the result through to storage.
    ///
    /// The merge is shallow, see [`merge`]. On failure the cached value is left untouched.
    #[instrument(skip(self, delta), fields(keys = delta.len()))]
    pub fn put(&self, name: CollectionName, delta: Collection) -> Result<()> {
        let mut entries = self.lock();
        let mut merged = self.get_locked(&mut entries, name);
        merge(&mut merged, delta);
        self.store_locked(&mut entries, name, merged)
    }

    /// Replaces collection `name` wholesale with `value`.
    #[instrument(skip(self, value))]
    pub fn replace(&self, name: CollectionName, value: Collection) -> Result<()> {
        let mut entries = self.lock();
        self.store_locked(&mut entries, name, value)
    }

    /// Loads every collection into the cache, creating empty durable files for collections that
    /// don't exist yet.
    pub fn warm(&self) -> Result<()> {
        let mut entries = self.lock();
        for name in CollectionName::ALL.iter().copied() {
            if self.persistence.marker(name).is_none() {
                self.store_locked(&mut entries, name, Collection::new())?;
                info!("initialized {}", name.file_name());
            }
            let value = self.get_locked(&mut entries, name);
            debug!("warmed {} with {} keys", name, value.len());
        }
        Ok(())
    }

    /// Runs `f` while holding the cache lock, giving it exclusive access to every collection.
    ///
    /// Nothing else can read or write any collection until `f` returns, so a snapshot taken
    /// through the view followed by replaces through the same view can't miss a write.
    pub fn with_locked<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut LockedCache<'_, P>) -> T,
    {
        let mut view = LockedCache {
            store: self,
            entries: self.lock(),
        };
        f(&mut view)
    }

    /// number of top-level keys currently cached per collection
    pub fn cached_sizes(&self) -> BTreeMap<CollectionName, usize> {
        self.lock()
            .iter()
            .map(|(name, entry)| (*name, entry.value.len()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CollectionName, CacheEntry>> {
        // entries are only replaced after a successful save, so a poisoned map is still consistent
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_locked(
        &self,
        entries: &mut HashMap<CollectionName, CacheEntry>,
        name: CollectionName,
    ) -> Collection {
        // read the marker before the content: if the file moves on in between, the entry
        // is merely considered stale on the next call
        let on_disk = self.persistence.marker(name);
        if let Some(entry) = entries.get(&name) {
            if is_fresh(entry.marker, on_disk) {
                debug!("using cached data for {}", name);
                return entry.value.clone();
            }
        }

        match self.persistence.load(name) {
            Ok(value) => {
                debug!("loaded {} from storage", name);
                entries.insert(
                    name,
                    CacheEntry {
                        value: value.clone(),
                        marker: on_disk,
                    },
                );
                value
            }
            Err(e @ StoreError::MalformedContent { .. }) => {
                warn!("{}, treating {} as empty", e, name);
                Collection::new()
            }
            Err(e) => {
                error!("error loading {}: {}", name, e);
                Collection::new()
            }
        }
    }

    fn store_locked(
        &self,
        entries: &mut HashMap<CollectionName, CacheEntry>,
        name: CollectionName,
        value: Collection,
    ) -> Result<()> {
        if let Err(e) = self.persistence.save(name, &value) {
            error!("error saving {}: {}", name, e);
            return Err(e);
        }
        let marker = self.persistence.marker(name);
        info!("saved {} with {} keys", name, value.len());
        entries.insert(name, CacheEntry { value, marker });
        Ok(())
    }
}

/// Exclusive access to every collection of a [`CacheStore`], see [`CacheStore::with_locked`]
pub struct LockedCache<'a, P: Persistence> {
    store: &'a CacheStore<P>,
    entries: MutexGuard<'a, HashMap<CollectionName, CacheEntry>>,
}

impl<P: Persistence> LockedCache<'_, P> {
    /// the current value of collection `name`, as [`CacheStore::get`]
    pub fn get(&mut self, name: CollectionName) -> Collection {
        self.store.get_locked(&mut *self.entries, name)
    }

    /// replaces collection `name` wholesale, as [`CacheStore::replace`]
    pub fn replace(&mut self, name: CollectionName, value: Collection) -> Result<()> {
        self.store.store_locked(&mut *self.entries, name, value)
    }
}
