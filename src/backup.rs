//! Point-in-time snapshots of every collection, kept under a bounded retention policy.
//!
//! Each snapshot is written twice into the backup directory, as `<id>.json` and as the gzip
//! compressed `<id>.json.gz`. Identifiers embed the UTC creation time down to the nanosecond
//! (`backup_YYYYMMDD_HHMMSS_NNNNNNNNN`), so sorting identifiers sorts snapshots by age.
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::cache::{CacheStore, LockedCache};
use crate::collection::{Collection, CollectionName};
use crate::engine::{write_atomic, Persistence};
use crate::error::{Result, StoreError};

/// version tag written into every snapshot envelope
pub const FORMAT_VERSION: &str = "2.0";

const ID_PREFIX: &str = "backup_";
const PLAIN_SUFFIX: &str = ".json";
const COMPRESSED_SUFFIX: &str = ".json.gz";

/// The identifier shared by both encodings of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    fn at(time: DateTime<Utc>) -> Self {
        SnapshotId(format!("{}{}", ID_PREFIX, time.format("%Y%m%d_%H%M%S_%9f")))
    }

    /// the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// extracts the identifier from the file name of either encoding
    fn from_file_name(file_name: &str) -> Option<SnapshotId> {
        let stem = file_name
            .strip_suffix(COMPRESSED_SUFFIX)
            .or_else(|| file_name.strip_suffix(PLAIN_SUFFIX))?;
        stem.parse().ok()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.starts_with(ID_PREFIX)
            && s.len() > ID_PREFIX.len()
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(SnapshotId(s.to_string()))
        } else {
            Err(StoreError::Parsing(format!("not a snapshot id: {}", s)))
        }
    }
}

/// The versioned envelope persisted for every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// the `users` collection
    pub users: Collection,
    /// the `guesses` collection
    pub guesses: Collection,
    /// the `results` collection
    #[serde(alias = "actual_results")]
    pub results: Collection,
    /// when the snapshot was assembled
    pub created_at: DateTime<Utc>,
    /// envelope version, see [`FORMAT_VERSION`]
    pub format_version: String,
}

impl Snapshot {
    /// the snapshotted value of collection `name`
    pub fn collection(&self, name: CollectionName) -> &Collection {
        match name {
            CollectionName::Users => &self.users,
            CollectionName::Guesses => &self.guesses,
            CollectionName::Results => &self.results,
        }
    }
}

/// Writes, lists, reads and rotates snapshots inside a backup directory
#[derive(Debug)]
pub struct BackupManager {
    dir: PathBuf,
    keep: usize,
    // creation time of the last snapshot, keeps identifiers strictly increasing
    last_created: Mutex<Option<DateTime<Utc>>>,
}

impl BackupManager {
    /// creates a manager keeping the `keep` most recent snapshots in `dir`, which is created
    /// if needed
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(BackupManager {
            dir,
            keep,
            last_created: Mutex::new(None),
        })
    }

    /// the directory holding the snapshots
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshots every collection as currently seen through `cache`, then rotates.
    ///
    /// The cache lock is held while the collections are read and written out, so the snapshot
    /// is consistent across collections.
    #[instrument(skip(self, cache))]
    pub fn snapshot<P: Persistence>(&self, cache: &CacheStore<P>) -> Result<SnapshotId> {
        let id = cache.with_locked(|view| self.write_snapshot(view))?;
        self.rotate_retained();
        Ok(id)
    }

    /// Writes both encodings of a snapshot of the collections seen through `view`, without
    /// rotating. Used to snapshot and then replace collections under one lock.
    pub fn write_snapshot<P: Persistence>(&self, view: &mut LockedCache<'_, P>) -> Result<SnapshotId> {
        let (id, created_at) = self.next_id();
        let snapshot = Snapshot {
            users: view.get(CollectionName::Users),
            guesses: view.get(CollectionName::Guesses),
            results: view.get(CollectionName::Results),
            created_at,
            format_version: FORMAT_VERSION.to_string(),
        };

        let plain = serde_json::to_vec_pretty(&snapshot)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain)?;
        let compressed = encoder.finish()?;

        let compressed_path = self.compressed_path(&id);
        write_atomic(&compressed_path, &compressed)?;
        if let Err(e) = write_atomic(&self.plain_path(&id), &plain) {
            // never leave one encoding without the other
            if let Err(cleanup) = fs::remove_file(&compressed_path) {
                error!("could not remove {:?}: {}", &compressed_path, cleanup);
            }
            return Err(e.into());
        }
        info!("backup created: {}", id);
        Ok(id)
    }

    /// rotates down to the configured retention, only logging failures
    pub fn rotate_retained(&self) {
        if let Err(e) = self.rotate(self.keep) {
            error!("error cleaning up backups: {}", e);
        }
    }

    /// Deletes every snapshot except the `keep` most recent ones, both encodings together.
    ///
    /// Returns the number of snapshots removed. A snapshot that can't be removed is logged and
    /// skipped; it is retried by the next rotation.
    pub fn rotate(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for id in self.list()?.iter().skip(keep) {
            match self.remove(id) {
                Ok(()) => {
                    removed += 1;
                    info!("removed old backup: {}", id);
                }
                Err(e) => error!("error removing backup {}: {}", id, e),
            }
        }
        Ok(removed)
    }

    /// Lists the identifiers of every snapshot on disk, newest first.
    /// An identifier is listed if either of its encodings is present.
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(SnapshotId::from_file_name) {
                ids.insert(id);
            }
        }
        Ok(ids.into_iter().rev().collect())
    }

    /// Reads snapshot `id` from its plain encoding, falling back to the compressed one.
    pub fn read(&self, id: &SnapshotId) -> Result<Snapshot> {
        match self.read_plain(id) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                debug!("plain encoding of {} unusable ({}), trying compressed", id, e);
                self.read_compressed(id)
            }
        }
    }

    fn read_plain(&self, id: &SnapshotId) -> Result<Snapshot> {
        let path = self.plain_path(id);
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::MalformedContent {
            name: path.display().to_string(),
            source,
        })
    }

    fn read_compressed(&self, id: &SnapshotId) -> Result<Snapshot> {
        let path = self.compressed_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::SnapshotNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_reader(GzDecoder::new(BufReader::new(file))).map_err(|source| {
            StoreError::MalformedContent {
                name: path.display().to_string(),
                source,
            }
        })
    }

    /// removes both encodings of `id`; the compressed one goes first so a failure never leaves
    /// a compressed copy without its plain twin
    fn remove(&self, id: &SnapshotId) -> Result<()> {
        remove_if_exists(&self.compressed_path(id))?;
        remove_if_exists(&self.plain_path(id))?;
        Ok(())
    }

    fn next_id(&self) -> (SnapshotId, DateTime<Utc>) {
        let mut last = self
            .last_created
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut created_at = Utc::now();
        if let Some(prev) = *last {
            if created_at <= prev {
                created_at = prev + Duration::nanoseconds(1);
            }
        }
        *last = Some(created_at);
        (SnapshotId::at(created_at), created_at)
    }

    fn plain_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{}{}", id, PLAIN_SUFFIX))
    }

    fn compressed_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{}{}", id, COMPRESSED_SUFFIX))
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
