//! Settings of a store and their defaults.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::CourseNames;
use crate::error::{Result, StoreError};
use crate::rate_limit::{OperationClass, Quota};

/// the data directory used when none is given
pub const DEFAULT_DATA_DIR: &str = "predstore_data";
/// how many snapshots are retained by default
pub const DEFAULT_KEEP_BACKUPS: usize = 10;
/// how often the recurring backup runs by default
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(3600);
/// background workers started by default
pub const DEFAULT_BACKGROUND_THREADS: u32 = 2;

/// Settings used to build a [`Service`](crate::Service)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// directory holding the collection files; backups and exports live in sub directories
    pub data_dir: PathBuf,
    /// number of snapshots retained by rotation
    pub keep_backups: usize,
    /// period of the recurring backup
    pub backup_interval: Duration,
    /// number of workers running backups and exports
    pub background_threads: u32,
    /// export the CSV tables in the background after every write to `guesses` or `results`
    pub export_on_write: bool,
    /// per class quota overrides, classes not listed use their default quota
    pub quotas: BTreeMap<OperationClass, Quota>,
    /// course key to course name lookup used by the exports
    pub course_names: CourseNames,
}

impl StoreConfig {
    /// default settings keeping data in `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            data_dir: data_dir.into(),
            ..StoreConfig::default()
        }
    }

    /// where snapshots are written
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// where CSV exports are written
    pub fn export_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            keep_backups: DEFAULT_KEEP_BACKUPS,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            background_threads: DEFAULT_BACKGROUND_THREADS,
            export_on_write: true,
            quotas: BTreeMap::new(),
            course_names: CourseNames::default(),
        }
    }
}

/// Reads a course name table from a JSON object file, e.g.
/// `{"cs-f111": "CS F111 - Computer Programming"}`
pub fn load_course_names(path: &Path) -> Result<CourseNames> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::MalformedContent {
        name: path.display().to_string(),
        source,
    })
}
