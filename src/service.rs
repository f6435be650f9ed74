use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::analysis::{self, Stats, Winners};
use crate::backup::{BackupManager, SnapshotId};
use crate::cache::CacheStore;
use crate::collection::{Collection, CollectionName};
use crate::config::StoreConfig;
use crate::engine::{FileStore, Persistence};
use crate::error::{Result, StoreError};
use crate::export::{ExportPaths, Exporter};
use crate::rate_limit::{Limiters, OperationClass};
use crate::thread_pool::{SharedQueueThreadPool, TaskId, ThreadPool};

/// A health report of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    /// whether each collection has a durable file
    pub files_present: BTreeMap<CollectionName, bool>,
    /// top-level keys currently cached per collection
    pub cached_keys: BTreeMap<CollectionName, usize>,
    /// number of snapshots on disk
    pub snapshots: usize,
    /// background tasks queued or running
    pub pending_tasks: Vec<(TaskId, String)>,
}

/// the thread firing the recurring backup, stopped by dropping `stop`
struct Scheduler {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The prediction store.
///
/// A `Service` is built once at start-up and then handed (cloned, it is a cheap handle) to
/// every request handler and background trigger. It owns:
///
/// - the [`CacheStore`] in front of the collection files,
/// - one rate limiter per [`OperationClass`],
/// - the [`BackupManager`] and the CSV [`Exporter`],
/// - a supervised [`SharedQueueThreadPool`] running backups and exports, plus the scheduler
///   thread firing the recurring backup.
///
/// Triggered background work never blocks the caller and its failures are only logged.
/// Call [`shutdown`](Self::shutdown) to stop the scheduler and drain queued work.
pub struct Service<P: Persistence = FileStore> {
    cache: Arc<CacheStore<P>>,
    backups: Arc<BackupManager>,
    exporter: Arc<Exporter>,
    limiters: Arc<Limiters>,
    tasks: Arc<SharedQueueThreadPool>,
    scheduler: Arc<Mutex<Option<Scheduler>>>,
    config: Arc<StoreConfig>,
}

impl<P: Persistence> Clone for Service<P> {
    fn clone(&self) -> Self {
        Service {
            cache: Arc::clone(&self.cache),
            backups: Arc::clone(&self.backups),
            exporter: Arc::clone(&self.exporter),
            limiters: Arc::clone(&self.limiters),
            tasks: Arc::clone(&self.tasks),
            scheduler: Arc::clone(&self.scheduler),
            config: Arc::clone(&self.config),
        }
    }
}

impl Service<FileStore> {
    /// opens a store keeping its collections in `config.data_dir`
    pub fn open(config: StoreConfig) -> Result<Self> {
        let files = FileStore::open(&config.data_dir)?;
        Service::with_persistence(files, config)
    }
}

impl<P: Persistence> Service<P> {
    /// builds a store over an arbitrary persistence layer; backups and exports still go to the
    /// directories named by `config`
    pub fn with_persistence(persistence: P, config: StoreConfig) -> Result<Self> {
        let backups = BackupManager::new(config.backup_dir(), config.keep_backups)?;
        let exporter = Exporter::new(config.export_dir(), config.course_names.clone())?;
        let tasks = SharedQueueThreadPool::new(config.background_threads)?;

        Ok(Service {
            cache: Arc::new(CacheStore::new(persistence)),
            backups: Arc::new(backups),
            exporter: Arc::new(exporter),
            limiters: Arc::new(Limiters::new(&config.quotas)),
            tasks: Arc::new(tasks),
            scheduler: Arc::new(Mutex::new(None)),
            config: Arc::new(config),
        })
    }

    /// Loads every collection (creating missing files), queues the start-up backup and
    /// schedules the recurring one.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        self.cache.warm()?;
        info!("data files initialized and cached");
        if let Err(e) = self.trigger_backup() {
            error!("could not queue the start-up backup: {}", e);
        }
        self.start_periodic_backups(self.config.backup_interval)
    }

    /// Starts (or restarts) the recurring backup, fired every `every`.
    /// Each tick also forgets idle rate limiter clients.
    pub fn start_periodic_backups(&self, every: Duration) -> Result<()> {
        self.stop_periodic_backups();

        let (stop, stopped) = channel::bounded::<()>(0);
        let ticker = channel::tick(every);
        let cache = Arc::clone(&self.cache);
        let backups = Arc::clone(&self.backups);
        let tasks = Arc::clone(&self.tasks);
        let limiters = Arc::clone(&self.limiters);

        let handle = thread::Builder::new()
            .name("predstore-scheduler".into())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        limiters.sweep();
                        if let Err(e) = submit_backup(&tasks, &cache, &backups) {
                            error!("could not queue the periodic backup: {}", e);
                        }
                    },
                    recv(stopped) -> _ => break,
                }
            })?;

        *lock(&self.scheduler) = Some(Scheduler { stop, handle });
        info!("periodic backup scheduled every {:?}", every);
        Ok(())
    }

    /// Stops the recurring backup and waits for every queued and running background task.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.stop_periodic_backups();
        self.tasks.shutdown();
        info!("store shut down");
    }

    fn stop_periodic_backups(&self) {
        let scheduler = lock(&self.scheduler).take();
        if let Some(Scheduler { stop, handle }) = scheduler {
            drop(stop);
            if handle.join().is_err() {
                error!("the backup scheduler panicked");
            }
            debug!("periodic backup stopped");
        }
    }

    /// admits a call of `class` from `client`, see [`Limiters::admit`]
    pub fn admit(&self, client: &str, class: OperationClass) -> Result<()> {
        self.limiters.admit(client, class)
    }

    /// the current value of collection `name`
    pub fn get(&self, name: CollectionName) -> Collection {
        self.cache.get(name)
    }

    /// Shallow-merges `delta` into collection `name`.
    ///
    /// A successful write to `guesses` or `results` queues a CSV export when
    /// `export_on_write` is configured.
    pub fn put(&self, name: CollectionName, delta: Collection) -> Result<()> {
        self.cache.put(name, delta)?;
        let feeds_exports = matches!(name, CollectionName::Guesses | CollectionName::Results);
        if feeds_exports && self.config.export_on_write {
            if let Err(e) = self.trigger_export() {
                error!("could not queue the export: {}", e);
            }
        }
        Ok(())
    }

    /// takes a snapshot right away
    pub fn snapshot(&self) -> Result<SnapshotId> {
        self.backups.snapshot(&*self.cache)
    }

    /// keeps only the `keep` newest snapshots, returns how many were removed
    pub fn rotate(&self, keep: usize) -> Result<usize> {
        self.backups.rotate(keep)
    }

    /// snapshot identifiers, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        self.backups.list()
    }

    /// Snapshots the current data, then replaces every collection with its value in snapshot
    /// `id`. Returns the identifier of the snapshot holding the replaced data.
    #[instrument(skip(self))]
    pub fn restore(&self, id: &SnapshotId) -> Result<SnapshotId> {
        let snapshot = self.backups.read(id)?;
        let previous = self.snapshot_then_replace(&CollectionName::ALL, |name| {
            snapshot.collection(name).clone()
        })?;
        info!("data restored from {}, previous state kept in {}", id, previous);
        Ok(previous)
    }

    /// the winners join over the current `guesses` and `results`
    pub fn compute_winners(&self) -> Winners {
        Winners::new(
            self.cache.get(CollectionName::Guesses),
            self.cache.get(CollectionName::Results),
        )
    }

    /// writes the three CSV tables right away
    pub fn export_tables(&self) -> Result<ExportPaths> {
        export(&*self.cache, &*self.exporter)
    }

    /// Snapshots, then empties every collection.
    /// Nothing is cleared if the snapshot fails.
    #[instrument(skip(self))]
    pub fn clear_all(&self) -> Result<SnapshotId> {
        let id = self.snapshot_then_replace(&CollectionName::ALL, |_| Collection::new())?;
        info!("all data cleared, previous state kept in {}", id);
        Ok(id)
    }

    /// Snapshots, then empties `guesses` and `results` while keeping `users`.
    #[instrument(skip(self))]
    pub fn restart_competition(&self) -> Result<SnapshotId> {
        let cleared = [CollectionName::Guesses, CollectionName::Results];
        let id = self.snapshot_then_replace(&cleared, |_| Collection::new())?;
        info!("competition restarted, previous state kept in {}", id);
        Ok(id)
    }

    /// Snapshots every collection, then replaces each of `names` with `value(name)`.
    ///
    /// Both steps run under the cache lock, so a write acknowledged before the call is in the
    /// snapshot and a write acknowledged after it survives the replace.
    fn snapshot_then_replace<F>(&self, names: &[CollectionName], mut value: F) -> Result<SnapshotId>
    where
        F: FnMut(CollectionName) -> Collection,
    {
        let id = self.cache.with_locked(|view| -> Result<SnapshotId> {
            let id = self.backups.write_snapshot(view)?;
            for name in names.iter().copied() {
                view.replace(name, value(name))?;
            }
            Ok(id)
        })?;
        self.backups.rotate_retained();
        Ok(id)
    }

    /// aggregate counters over the current collections
    pub fn stats(&self) -> Stats {
        analysis::stats(
            &self.cache.get(CollectionName::Users),
            &self.cache.get(CollectionName::Guesses),
            &self.cache.get(CollectionName::Results),
            &self.config.course_names,
        )
    }

    /// a health report of the store
    pub fn health(&self) -> Health {
        let persistence = self.cache.persistence();
        let files_present = CollectionName::ALL
            .iter()
            .map(|name| (*name, persistence.marker(*name).is_some()))
            .collect();
        let snapshots = match self.backups.list() {
            Ok(ids) => ids.len(),
            Err(e) => {
                error!("cannot list backups: {}", e);
                0
            }
        };

        Health {
            files_present,
            cached_keys: self.cache.cached_sizes(),
            snapshots,
            pending_tasks: self.tasks.pending(),
        }
    }

    /// queues a snapshot on the background pool and returns immediately
    pub fn trigger_backup(&self) -> Result<TaskId> {
        submit_backup(&self.tasks, &self.cache, &self.backups)
    }

    /// queues a CSV export on the background pool and returns immediately
    pub fn trigger_export(&self) -> Result<TaskId> {
        let cache = Arc::clone(&self.cache);
        let exporter = Arc::clone(&self.exporter);
        self.tasks.submit("export", move || match export(&*cache, &*exporter) {
            Ok(paths) => info!("CSV export completed: {:?}", paths.analysis),
            Err(e) => error!("{}", StoreError::BackgroundTask(format!("CSV export failed: {}", e))),
        })
    }

    /// background tasks queued or running
    pub fn pending_tasks(&self) -> Vec<(TaskId, String)> {
        self.tasks.pending()
    }

    /// the settings this store was built with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// the cache in front of the collection files
    pub fn cache(&self) -> &CacheStore<P> {
        &self.cache
    }
}

fn submit_backup<P: Persistence>(
    tasks: &SharedQueueThreadPool,
    cache: &Arc<CacheStore<P>>,
    backups: &Arc<BackupManager>,
) -> Result<TaskId> {
    let cache = Arc::clone(cache);
    let backups = Arc::clone(backups);
    tasks.submit("backup", move || match backups.snapshot(&*cache) {
        Ok(id) => info!("backup completed: {}", id),
        Err(e) => error!("{}", StoreError::BackgroundTask(format!("backup failed: {}", e))),
    })
}

fn export<P: Persistence>(cache: &CacheStore<P>, exporter: &Exporter) -> Result<ExportPaths> {
    let guesses = cache.get(CollectionName::Guesses);
    let results = cache.get(CollectionName::Results);
    exporter.export(&guesses, &results)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
