use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use tracing::{debug, error, instrument, warn};

use crate::{Result, StoreError, ThreadPool};

/// identifies a task submitted to a [`SharedQueueThreadPool`]
pub type TaskId = u64;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// a job together with the bookkeeping needed to supervise it
struct Task {
    id: TaskId,
    name: String,
    job: Job,
}

/// A thread pool implemented with a shared job queue (i.e. channel).
///
/// This implementation uses the MPMC [`channel`] provided by the crossbeam crate.
/// Specifically, we are using it as a single producer, multiple consumer. The single producer
/// is this type itself, and the threads in the pool are the consumers.
///
/// Every task carries a name and stays listed in [`pending`](Self::pending) from the moment it
/// is submitted until it returns (or panics). [`shutdown`](Self::shutdown) closes the queue and
/// waits for every queued and running task, so the owner can drain the pool before exiting
/// while callers of [`submit`](Self::submit) never wait for their task.
///
/// If a spawned task panics, the old thread will be destroyed and a new one will be
/// created, so the number of workers stays the same.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    /// the sending part of the channel, `None` once the pool is shut down
    tx: Mutex<Option<Sender<Task>>>,
    /// join handles of every live worker, respawned workers included
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// names of queued and running tasks
    in_flight: Arc<DashMap<TaskId, String>>,
    next_id: AtomicU64,
}

impl SharedQueueThreadPool {
    /// Queues `job` under `name` and returns immediately.
    ///
    /// # Errors
    /// returns [`StoreError::BackgroundTask`] if the pool was shut down or lost all its workers
    pub fn submit<F>(&self, name: impl Into<String>, job: F) -> Result<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let tx = lock(&self.tx)
            .clone()
            .ok_or_else(|| StoreError::BackgroundTask(format!("cannot run {}: pool is shut down", name)))?;

        self.in_flight.insert(id, name.clone());
        let task = Task {
            id,
            name,
            job: Box::new(job),
        };
        tx.send(task).map_err(|e| {
            self.in_flight.remove(&id);
            StoreError::BackgroundTask(format!("cannot run {}: there are no threads in the pool", e.0.name))
        })?;
        debug!("queued task {}", id);
        Ok(id)
    }

    /// Lists queued and running tasks, oldest first
    pub fn pending(&self) -> Vec<(TaskId, String)> {
        let mut tasks: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        tasks.sort_unstable();
        tasks
    }

    /// Stops accepting tasks, then blocks until every queued and running task has finished
    /// and every worker has exited. Calling it more than once is harmless.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        // workers drain whatever is still queued, then see the channel disconnect
        drop(lock(&self.tx).take());

        loop {
            let worker = lock(&self.workers).pop();
            match worker {
                Some(handle) => {
                    if handle.join().is_err() {
                        debug!("joined a worker that panicked");
                    }
                }
                None => break,
            }
        }
        debug!("thread pool drained");
    }
}

impl ThreadPool for SharedQueueThreadPool {
    /// create a new "thread pool" with the given number of `threads`.
    /// Every thread created will have a handle to the receiving end of the channel
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Task>();
        let workers = Arc::new(Mutex::new(Vec::with_capacity(threads as usize)));
        let in_flight = Arc::new(DashMap::new());

        for _ in 0..threads {
            let task_rx = TaskReceiver {
                queue: rx.clone(),
                in_flight: Arc::clone(&in_flight),
                workers: Arc::clone(&workers),
            };
            let handle = spawn_worker(task_rx)?;
            lock(&workers).push(handle);
        }

        Ok(SharedQueueThreadPool {
            tx: Mutex::new(Some(tx)),
            workers,
            in_flight,
            next_id: AtomicU64::new(0),
        })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.submit("anonymous", job) {
            error!("{}", e);
        }
    }
}

/// A type that can receive tasks (i.e. closures) from a channel and run them.
/// Additionally, this type is responsible for restarting any threads that panicked
#[derive(Clone)]
struct TaskReceiver {
    queue: Receiver<Task>,
    in_flight: Arc<DashMap<TaskId, String>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Drop for TaskReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!("worker panicked, starting a new thread");
            match spawn_worker(self.clone()) {
                Ok(handle) => lock(&self.workers).push(handle),
                Err(e) => error!("Failed to spawn a thread: {}", e),
            }
        }
    }
}

/// removes a task from the in-flight listing once it returns or unwinds
struct InFlight<'a> {
    id: TaskId,
    tasks: &'a DashMap<TaskId, String>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some((id, name)) = self.tasks.remove(&self.id) {
            if thread::panicking() {
                error!("task {} ({}) panicked", id, name);
            } else {
                debug!("task {} ({}) finished", id, name);
            }
        }
    }
}

fn spawn_worker(rx: TaskReceiver) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("predstore-bg".into())
        .spawn(move || run_tasks(rx))?;
    Ok(handle)
}

/// this function waits for a task to arrive on its (wrapped) receiver, and then runs the task
fn run_tasks(rx: TaskReceiver) {
    while let Ok(task) = rx.queue.recv() {
        let _in_flight = InFlight {
            id: task.id,
            tasks: &rx.in_flight,
        };
        debug!("running task {} ({})", task.id, task.name);
        (task.job)();
    }
    debug!("Thread exited because the thread pool was destroyed.");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
