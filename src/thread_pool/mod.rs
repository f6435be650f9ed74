//! Thread pools used to run request handlers and background work.
//!
//! - [`RayonThreadPool`] is a work stealing pool, well suited to request handling.
//! - [`SharedQueueThreadPool`] is a fixed set of workers pulling named tasks from a shared
//!   queue. It tracks every queued and running task so its owner can enumerate them and drain
//!   the pool on shutdown, which is why background backups and exports run on it.
use crate::Result;

/// A trait for the basic functionality of a thread pool
pub trait ThreadPool {
    /// Creates a new thread pool, immediately spawning the specified number of threads.
    ///
    /// # Errors
    ///
    /// Returns an error if any thread fails to spawn. All previously-spawned threads are
    /// terminated.
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Spawns a function into the thread pool.
    ///
    /// Spawning always succeeds, but if the function panics the thread pool continues to
    /// operate with the same number of threads; the thread count is not reduced nor is the
    /// thread pool destroyed, corrupted or invalidated.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod rayon_pool;
mod shared_queue;

pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::{SharedQueueThreadPool, TaskId};
