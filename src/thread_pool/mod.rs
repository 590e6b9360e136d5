//! Thread pools that run the depot's connections.
//!
//! Each accepted connection is handed to [`ThreadPool::spawn`] and served to completion on a pool
//! thread, so the pool size bounds how many connections are serviced at once.

use crate::Result;

mod naive;
mod rayon_pool;
mod shared_queue;

pub use self::naive::NaiveThreadPool;
pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;

/// The interface every pool implements.
pub trait ThreadPool: Send + Sync + 'static {
    /// Creates a pool of `threads` threads.
    ///
    /// # Errors
    /// Fails if a thread can't be created.
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Runs `job` on a pool thread.
    ///
    /// A job that panics doesn't shrink the pool.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}
