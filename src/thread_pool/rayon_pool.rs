use tracing::{debug, error};

use super::ThreadPool;
use crate::{DepotError, Result};

/// A thread pool that uses a work stealing strategy as implemented by the [`Rayon`] library.
///
/// [`Rayon`]: https://docs.rs/rayon/latest/rayon/index.html
pub struct RayonThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .thread_name(|i| format!("connection-{}", i))
            .panic_handler(|_| error!("connection thread panicked"))
            .build()
            .map_err(|e| DepotError::Config(format!("could not build thread pool: {:?}", e)))?;
        debug!("created rayon thread pool with {} threads", threads);
        Ok(RayonThreadPool { pool })
    }

    // a panicking job goes to the panic handler, the worker thread survives
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }
}
