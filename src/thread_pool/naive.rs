use std::thread;

use tracing::error;

use super::ThreadPool;
use crate::Result;

/// A "pool" that starts a new thread for every job. The thread count is ignored.
pub struct NaiveThreadPool;

impl ThreadPool for NaiveThreadPool {
    fn new(_threads: u32) -> Result<Self> {
        Ok(NaiveThreadPool)
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = thread::Builder::new().name("connection".into()).spawn(job) {
            error!("Failed to spawn a thread: {}", e);
        }
    }
}
