use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, instrument};

use super::ThreadPool;
use crate::Result;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool implemented with a shared job queue (i.e. channel).
///
/// This implementation uses the MPMC [`channel`] provided by the crossbeam crate, with the pool
/// as the single producer and its threads as the consumers.
///
/// If a task panics, the thread running it is replaced with a new one. Dropping the pool closes
/// the channel, and each thread exits once the queue is empty.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    tx: Sender<Task>,
}

impl ThreadPool for SharedQueueThreadPool {
    /// create a new thread pool with the given number of `threads`.
    /// Every thread created will have a handle to the receiving end of the channel
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Task>();
        for i in 0..threads {
            let task_rx = TaskReceiver(rx.clone());
            thread::Builder::new()
                .name(format!("connection-{}", i))
                .spawn(move || run_tasks(task_rx))?;
        }
        Ok(SharedQueueThreadPool { tx })
    }

    /// Queues `job` for the next idle thread. The job is dropped with an error logged if every
    /// thread has died and none could be replaced.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            error!("No threads left in the pool, dropping job");
        }
    }
}

/// Receives tasks from the pool's channel. Dropping it during a panic starts a replacement
/// thread, so the pool keeps its size.
#[derive(Clone)]
struct TaskReceiver(Receiver<Task>);

impl Drop for TaskReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("thread panicked, starting a new thread");
            let task_rx = self.clone();
            let name = thread::current()
                .name()
                .unwrap_or("connection")
                .to_owned();
            if let Err(e) = thread::Builder::new()
                .name(name)
                .spawn(move || run_tasks(task_rx))
            {
                error!("Failed to spawn a thread: {}", e);
            }
        }
    }
}

#[instrument(skip_all)]
fn run_tasks(rx: TaskReceiver) {
    while let Ok(task) = rx.0.recv() {
        task();
    }
    debug!("Thread exited because the thread pool was destroyed.");
}
