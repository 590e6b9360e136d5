//! The depot's work pipeline.
//!
//! Mutating requests (report inserts, suite updates) are not applied on the connection thread.
//! Handlers package them as [`DelayedWork`] and put them on the live [`WorkQueue`], or divert them
//! to the durable delayed queue while a sync holds the lock. [`Workers`] drain the live queue,
//! applying work through the [`Store`] and delivering peer notifications.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::client::Connector;
use crate::error::{DepotError, Result};
use crate::peer::PeerConfig;
use crate::protocol::{Statement, NOTIFY_INSERT_COMMAND};

mod store;

pub use self::store::{MemoryStore, Store};

// how long an idle worker waits before checking for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A report upload: the header naming the resource and context, and the report sections.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// the resource the reporter ran on
    pub resource: String,
    /// the context (command line) the reporter ran with
    pub context: String,
    /// the resource the report is about, if not `resource`
    pub target: Option<String>,
    /// the reporter's standard error, if any
    pub stderr: Option<String>,
    /// the report document
    pub stdout: String,
    /// resource usage of the reporter run
    pub sysusage: String,
}

impl Report {
    /// Parses a `REPORT` header: `resource LF context LF target`, or the older
    /// `resource SP context` form.
    pub fn parse_header(header: &str) -> Result<(String, String, Option<String>)> {
        let pieces: Vec<&str> = header.splitn(3, '\n').collect();
        if pieces.len() == 3 {
            let target = Some(pieces[2]).filter(|t| !t.is_empty()).map(String::from);
            return Ok((pieces[0].to_string(), pieces[1].to_string(), target));
        }
        let header = header.trim_start();
        match header.find(char::is_whitespace) {
            Some(i) => Ok((
                header[..i].to_string(),
                header[i..].trim_start().to_string(),
                None,
            )),
            None => Err(DepotError::protocol(format!(
                "Malformed report header '{}'",
                header
            ))),
        }
    }

    /// the header line of the statement that carries this report
    pub fn header(&self) -> String {
        format!(
            "{}\n{}\n{}",
            self.resource,
            self.context,
            self.target.as_deref().unwrap_or("")
        )
    }
}

/// A unit of mutating work, captured so it can be applied later.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DelayedWork {
    /// store a report
    InsertReport(Report),
    /// apply a suite update document
    UpdateSuite(String),
}

impl DelayedWork {
    /// a report insert with no stderr and no target
    pub fn report(resource: &str, context: &str, stdout: &str) -> Self {
        DelayedWork::InsertReport(Report {
            resource: resource.to_string(),
            context: context.to_string(),
            target: None,
            stderr: None,
            stdout: stdout.to_string(),
            sysusage: String::new(),
        })
    }

    /// a suite update
    pub fn suite(xml: &str) -> Self {
        DelayedWork::UpdateSuite(xml.to_string())
    }
}

impl fmt::Display for DelayedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayedWork::InsertReport(r) => write!(f, "report '{}' from {}", r.context, r.resource),
            DelayedWork::UpdateSuite(xml) => write!(f, "suite update of {} bytes", xml.len()),
        }
    }
}

/// A change forwarded to peer depots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// a single statement, answered with `OK`
    Statement(Statement),
    /// a report, sent as `NOTIFYREPORT` and its sections
    Report(Report),
}

impl Notice {
    /// the command the notice is delivered with
    pub fn command(&self) -> String {
        match self {
            Notice::Statement(statement) => statement.command_str(),
            Notice::Report(_) => NOTIFY_INSERT_COMMAND.to_string(),
        }
    }
}

/// An entry on the live work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// apply work to the store
    Apply(DelayedWork),
    /// deliver a notice to a peer depot
    Notify {
        /// the peer to deliver to
        peer: PeerConfig,
        /// what to deliver
        notice: Notice,
    },
}

/// The live work queue, a crossbeam channel with an optional size limit.
///
/// Clones share the same channel.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl WorkQueue {
    /// Creates a queue that holds at most `max_size` jobs, or any number if `None`.
    pub fn new(max_size: Option<usize>) -> Self {
        let (tx, rx) = match max_size {
            Some(max) => channel::bounded(max),
            None => channel::unbounded(),
        };
        WorkQueue { tx, rx }
    }

    /// Adds `job` to the queue. Returns false if the queue is full.
    pub fn add(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!("Work queue full, dropping {:?}", job);
                false
            }
            // the queue holds its own receiver, so it can't be disconnected
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Adds `job` to the queue, waiting for room if it is full.
    pub fn submit(&self, job: Job) {
        if self.tx.send(job).is_err() {
            error!("Work queue disconnected");
        }
    }

    /// takes the next job, waiting up to `timeout` for one to arrive
    pub fn take_timeout(&self, timeout: Duration) -> Option<Job> {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => Some(job),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// takes the next job if one is waiting
    pub fn try_take(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    /// the number of jobs waiting
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// true if no jobs are waiting
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// A set of threads draining a [`WorkQueue`].
pub struct Workers {
    handles: Vec<(String, JoinHandle<()>)>,
    stop: Arc<AtomicBool>,
}

impl Workers {
    /// Starts `count` worker threads taking jobs from `queue`.
    pub fn start(count: usize, queue: WorkQueue, store: Arc<dyn Store>, connector: Connector) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("worker-{}", i);
            let worker = Worker {
                queue: queue.clone(),
                store: Arc::clone(&store),
                connector: connector.clone(),
                stop: Arc::clone(&stop),
            };
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())?;
            handles.push((name, handle));
        }
        debug!("Started {} workers", count);
        Ok(Workers { handles, stop })
    }

    /// Stops the workers, giving each up to `wait` to finish its current job.
    ///
    /// A worker that doesn't exit in time is left running and logged.
    pub fn shutdown(self, wait: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        for (name, handle) in self.handles {
            let deadline = Instant::now() + wait;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("{} panicked", name);
                }
            } else {
                warn!("Shutdown for {} failed", name);
            }
        }
        info!("Workers stopped");
    }
}

struct Worker {
    queue: WorkQueue,
    store: Arc<dyn Store>,
    connector: Connector,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            if let Some(job) = self.queue.take_timeout(POLL_INTERVAL) {
                self.perform(job);
            }
        }
    }

    // failures are logged, a bad job never takes down the worker
    fn perform(&self, job: Job) {
        match job {
            Job::Apply(work) => {
                if let Err(e) = self.store.apply(&work) {
                    error!("Unable to apply {}: {}", work, e);
                }
            }
            Job::Notify { peer, notice } => {
                let result = self.connector.connect_peer(&peer).and_then(|mut client| match &notice {
                    Notice::Statement(statement) => client.notify(statement),
                    Notice::Report(report) => client.notify_report(report),
                });
                if let Err(e) = result {
                    warn!("Unable to send {} command to {}: {}", notice.command(), peer.uri(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_header_forms() {
        assert_eq!(
            Report::parse_header("host1\nping -n 3\ntarget1").unwrap(),
            ("host1".into(), "ping -n 3".into(), Some("target1".into()))
        );
        assert_eq!(
            Report::parse_header("host1\nping -n 3\n").unwrap(),
            ("host1".into(), "ping -n 3".into(), None)
        );
        assert_eq!(
            Report::parse_header("host1 ping -n 3").unwrap(),
            ("host1".into(), "ping -n 3".into(), None)
        );
        assert!(Report::parse_header("host1").is_err());
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let queue = WorkQueue::new(Some(1));
        assert!(queue.add(Job::Apply(DelayedWork::suite("a"))));
        assert!(!queue.add(Job::Apply(DelayedWork::suite("b"))));
        assert_eq!(queue.try_take(), Some(Job::Apply(DelayedWork::suite("a"))));
        assert!(queue.is_empty());
    }

    #[test]
    fn workers_apply_jobs() {
        let queue = WorkQueue::new(None);
        let store = Arc::new(MemoryStore::new());
        let workers = Workers::start(2, queue.clone(), store.clone(), Connector::default()).unwrap();
        queue.submit(Job::Apply(DelayedWork::suite("<suite/>")));
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        workers.shutdown(Duration::from_secs(1));
        assert_eq!(store.items(), vec![DelayedWork::suite("<suite/>")]);
    }
}
