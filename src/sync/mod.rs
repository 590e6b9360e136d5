//! The depot-to-depot synchronization state machine.
//!
//! ```text
//!                    start_sync_request              remove_sync_lock
//! NotSynchronizing ---------------------> RequestingSyncLocked ---------> RequestingSyncUnlocked
//!        |   ^                                      |                              |
//!        |   +------------------ end_sync ----------+------------------------------+
//!        |   |
//!        |   +------------------ end_sync ---------------+
//!        | start_sync_response                            |
//!        +------------------------------------------> RespondingToSync
//! ```
//!
//! While the work queue is locked (`RequestingSyncLocked` or `RespondingToSync`) new work is
//! diverted into a durable [`DelayedWorkQueue`] instead of the live [`WorkQueue`], so the snapshot
//! being taken or loaded doesn't race with it. Releasing the lock replays the delayed work onto the
//! live queue in arrival order.

mod queue;

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{DepotError, Result};
use crate::work::{DelayedWork, Job, WorkQueue};

pub use self::queue::DelayedWorkQueue;

/// Where the depot is in a synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// no sync in progress
    NotSynchronizing,
    /// pulling a snapshot from a peer, new work is delayed
    RequestingSyncLocked,
    /// loading a pulled snapshot, new work flows normally again
    RequestingSyncUnlocked,
    /// serving a snapshot to a peer, new work is delayed
    RespondingToSync,
}

impl SyncState {
    fn is_locked(self) -> bool {
        matches!(self, SyncState::RequestingSyncLocked | SyncState::RespondingToSync)
    }

    fn is_requesting(self) -> bool {
        matches!(
            self,
            SyncState::RequestingSyncLocked | SyncState::RequestingSyncUnlocked
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::NotSynchronizing => "not synchronizing",
            SyncState::RequestingSyncLocked => "requesting sync (locked)",
            SyncState::RequestingSyncUnlocked => "requesting sync (unlocked)",
            SyncState::RespondingToSync => "responding to sync",
        };
        f.write_str(name)
    }
}

/// Owns the sync state and decides where new work goes.
///
/// The state and the delayed queue sit behind one lock, so a routing decision and the transition
/// that would change it can't interleave.
#[derive(Debug)]
pub struct SyncCoordinator {
    state: Mutex<SyncState>,
    delayed: DelayedWorkQueue,
    live: WorkQueue,
}

impl SyncCoordinator {
    /// creates a coordinator diverting into `delayed` and releasing onto `live`
    pub fn new(delayed: DelayedWorkQueue, live: WorkQueue) -> Self {
        SyncCoordinator {
            state: Mutex::new(SyncState::NotSynchronizing),
            delayed,
            live,
        }
    }

    /// the current state
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// the live work queue
    pub fn live_queue(&self) -> &WorkQueue {
        &self.live
    }

    /// the number of items waiting in the delayed queue
    pub fn delayed_len(&self) -> usize {
        let _state = self.state.lock();
        self.delayed.len()
    }

    /// Begins pulling a snapshot from a peer, locking the work queue.
    ///
    /// # Errors
    /// [`DepotError::Protocol`] if a sync is already in progress.
    pub fn start_sync_request(&self) -> Result<()> {
        self.start(SyncState::RequestingSyncLocked)
    }

    /// Begins serving a snapshot to a peer, locking the work queue.
    ///
    /// # Errors
    /// [`DepotError::Protocol`] if a sync is already in progress.
    pub fn start_sync_response(&self) -> Result<()> {
        self.start(SyncState::RespondingToSync)
    }

    fn start(&self, next: SyncState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SyncState::NotSynchronizing {
            return Err(DepotError::protocol("synchronizing"));
        }
        debug!("Starting synchronization: {}", next);
        *state = next;
        Ok(())
    }

    /// true while pulling a snapshot, locked or not
    pub fn requesting_sync(&self) -> bool {
        self.state().is_requesting()
    }

    /// true while serving a snapshot
    pub fn responding_to_sync(&self) -> bool {
        self.state() == SyncState::RespondingToSync
    }

    /// true in any state but [`SyncState::NotSynchronizing`]
    pub fn sync_in_progress(&self) -> bool {
        self.state() != SyncState::NotSynchronizing
    }

    /// true while new work must be delayed
    pub fn work_queue_is_locked(&self) -> bool {
        self.state().is_locked()
    }

    /// Queues `work` durably if the work queue is locked. Returns false, leaving the work to the
    /// caller, if it isn't.
    pub fn add_delayed_work(&self, work: &DelayedWork) -> Result<bool> {
        let state = self.state.lock();
        if !state.is_locked() {
            return Ok(false);
        }
        debug!("Delaying {}", work);
        self.delayed.push(work)?;
        Ok(true)
    }

    /// Routes `work` to the delayed queue if the work queue is locked, else onto the live queue.
    ///
    /// # Errors
    /// [`DepotError::Protocol`] if the live queue is full, so the sender can try again later.
    pub fn submit(&self, work: DelayedWork) -> Result<()> {
        let state = self.state.lock();
        if state.is_locked() {
            debug!("Delaying {}", work);
            self.delayed.push(&work)?;
        } else if !self.live.add(Job::Apply(work)) {
            return Err(DepotError::protocol("Work queue full"));
        }
        Ok(())
    }

    /// Releases the work queue lock, moving every delayed item onto the live queue in the order
    /// it arrived. Returns the number of items moved; does nothing if the queue isn't locked.
    pub fn remove_sync_lock(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.unlock(&mut state)
    }

    fn unlock(&self, state: &mut SyncState) -> Result<usize> {
        if !state.is_locked() {
            return Ok(0);
        }
        debug!("Removing synchronization work queue lock");
        let work = self.delayed.drain()?;
        let moved = work.len();
        for item in work {
            self.live.submit(Job::Apply(item));
        }
        if *state == SyncState::RequestingSyncLocked {
            *state = SyncState::RequestingSyncUnlocked;
        }
        debug!("Added {} delayed work items to the work queue", moved);
        Ok(moved)
    }

    /// Ends the current sync, releasing the lock first if it is still held.
    pub fn end_sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == SyncState::NotSynchronizing {
            return Ok(());
        }
        debug!("Ending synchronization");
        let result = self.unlock(&mut state).map(|_| ());
        *state = SyncState::NotSynchronizing;
        result
    }

    /// Deals with work left in the delayed queue by a previous run: resubmits it to the live queue
    /// if `resubmit` is set, otherwise throws it away. Returns the number of items found.
    pub fn recover(&self, resubmit: bool) -> Result<usize> {
        let _state = self.state.lock();
        if self.delayed.is_empty() {
            return Ok(0);
        }
        if !resubmit {
            let stale = self.delayed.len();
            info!("Discarding {} stale items from the delayed work queue", stale);
            self.delayed.clear()?;
            return Ok(stale);
        }
        let work = self.delayed.drain()?;
        let recovered = work.len();
        for item in work {
            self.live.submit(Job::Apply(item));
        }
        info!("Recovered {} items from the delayed work queue", recovered);
        Ok(recovered)
    }
}
