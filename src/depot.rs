//! The depot service: the state every depot handler shares, and the startup, sync and shutdown
//! steps the server binary drives.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::read::DecoderReader;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::client::Connector;
use crate::config::DepotConfig;
use crate::error::{DepotError, Result};
use crate::handler::{HandlerRegistry, Relay};
use crate::handlers;
use crate::logging::LogControl;
use crate::peer::{self, PeerList};
use crate::permission::PermissionRegistry;
use crate::server::ShutdownHandle;
use crate::sync::{DelayedWorkQueue, SyncCoordinator};
use crate::work::{DelayedWork, Job, Notice, Store, WorkQueue, Workers};

const WORKER_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// A depot: its permissions, peers, sync state and work pipeline.
///
/// Built once at startup and shared, behind an `Arc`, by every handler.
pub struct Depot {
    config: DepotConfig,
    permissions: Arc<PermissionRegistry>,
    sync: SyncCoordinator,
    peers: PeerList,
    store: Arc<dyn Store>,
    log: Arc<LogControl>,
    connector: Connector,
    workers: Mutex<Option<Workers>>,
    server: Mutex<Option<ShutdownHandle>>,
}

impl Depot {
    /// Opens a depot from `config`, creating `var_dir` and the delayed work queue if needed.
    ///
    /// Nothing runs yet: call [`recover`](Depot::recover) and
    /// [`start_workers`](Depot::start_workers) before serving.
    ///
    /// # Errors
    /// [`DepotError::Config`] for an invalid configuration or peer URI, [`DepotError::Io`] or
    /// [`DepotError::Queue`] if the state directory or queue can't be opened.
    pub fn open(
        config: DepotConfig,
        store: Arc<dyn Store>,
        log: Arc<LogControl>,
        connector: Connector,
    ) -> Result<Arc<Depot>> {
        config.validate()?;
        fs::create_dir_all(&config.var_dir)?;
        let permissions = Arc::new(PermissionRegistry::with_path(config.permissions_path()));
        let delayed = DelayedWorkQueue::open(&config.work_queue_path())?;
        let sync = SyncCoordinator::new(delayed, WorkQueue::new(config.queue_size));
        let peers = PeerList::new(config.local_uri());
        for uri in &config.peers {
            peers.add(uri)?;
        }
        Ok(Arc::new(Depot {
            config,
            permissions,
            sync,
            peers,
            store,
            log,
            connector,
            workers: Mutex::new(None),
            server: Mutex::new(None),
        }))
    }

    /// the configuration the depot was opened with
    pub fn config(&self) -> &DepotConfig {
        &self.config
    }

    /// the permission table
    pub fn permissions(&self) -> &Arc<PermissionRegistry> {
        &self.permissions
    }

    /// the sync state machine
    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    /// the known peer depots
    pub fn peers(&self) -> &PeerList {
        &self.peers
    }

    /// the data store
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// logging control for `LOGCONFIG` and `GETLOG`
    pub fn log(&self) -> &Arc<LogControl> {
        &self.log
    }

    /// the live work queue
    pub fn work_queue(&self) -> &WorkQueue {
        self.sync.live_queue()
    }

    /// a registry answering every depot command
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        handlers::register_depot(&registry, self);
        registry
    }

    /// Hands `work` to the pipeline, delaying it while the work queue is locked.
    pub fn submit(&self, work: DelayedWork) -> Result<()> {
        self.sync.submit(work)
    }

    /// Deals with delayed work a previous run left behind, resubmitting it if the depot was
    /// configured to recover and discarding it otherwise.
    pub fn recover(&self) -> Result<usize> {
        self.sync.recover(self.config.recover)
    }

    /// Starts the threads draining the live work queue. Does nothing if they are running.
    pub fn start_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.is_none() {
            *workers = Some(Workers::start(
                self.config.workers,
                self.work_queue().clone(),
                Arc::clone(&self.store),
                self.connector.clone(),
            )?);
        }
        Ok(())
    }

    /// Remembers the accept loop serving this depot, so [`shutdown`](Depot::shutdown) can stop it.
    pub fn attach_server(&self, handle: ShutdownHandle) {
        *self.server.lock() = Some(handle);
    }

    /// Registers with every configured peer. Returns how many accepted.
    pub fn register_with_peers(&self) -> usize {
        peer::register_with_peers(&self.peers, &self.permissions, &self.connector)
    }

    /// Pulls a snapshot from the first reachable peer and loads it into the store.
    ///
    /// Starts a sync request unless one is already under way. New work is delayed until the
    /// snapshot is loaded, then released onto the live queue. The sync is ended whether or not
    /// the pull succeeds, so no delayed work is stranded.
    #[instrument(skip(self))]
    pub fn synchronize(&self) -> Result<usize> {
        if !self.sync.requesting_sync() {
            self.sync.start_sync_request()?;
        }
        let result = self.pull_snapshot();
        if let Err(e) = &result {
            error!("Synchronization failed: {}", e);
        }
        let ended = self.sync.end_sync();
        let loaded = result?;
        ended?;
        info!("Synchronized {} items from peer", loaded);
        Ok(loaded)
    }

    fn pull_snapshot(&self) -> Result<usize> {
        let path = self.read_sync_data(false)?;
        let loaded = load_sync_data(self.store.as_ref(), &path);
        if let Err(e) = fs::remove_file(&path) {
            warn!("Unable to remove {}: {}", path.display(), e);
        }
        let loaded = loaded?;
        let released = self.sync.remove_sync_lock()?;
        debug!("Released {} delayed items after loading snapshot", released);
        Ok(loaded)
    }

    /// Downloads a snapshot from a peer with `SYNCDUMP` and leaves it in `var_dir`, returning
    /// the file it was saved to. The snapshot is base64 text.
    pub fn dump_sync_data(&self) -> Result<PathBuf> {
        let path = self.read_sync_data(true)?;
        info!("Saved sync dump to {}", path.display());
        Ok(path)
    }

    fn read_sync_data(&self, dump: bool) -> Result<PathBuf> {
        let path = self.config.sync_download_path();
        for peer in self.peers.peers() {
            let result = self
                .connector
                .connect_peer(&peer)
                .and_then(|mut client| client.request_sync(dump, &path));
            match result {
                Ok(bytes) => {
                    debug!("Read {} bytes of sync data from {}", bytes, peer);
                    return Ok(path);
                }
                Err(e) => warn!("Unable to get sync data from {}: {}", peer, e),
            }
        }
        Err(DepotError::protocol("Unable to get sync data from any peer"))
    }

    /// Stops the accept loop, if one is attached, and the workers.
    pub fn shutdown(&self) {
        if let Some(server) = self.server.lock().take() {
            server.shutdown();
        }
        if let Some(workers) = self.workers.lock().take() {
            workers.shutdown(WORKER_SHUTDOWN_WAIT);
        }
        info!("Depot shut down");
    }
}

impl Relay for Depot {
    fn relay(&self, notice: Notice) {
        for peer in self.peers.peers() {
            debug!("Queueing {} for {}", notice.command(), peer);
            self.work_queue().add(Job::Notify {
                peer,
                notice: notice.clone(),
            });
        }
    }
}

/// Replaces the contents of `store` with the base64 snapshot saved at `path`.
pub fn load_sync_data(store: &dyn Store, path: &Path) -> Result<usize> {
    let file = BufReader::new(File::open(path)?);
    let mut decoder = DecoderReader::new(file, &STANDARD);
    store.load_snapshot(&mut decoder)
}
