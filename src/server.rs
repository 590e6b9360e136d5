use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::handler::HandlerRegistry;
use crate::session::{serve, Authenticator, PlainAuthenticator};
use crate::thread_pool::ThreadPool;
use crate::Result;

// how often the accept loop checks for shutdown while no connection is waiting
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A TCP server speaking the statement protocol.
///
/// Every accepted connection is authenticated, then served on a thread from the [`ThreadPool`]:
/// statements are dispatched through the [`HandlerRegistry`] until the peer hangs up or a handler
/// closes the conversation. The connection holds its thread all that time, so with a bounded pool
/// later connections wait for an earlier one to close. [`NaiveThreadPool`](crate::NaiveThreadPool)
/// serves every connection at once.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use depot::{DepotServer, HandlerRegistry, NaiveThreadPool, ThreadPool};
/// use depot::handlers::register_common;
/// use depot::logging::LogControl;
/// use depot::permission::PermissionRegistry;
/// # fn main() -> depot::Result<()> {
/// let registry = HandlerRegistry::new();
/// let permissions = Arc::new(PermissionRegistry::new());
/// register_common(&registry, &permissions, &Arc::new(LogControl::detached()), None);
/// let server = DepotServer::new(registry, NaiveThreadPool::new(0)?);
/// server.run("127.0.0.1:6324")?;
/// # Ok(())
/// # }
/// ```
pub struct DepotServer<P: ThreadPool> {
    registry: HandlerRegistry,
    pool: P,
    authenticator: Arc<dyn Authenticator>,
    stop: Arc<AtomicBool>,
}

/// Stops a running [`DepotServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// asks the accept loop to return; connections already being served run to completion
    pub fn shutdown(&self) {
        debug!("Server shutdown requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// true once [`shutdown`](ShutdownHandle::shutdown) was called
    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl<P: ThreadPool> DepotServer<P> {
    /// Creates a server dispatching through `registry` on `pool`, accepting plain TCP.
    pub fn new(registry: HandlerRegistry, pool: P) -> Self {
        DepotServer {
            registry,
            pool,
            authenticator: Arc::new(PlainAuthenticator),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// replaces the way connections are authenticated, e.g. with TLS
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// a handle that stops this server's accept loop
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Binds `addr` and serves until shut down.
    ///
    /// # Errors
    /// [`DepotError::Io`](crate::DepotError::Io) if the address can't be bound.
    pub fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.run_on(listener)
    }

    /// Serves connections accepted on an already bound `listener` until shut down.
    pub fn run_on(&self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        info!("Listening on {}", listener.local_addr()?);
        while !self.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    self.spawn(stream, addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        info!("Server stopped");
        Ok(())
    }

    fn spawn(&self, stream: std::net::TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);
        let registry = self.registry.clone();
        let authenticator = Arc::clone(&self.authenticator);
        self.pool.spawn(move || {
            let connection = match authenticator.authenticate(stream) {
                Ok(connection) => connection,
                Err(e) => {
                    error!("Unable to authenticate {}: {}", addr, e);
                    return;
                }
            };
            if let Err(e) = serve(&registry, connection) {
                error!("Error on serving client {}: {}", addr, e);
            }
        });
    }
}
