#![warn(missing_docs)]
//! A monitoring depot: a multithreaded server that collects reporter results, guards its
//! commands with a permission table, and replicates with peer depots.
//!
//! Clients, reporters and peer depots all speak the same line oriented protocol. Every message is
//! a [`Statement`], a command word and an optional payload terminated by CRLF. The crate provides
//! the [`DepotServer`] and a [`DepotClient`], plus the `depot-server` and `depot-client`
//! executables built on them.
//!
//! ## Commands
//! Every server answers `PING`, `START`, `PERMIT`, `REVOKE`, `REVOKEALL`, `LOGCONFIG` and
//! `GETLOG`. A depot adds report ingestion (`REPORT`, `RESEND`), suite updates (`SUITE`), and the
//! depot to depot commands (`NOTIFYREPORT`, `NOTIFYSUITE`, `NOTIFYPERMIT`, `REGISTER_PEER`,
//! `SYNC`, `SYNCDUMP`, `SYNCSTART`, `SYNCEND`). Each command is serviced by a
//! [`MessageHandler`] looked up in a [`HandlerRegistry`].
//!
//! ## Permissions
//! The [`PermissionRegistry`](permission::PermissionRegistry) decides which authenticated
//! identities may perform which actions. An action nobody was granted is open to everyone; once
//! anyone is granted it, only grantees may perform it. Peer depots are trusted with everything.
//! The table persists to a properties file and is exchanged with peers as an XML document.
//!
//! ## Synchronization
//! A depot starting up can pull a snapshot of its store from a peer. While a snapshot is being
//! taken or loaded, new work is diverted into a durable sled backed queue and replayed in order
//! once the snapshot is in place; see [`SyncCoordinator`].
//!
//! ## Client / Server executables
//! `depot-server` runs a depot, optionally registering with and synchronizing from peers.
//! `depot-client` sends single commands to a running server.

pub use client::{Connector, DepotClient};
pub use config::DepotConfig;
pub use depot::Depot;
pub use error::{DepotError, Result};
pub use handler::{Conversation, HandlerRegistry, MessageHandler, Relay};
pub use peer::{PeerConfig, PeerList};
pub use protocol::{ProtocolReader, ProtocolWriter, Statement};
pub use server::{DepotServer, ShutdownHandle};
pub use session::{Authenticator, Connection, PlainAuthenticator, Session};
pub use sync::{DelayedWorkQueue, SyncCoordinator, SyncState};
pub use thread_pool::{NaiveThreadPool, RayonThreadPool, SharedQueueThreadPool, ThreadPool};
pub use work::{DelayedWork, Job, MemoryStore, Notice, Report, Store, WorkQueue, Workers};

pub mod client;
pub mod config;
pub mod depot;
mod error;
pub mod handler;
pub mod handlers;
pub mod logging;
pub mod peer;
pub mod permission;
pub mod protocol;
mod server;
pub mod session;
pub mod sync;
pub mod thread_pool;
#[cfg(feature = "tls")]
pub mod tls;
pub mod work;
