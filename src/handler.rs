//! Command dispatch.
//!
//! A [`HandlerRegistry`] maps command words to factories. [`HandlerRegistry::dispatch`] peeks at
//! the next command on a connection, builds the matching [`MessageHandler`] and hands it back
//! without consuming anything, so the handler reads the whole statement itself.

use std::io::{self, Read, Write};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::error::{DepotError, Result};
use crate::protocol::{ProtocolReader, ProtocolWriter, Statement};
use crate::session::Session;
use crate::work::Notice;

/// the reading half of a connection, as seen by handlers
pub type Reader = ProtocolReader<Box<dyn Read + Send>>;

/// the writing half of a connection, as seen by handlers
pub type Writer = ProtocolWriter<Box<dyn Write + Send>>;

/// What a session does once a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversation {
    /// read the next statement
    Continue,
    /// close the connection
    Close,
}

/// Services one request.
///
/// A handler is built fresh for every statement it handles. It must read its statement (and any
/// follow-up statements the command carries) from `reader`, and write its reply to `writer`.
pub trait MessageHandler: Send {
    /// Handles the next statement on the connection for the peer described by `session`.
    ///
    /// # Errors
    /// Fatal errors ([`DepotError::is_fatal`]) close the connection; any other error is sent back
    /// to the peer as an `ERROR` reply.
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation>;
}

/// builds a handler for one statement
pub type HandlerFactory = Arc<dyn Fn() -> Result<Box<dyn MessageHandler>> + Send + Sync>;

/// Maps command words to handler factories.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: Arc<DashMap<String, HandlerFactory>>,
}

impl HandlerRegistry {
    /// creates an empty registry
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Associates `command` with `factory`. A later registration for the same command wins.
    pub fn register<F>(&self, command: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn MessageHandler>> + Send + Sync + 'static,
    {
        debug!("Registering handler for '{}'", command);
        self.factories.insert(command.to_string(), Arc::new(factory));
    }

    /// true if a handler is registered for `command`
    pub fn is_registered(&self, command: &str) -> bool {
        self.factories.contains_key(command)
    }

    /// Picks the handler for the next statement on `reader` without consuming the statement.
    ///
    /// Returns `Ok(None)` when the peer closed the connection at a statement boundary.
    ///
    /// # Errors
    /// - [`DepotError::Framing`] if the command can't be peeked
    /// - [`DepotError::Protocol`] if no handler is registered for it
    /// - [`DepotError::Io`] if the factory fails to build a handler
    pub fn dispatch<R: Read>(&self, reader: &mut ProtocolReader<R>) -> Result<Option<Box<dyn MessageHandler>>> {
        let command = match reader.peek_command()? {
            Some(command) => command,
            None => return Ok(None),
        };
        // clone the factory out so the map shard isn't locked while it runs
        let factory = match self.factories.get(&command) {
            Some(factory) => Arc::clone(factory.value()),
            None => {
                error!("Unknown command '{}'", command);
                return Err(DepotError::protocol(format!("Unknown command '{}'", command)));
            }
        };
        let handler = factory().map_err(|e| {
            DepotError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("Unable to create handler for '{}': {}", command, e),
            ))
        })?;
        Ok(Some(handler))
    }
}

/// Writes `message` as an `ERROR` reply, logging instead of failing if the write fails.
pub fn error_reply(writer: &mut Writer, message: &str) {
    error!("{}", message);
    if let Err(e) = writer.write_statement(&Statement::error(message)) {
        error!("Unable to send error reply: {}", e);
    }
}

/// Something that forwards changes to this depot's peers.
///
/// Handlers for mutating commands hand a [`Notice`] to a relay after servicing the request
/// locally, so peer depots see the same change.
pub trait Relay: Send + Sync {
    /// queues `notice` for delivery to every peer
    fn relay(&self, notice: Notice);
}
