//! One accepted connection: who is on the other end, and the command loop that services it.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::handler::{error_reply, Conversation, HandlerRegistry, Reader, Writer};
use crate::protocol::{ProtocolReader, ProtocolWriter};

/// The authenticated peer of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    identity: Option<String>,
    peer_addr: Option<SocketAddr>,
}

impl Session {
    /// creates a session for `identity` (`None` for an unauthenticated peer) at `peer_addr`
    pub fn new(identity: Option<String>, peer_addr: Option<SocketAddr>) -> Self {
        Session { identity, peer_addr }
    }

    /// an unauthenticated session with no known address
    pub fn anonymous() -> Self {
        Session::default()
    }

    /// the peer's identity, `None` if it didn't authenticate
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// the peer's socket address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// the identity as it appears in log and error messages
    pub fn display_identity(&self) -> &str {
        self.identity().unwrap_or("anonymous")
    }
}

/// An accepted and authenticated connection, split into halves.
pub struct Connection {
    /// the reading half
    pub reader: Box<dyn Read + Send>,
    /// the writing half
    pub writer: Box<dyn Write + Send>,
    /// who is on the other end
    pub session: Session,
}

/// Turns an accepted TCP stream into a [`Connection`], establishing the peer's identity.
pub trait Authenticator: Send + Sync {
    /// authenticates the peer on `stream`
    fn authenticate(&self, stream: TcpStream) -> Result<Connection>;
}

/// Accepts every connection as anonymous, without encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAuthenticator;

impl Authenticator for PlainAuthenticator {
    fn authenticate(&self, stream: TcpStream) -> Result<Connection> {
        let peer_addr = stream.peer_addr().ok();
        let writer = stream.try_clone()?;
        Ok(Connection {
            reader: Box::new(stream),
            writer: Box::new(writer),
            session: Session::new(None, peer_addr),
        })
    }
}

/// Runs the command loop on `connection` until the peer hangs up, a handler closes the
/// conversation, or a fatal error occurs.
///
/// Handlers that fail with a recoverable error get an `ERROR` reply sent on their behalf and the
/// loop goes on. If the failure happened before the handler consumed its statement, the statement
/// is skipped so it isn't dispatched again.
#[instrument(skip_all, fields(peer = %connection.session.display_identity()))]
pub fn serve(registry: &HandlerRegistry, connection: Connection) -> Result<()> {
    let Connection {
        reader,
        writer,
        session,
    } = connection;
    let mut reader: Reader = ProtocolReader::new(reader);
    let mut writer: Writer = ProtocolWriter::new(writer);
    debug!("Serving {:?}", session.peer_addr());

    loop {
        let read_before = reader.statements_read();
        let result = registry.dispatch(&mut reader).and_then(|handler| match handler {
            Some(mut handler) => handler.execute(&mut reader, &mut writer, &session).map(Some),
            None => Ok(None),
        });
        match result {
            Ok(Some(Conversation::Continue)) => continue,
            Ok(Some(Conversation::Close)) => {
                debug!("Handler closed the conversation");
                return Ok(());
            }
            Ok(None) => {
                debug!("Connection from {} ended", session.display_identity());
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                warn!("Closing connection after fatal error: {}", e);
                error_reply(&mut writer, &e.to_string());
                return Err(e);
            }
            Err(e) => {
                if reader.statements_read() == read_before {
                    match reader.skip_statement() {
                        Ok(_) => {}
                        Err(skip_err) => {
                            error!("Unable to skip failed statement: {}", skip_err);
                            return Err(skip_err);
                        }
                    }
                }
                info!("Request from {} failed: {}", session.display_identity(), e);
                error_reply(&mut writer, &e.to_string());
            }
        }
    }
}
