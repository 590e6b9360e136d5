//! The client side of the protocol, used by `depot-client` and by depots talking to their peers.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
#[cfg(feature = "tls")]
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{DepotError, Result};
use crate::peer::PeerConfig;
use crate::protocol::{
    quote, ProtocolReader, ProtocolWriter, Statement, END_QUERY_RESULTS_COMMAND, FAILURE_COMMAND,
    GET_LOG_COMMAND, INSERT_COMMAND, INSERT_STDERR_COMMAND, INSERT_STDOUT_COMMAND,
    INSERT_SYSUSAGE_COMMAND, LOG_CONFIG_COMMAND, NOTIFY_INSERT_COMMAND, NOTIFY_PERMIT_COMMAND,
    NOTIFY_SUITE_UPDATE_COMMAND, PERMIT_COMMAND, PING_COMMAND, PROTOCOL_VERSION,
    QUERY_RESULT_COMMAND, REGISTER_PEER_COMMAND, REVOKE_ALL_COMMAND, REVOKE_COMMAND,
    START_COMMAND, SUCCESS_COMMAND, SUITE_UPDATE_COMMAND, SYNC_COMMAND, SYNC_DUMP_COMMAND,
};
use crate::work::Report;

/// the number of consecutive read timeouts a client tolerates by default
pub const DEFAULT_READ_RETRIES: u32 = 10;

/// Wraps a reader whose socket has a read timeout, retrying timed out reads up to a budget.
///
/// The budget is for consecutive timeouts; any successful read resets it. Once it is spent the
/// timeout is returned as a hard I/O error.
pub struct RetryingReader<R: Read> {
    inner: R,
    retries: u32,
    failed: u32,
}

impl<R: Read> RetryingReader<R> {
    /// wraps `inner`, tolerating `retries` consecutive timeouts
    pub fn new(inner: R, retries: u32) -> Self {
        RetryingReader {
            inner,
            retries,
            failed: 0,
        }
    }
}

impl<R: Read> Read for RetryingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => {
                    self.failed = 0;
                    return Ok(n);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    self.failed += 1;
                    if self.failed > self.retries {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("read timed out {} times", self.failed),
                        ));
                    }
                    debug!("Read timed out, retry {} of {}", self.failed, self.retries);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// How clients reach a depot: timeouts, and TLS when built with the `tls` feature.
#[derive(Clone)]
pub struct Connector {
    read_timeout: Option<Duration>,
    retries: u32,
    #[cfg(feature = "tls")]
    tls: Option<Arc<crate::tls::ClientTls>>,
}

impl Default for Connector {
    fn default() -> Self {
        Connector {
            read_timeout: None,
            retries: DEFAULT_READ_RETRIES,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Connector {
    /// a plain connector with no read timeout
    pub fn new() -> Self {
        Connector::default()
    }

    /// sets the socket read timeout and how many consecutive timeouts a read tolerates
    pub fn read_timeout(mut self, timeout: Duration, retries: u32) -> Self {
        self.read_timeout = Some(timeout);
        self.retries = retries;
        self
    }

    /// connects over TLS using `tls`
    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: Arc<crate::tls::ClientTls>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// connects to the depot at `address` (`host:port`)
    pub fn connect(&self, address: &str) -> Result<DepotClient> {
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(self.read_timeout)?;
        debug!("Connected to {}", address);

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
            let (reader, writer, peer_identity) = tls.connect(stream, host)?;
            return Ok(DepotClient::from_parts(
                Box::new(RetryingReader::new(reader, self.retries)),
                writer,
                tls.local_identity().map(String::from),
                peer_identity,
            ));
        }

        let writer = stream.try_clone()?;
        Ok(DepotClient::from_parts(
            Box::new(RetryingReader::new(stream, self.retries)),
            Box::new(writer),
            None,
            None,
        ))
    }

    /// connects to `peer`
    pub fn connect_peer(&self, peer: &PeerConfig) -> Result<DepotClient> {
        self.connect(peer.address())
    }
}

/// A client for the depot protocol.
///
/// Every request is a dialog: the client writes one or more statements and reads the reply. An
/// `ERROR` reply becomes [`DepotError::Remote`].
pub struct DepotClient {
    reader: ProtocolReader<Box<dyn Read + Send>>,
    writer: ProtocolWriter<Box<dyn Write + Send>>,
    local_identity: Option<String>,
    peer_identity: Option<String>,
}

impl DepotClient {
    /// connects, without TLS or read timeouts, to the depot at `addr`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let writer = stream.try_clone()?;
        Ok(DepotClient::from_parts(Box::new(stream), Box::new(writer), None, None))
    }

    /// builds a client over already connected halves
    pub fn from_parts(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        local_identity: Option<String>,
        peer_identity: Option<String>,
    ) -> Self {
        DepotClient {
            reader: ProtocolReader::new(reader),
            writer: ProtocolWriter::new(writer),
            local_identity,
            peer_identity,
        }
    }

    /// the identity this client authenticated as, `None` without TLS
    pub fn local_identity(&self) -> Option<&str> {
        self.local_identity.as_deref()
    }

    /// the identity the server authenticated as, `None` without TLS
    pub fn peer_identity(&self) -> Option<&str> {
        self.peer_identity.as_deref()
    }

    /// writes `statement` to the server
    pub fn write(&mut self, statement: &Statement) -> Result<()> {
        self.writer.write_statement(statement)
    }

    /// reads the next statement from the server, failing if it hung up
    pub fn read(&mut self) -> Result<Statement> {
        self.reader.read_statement()?.ok_or_else(|| {
            DepotError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Server closed connection",
            ))
        })
    }

    /// Sends `statement`, then reads the reply and returns its payload.
    ///
    /// # Errors
    /// [`DepotError::Remote`] if the server replied `ERROR`, [`DepotError::Protocol`] if it
    /// replied with anything but `OK`.
    pub fn notify(&mut self, statement: &Statement) -> Result<String> {
        self.write(statement)?;
        self.reply_to(&statement.command_str())
    }

    /// sends `command data` and returns the payload of the `OK` reply
    pub fn dialog(&mut self, command: &str, data: &str) -> Result<String> {
        self.notify(&Statement::new(command, data))
    }

    fn reply_to(&mut self, command: &str) -> Result<String> {
        let reply = self.read()?;
        check_reply(command, reply)
    }

    /// Verifies the server speaks this build's protocol version.
    pub fn start(&mut self) -> Result<String> {
        self.dialog(START_COMMAND, PROTOCOL_VERSION)
    }

    /// sends `PING text`, returning the echoed text
    pub fn ping(&mut self, text: &str) -> Result<String> {
        self.dialog(PING_COMMAND, text)
    }

    /// grants `action` to every identity in `names`
    pub fn permit(&mut self, names: &[&str], action: &str) -> Result<()> {
        let data = format!("{} {}", quote(&names.join("\n")), action);
        self.dialog(PERMIT_COMMAND, &data).map(|_| ())
    }

    /// tells a peer depot that `name` was granted `action`
    pub fn notify_permit(&mut self, name: &str, action: &str) -> Result<()> {
        let data = format!("{} {}", quote(name), action);
        self.dialog(NOTIFY_PERMIT_COMMAND, &data).map(|_| ())
    }

    /// takes `action` away from `name`
    pub fn revoke(&mut self, name: &str, action: &str) -> Result<()> {
        let data = format!("{} {}", quote(name), action);
        self.dialog(REVOKE_COMMAND, &data).map(|_| ())
    }

    /// takes `action` away from everyone
    pub fn revoke_all(&mut self, action: &str) -> Result<()> {
        self.dialog(REVOKE_ALL_COMMAND, action).map(|_| ())
    }

    /// fetches the server's log
    pub fn get_log(&mut self) -> Result<String> {
        self.notify(&Statement::command_only(GET_LOG_COMMAND))
    }

    /// changes the server's logging, `setting` is `property=value`
    pub fn log_config(&mut self, setting: &str) -> Result<()> {
        self.dialog(LOG_CONFIG_COMMAND, setting).map(|_| ())
    }

    /// Registers the depot at `uri` with the server, returning the server's permission document.
    pub fn register_peer(&mut self, uri: &str) -> Result<String> {
        self.dialog(REGISTER_PEER_COMMAND, uri)
    }

    /// uploads `report`, returning the context the server acknowledged
    pub fn send_report(&mut self, report: &Report) -> Result<String> {
        self.send_insert(INSERT_COMMAND, report)
    }

    /// forwards `report` to a peer depot
    pub fn notify_report(&mut self, report: &Report) -> Result<String> {
        self.send_insert(NOTIFY_INSERT_COMMAND, report)
    }

    fn send_insert(&mut self, command: &str, report: &Report) -> Result<String> {
        self.write(&Statement::new(command, report.header()))?;
        if let Some(stderr) = &report.stderr {
            self.write(&Statement::new(INSERT_STDERR_COMMAND, stderr.as_str()))?;
        }
        self.write(&Statement::new(INSERT_STDOUT_COMMAND, report.stdout.as_str()))?;
        self.write(&Statement::new(INSERT_SYSUSAGE_COMMAND, report.sysusage.as_str()))?;
        self.reply_to(command)
    }

    /// sends a suite update document
    pub fn send_suite(&mut self, xml: &str) -> Result<String> {
        self.dialog(SUITE_UPDATE_COMMAND, xml)
    }

    /// forwards a suite update document to a peer depot
    pub fn notify_suite(&mut self, xml: &str) -> Result<String> {
        self.dialog(NOTIFY_SUITE_UPDATE_COMMAND, xml)
    }

    /// Sends `request` and collects the rows of a `QUERYRESULT`...`QUERYEND` reply.
    pub fn query(&mut self, request: &Statement) -> Result<Vec<String>> {
        self.write(request)?;
        let mut rows = Vec::new();
        loop {
            let reply = self.read()?;
            if reply.is(QUERY_RESULT_COMMAND) {
                rows.push(reply.payload_str());
            } else if reply.is(END_QUERY_RESULTS_COMMAND) {
                return Ok(rows);
            } else {
                check_reply(&request.command_str(), reply)?;
                return Err(DepotError::protocol("Query reply ended without QUERYEND"));
            }
        }
    }

    /// Requests a sync snapshot and saves its base64 payload to `path`, returning the number of
    /// payload bytes saved. With `dump` set the server is asked for `SYNCDUMP`, which doesn't
    /// mark it as synchronizing.
    ///
    /// The payload streams straight to the file. If the server answers `ERROR`, the file is
    /// removed.
    pub fn request_sync(&mut self, dump: bool, path: &Path) -> Result<u64> {
        let command = if dump { SYNC_DUMP_COMMAND } else { SYNC_COMMAND };
        self.write(&Statement::command_only(command))?;
        debug!("Downloading peer sync data to {}", path.display());

        let reply = {
            let mut file = BufWriter::new(File::create(path)?);
            let reply = self.reader.read_statement_to(&mut file)?;
            file.flush()?;
            reply
        };
        let reply = match reply {
            Some(reply) => reply,
            None => {
                remove_quietly(path);
                return Err(DepotError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Server closed connection",
                )));
            }
        };
        if reply != SUCCESS_COMMAND.as_bytes() {
            let message = fs::read_to_string(path).unwrap_or_default();
            remove_quietly(path);
            return Err(DepotError::Remote {
                command: command.to_string(),
                message,
            });
        }
        // a server that fails part way through still terminates the payload, then says why
        if let Ok(Some(next)) = self.reader.peek_command() {
            if next == FAILURE_COMMAND {
                let message = self.read()?.payload_str();
                remove_quietly(path);
                return Err(DepotError::Remote {
                    command: command.to_string(),
                    message,
                });
            }
        }
        Ok(fs::metadata(path)?.len())
    }
}

fn check_reply(command: &str, reply: Statement) -> Result<String> {
    if reply.is(SUCCESS_COMMAND) {
        Ok(reply.payload_str())
    } else if reply.is(FAILURE_COMMAND) {
        Err(DepotError::Remote {
            command: command.to_string(),
            message: reply.payload_str(),
        })
    } else {
        Err(DepotError::protocol(format!(
            "Unexpected reply to {}: '{}'",
            command, reply
        )))
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Unable to remove {}: {}", path.display(), e);
    }
}
