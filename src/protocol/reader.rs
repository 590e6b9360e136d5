use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};

use tracing::{debug, error};

use super::Statement;
use crate::error::{DepotError, Result};

/// the longest command word a statement may start with
pub const MAX_COMMAND_LENGTH: usize = 512;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const SP: u8 = b' ';

// payload bytes are handed to the caller's sink in chunks of this size
const CHUNK_SIZE: usize = 8192;

/// Reads [`Statement`]s off a byte stream.
///
/// Besides reading whole statements the reader can [peek](ProtocolReader::peek_command) at the
/// command of the next statement without consuming it, which is how the
/// [`HandlerRegistry`](crate::HandlerRegistry) picks a handler while leaving the statement for the
/// handler to read. Peeked bytes are kept in a look-ahead buffer that later reads drain first.
pub struct ProtocolReader<R: Read> {
    inner: BufReader<R>,
    // bytes read from `inner` by a peek but not yet consumed
    lookahead: VecDeque<u8>,
    // number of complete statements consumed so far
    consumed: u64,
}

impl<R: Read> ProtocolReader<R> {
    /// wraps `inner` in a buffering protocol reader
    pub fn new(inner: R) -> Self {
        ProtocolReader {
            inner: BufReader::new(inner),
            lookahead: VecDeque::new(),
            consumed: 0,
        }
    }

    /// the number of statements this reader has consumed
    pub fn statements_read(&self) -> u64 {
        self.consumed
    }

    /// Returns the command of the next statement without consuming it, or `None` if the peer
    /// closed the stream at a statement boundary.
    ///
    /// The command ends at the first space or CRLF. A CR not followed by LF is part of the command,
    /// as it is for [`read_statement`](ProtocolReader::read_statement).
    ///
    /// # Errors
    /// [`DepotError::Framing`] if the stream ends part way through a command, or if more than
    /// [`MAX_COMMAND_LENGTH`] bytes arrive without a terminator.
    pub fn peek_command(&mut self) -> Result<Option<String>> {
        let mut len = 0;
        loop {
            let b = match self.peek_byte(len)? {
                Some(b) => b,
                None if len > 0 => return Err(unterminated()),
                None => {
                    debug!("Peer closed connection");
                    return Ok(None);
                }
            };
            if b == SP {
                break;
            }
            if b == CR {
                match self.peek_byte(len + 1)? {
                    Some(LF) => break,
                    Some(_) => {}
                    None => return Err(unterminated()),
                }
            }
            if len == MAX_COMMAND_LENGTH {
                return Err(too_long());
            }
            len += 1;
        }
        let command: Vec<u8> = self.lookahead.iter().take(len).copied().collect();
        let command = String::from_utf8_lossy(&command).into_owned();
        debug!("Peeked at '{}'", command);
        Ok(Some(command))
    }

    /// Reads one complete statement, or `None` if the peer closed the stream at a statement
    /// boundary.
    ///
    /// # Errors
    /// [`DepotError::Framing`] if the stream ends mid statement or the command is too long.
    pub fn read_statement(&mut self) -> Result<Option<Statement>> {
        let mut payload = Vec::new();
        match self.read_statement_to(&mut payload)? {
            Some(command) => Ok(Some(Statement::new(command, payload))),
            None => Ok(None),
        }
    }

    /// Like [`read_statement`](ProtocolReader::read_statement), but a statement that is missing
    /// is an error rather than `None`. Handlers use this, since they are only constructed after a
    /// command was peeked.
    pub fn expect_statement(&mut self) -> Result<Statement> {
        self.read_statement()?
            .ok_or_else(|| DepotError::framing("Peer closed connection mid conversation"))
    }

    /// Reads one statement, writing its payload to `sink` as it arrives instead of buffering it.
    /// Returns the command, or `None` if the peer closed the stream at a statement boundary.
    ///
    /// A CR that is not followed by LF is part of the payload and is written to `sink` as is.
    pub fn read_statement_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<Option<Vec<u8>>> {
        let mut command = Vec::new();
        let mut last_was_cr = false;

        loop {
            let b = match self.next_byte()? {
                Some(b) => b,
                None if command.is_empty() && !last_was_cr => {
                    debug!("Peer closed connection");
                    return Ok(None);
                }
                None => return Err(unterminated()),
            };
            if last_was_cr {
                if b == LF {
                    self.consumed += 1;
                    return Ok(Some(command));
                }
                command.push(CR);
                last_was_cr = false;
            }
            if b == SP {
                break;
            }
            if b == CR {
                last_was_cr = true;
                continue;
            }
            command.push(b);
            if command.len() > MAX_COMMAND_LENGTH {
                return Err(too_long());
            }
        }
        if command.len() > MAX_COMMAND_LENGTH {
            return Err(too_long());
        }

        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        loop {
            let b = self.next_byte()?.ok_or_else(unterminated)?;
            if last_was_cr {
                if b == LF {
                    break;
                }
                chunk.push(CR);
                last_was_cr = false;
            }
            if b == CR {
                last_was_cr = true;
                continue;
            }
            chunk.push(b);
            if chunk.len() >= CHUNK_SIZE {
                sink.write_all(&chunk)?;
                chunk.clear();
            }
        }
        sink.write_all(&chunk)?;
        sink.flush()?;
        self.consumed += 1;
        Ok(Some(command))
    }

    /// Reads and throws away the next statement. Returns false if there was none.
    pub fn skip_statement(&mut self) -> Result<bool> {
        Ok(self.read_statement_to(&mut io::sink())?.is_some())
    }

    // the byte `index` positions past the consumed input, reading it into the look-ahead buffer
    fn peek_byte(&mut self, index: usize) -> Result<Option<u8>> {
        while self.lookahead.len() <= index {
            match self.read_raw()? {
                Some(b) => self.lookahead.push_back(b),
                None => return Ok(None),
            }
        }
        Ok(Some(self.lookahead[index]))
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        match self.lookahead.pop_front() {
            Some(b) => Ok(Some(b)),
            None => self.read_raw(),
        }
    }

    fn read_raw(&mut self) -> Result<Option<u8>> {
        let mut byte = [0_u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn too_long() -> DepotError {
    error!("Command exceeds {} bytes", MAX_COMMAND_LENGTH);
    DepotError::framing(format!(
        "Command exceeds maximum length of {}",
        MAX_COMMAND_LENGTH
    ))
}

fn unterminated() -> DepotError {
    error!("Unterminated statement in input stream");
    DepotError::framing("Unterminated statement in input stream")
}
