use std::fmt;

use super::{FAILURE_COMMAND, PROTOCOL_VERSION, START_COMMAND, SUCCESS_COMMAND};

const SP: u8 = b' ';

/// The atomic protocol message: a command word plus an optional payload.
///
/// Statements own their bytes, a `Statement` read off the wire never aliases the
/// reader's buffer. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Statement {
    command: Vec<u8>,
    payload: Vec<u8>,
}

impl Statement {
    /// creates a statement from a command and payload
    pub fn new<C, P>(command: C, payload: P) -> Self
    where
        C: Into<Vec<u8>>,
        P: Into<Vec<u8>>,
    {
        Statement {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// creates a statement that has no payload
    pub fn command_only<C: Into<Vec<u8>>>(command: C) -> Self {
        Statement::new(command, Vec::new())
    }

    /// Parses the serialized form of a statement (without its CRLF terminator).
    ///
    /// Everything before the first space is the command, everything after it is the payload.
    pub fn parse(bytes: &[u8]) -> Self {
        match bytes.iter().position(|&b| b == SP) {
            Some(i) => Statement::new(&bytes[..i], &bytes[i + 1..]),
            None => Statement::new(bytes, Vec::new()),
        }
    }

    /// `OK[ SP data]`
    pub fn ok<P: Into<Vec<u8>>>(data: P) -> Self {
        Statement::new(SUCCESS_COMMAND, data)
    }

    /// `ERROR SP message`
    pub fn error<P: Into<Vec<u8>>>(message: P) -> Self {
        Statement::new(FAILURE_COMMAND, message)
    }

    /// `START SP version` carrying this build's protocol version
    pub fn start() -> Self {
        Statement::new(START_COMMAND, PROTOCOL_VERSION)
    }

    /// the command bytes
    pub fn command(&self) -> &[u8] {
        &self.command
    }

    /// the payload bytes, empty if the statement had none
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// the command as text, invalid UTF-8 is replaced
    pub fn command_str(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }

    /// the payload as text, invalid UTF-8 is replaced
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// true if the command word equals `command`
    pub fn is(&self, command: &str) -> bool {
        self.command == command.as_bytes()
    }

    /// consumes the statement, returning its payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes the statement: the command, then a space and the payload if the payload is
    /// non-empty. The CRLF terminator is left to the writer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.command.len() + 1 + self.payload.len());
        bytes.extend_from_slice(&self.command);
        if !self.payload.is_empty() {
            bytes.push(SP);
            bytes.extend_from_slice(&self.payload);
        }
        bytes
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl From<&str> for Statement {
    fn from(s: &str) -> Self {
        Statement::parse(s.as_bytes())
    }
}
