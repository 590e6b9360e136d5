use std::io::{self, BufWriter, Read, Write};

use tracing::debug;

use super::{Statement, END_QUERY_RESULTS_COMMAND, QUERY_RESULT_COMMAND};
use crate::error::Result;

const CRLF: &[u8] = b"\r\n";
const SP: &[u8] = b" ";

/// A buffered writer that serializes [`Statement`]s onto a byte stream.
///
/// Every write ends with CRLF and a flush, so a reply is on the wire by the time the call
/// returns.
pub struct ProtocolWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> ProtocolWriter<W> {
    /// wraps `inner` in a buffering protocol writer
    pub fn new(inner: W) -> Self {
        ProtocolWriter {
            inner: BufWriter::new(inner),
        }
    }

    /// writes `statement` followed by CRLF, then flushes
    pub fn write_statement(&mut self, statement: &Statement) -> Result<()> {
        debug!("Write '{}'", statement);
        self.inner.write_all(&statement.to_bytes())?;
        self.inner.write_all(CRLF)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Writes `command`, a space, then everything `source` produces, then CRLF and a flush.
    ///
    /// The payload is copied straight through, so large replies never sit in memory whole.
    /// The caller guarantees `source` contains no CRLF pair.
    pub fn write_stream<S: Read + ?Sized>(&mut self, command: &str, source: &mut S) -> Result<u64> {
        self.inner.write_all(command.as_bytes())?;
        self.inner.write_all(SP)?;
        let copied = io::copy(source, &mut self.inner)?;
        self.inner.write_all(CRLF)?;
        self.inner.flush()?;
        debug!("Wrote {} streamed bytes for '{}'", copied, command);
        Ok(copied)
    }

    /// Writes `command` and a space, then hands the raw stream to `body`, which must not write
    /// a CRLF pair. The terminator is written and flushed whether or not `body` succeeds, so
    /// the peer always sees a complete statement.
    pub fn write_with<F>(&mut self, command: &str, body: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        self.inner.write_all(command.as_bytes())?;
        self.inner.write_all(SP)?;
        let result = body(&mut self.inner);
        self.inner.write_all(CRLF)?;
        self.inner.flush()?;
        result
    }

    /// writes the rows of a query reply: one `QUERYRESULT` per row, then `QUERYEND`
    pub fn write_query_results<I, S>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        for row in rows {
            self.write_statement(&Statement::new(QUERY_RESULT_COMMAND, row))?;
        }
        self.write_statement(&Statement::command_only(END_QUERY_RESULTS_COMMAND))
    }
}
