//! The statement protocol spoken between clients, depots and peer depots.
//!
//! Every message on the wire is a [`Statement`]: a command word, optionally followed by a
//! single space and a payload, terminated by CRLF.
//!
//! ```text
//! COMMAND[ SP PAYLOAD]CRLF
//! ```
//!
//! The payload may contain a lone CR, it just can't contain a CR immediately followed by LF.
//! [`ProtocolReader`] splits a byte stream into statements (and can peek at the next command
//! without consuming it), [`ProtocolWriter`] does the reverse.

mod reader;
mod statement;
mod writer;

pub use self::reader::{ProtocolReader, MAX_COMMAND_LENGTH};
pub use self::statement::Statement;
pub use self::writer::ProtocolWriter;

/// version string exchanged by the `START` command
pub const PROTOCOL_VERSION: &str = "1";

// generic replies
pub const SUCCESS_COMMAND: &str = "OK";
pub const FAILURE_COMMAND: &str = "ERROR";
pub const QUERY_RESULT_COMMAND: &str = "QUERYRESULT";
pub const END_QUERY_RESULTS_COMMAND: &str = "QUERYEND";

// commands every server understands
pub const GET_LOG_COMMAND: &str = "GETLOG";
pub const LOG_CONFIG_COMMAND: &str = "LOGCONFIG";
pub const PERMIT_COMMAND: &str = "PERMIT";
pub const PING_COMMAND: &str = "PING";
pub const REVOKE_COMMAND: &str = "REVOKE";
pub const REVOKE_ALL_COMMAND: &str = "REVOKEALL";
pub const START_COMMAND: &str = "START";

// depot commands
pub const INSERT_COMMAND: &str = "REPORT";
pub const RESEND_COMMAND: &str = "RESEND";
pub const INSERT_STDERR_COMMAND: &str = "STDERR";
pub const INSERT_STDOUT_COMMAND: &str = "STDOUT";
pub const INSERT_SYSUSAGE_COMMAND: &str = "SYSUSAGE";
pub const SUITE_UPDATE_COMMAND: &str = "SUITE";

// depot to depot commands
pub const NOTIFY_INSERT_COMMAND: &str = "NOTIFYREPORT";
pub const NOTIFY_PERMIT_COMMAND: &str = "NOTIFYPERMIT";
pub const NOTIFY_SUITE_UPDATE_COMMAND: &str = "NOTIFYSUITE";
pub const REGISTER_PEER_COMMAND: &str = "REGISTER_PEER";
pub const SYNC_COMMAND: &str = "SYNC";
pub const SYNC_DUMP_COMMAND: &str = "SYNCDUMP";
pub const SYNC_START_COMMAND: &str = "SYNCSTART";
pub const SYNC_END_COMMAND: &str = "SYNCEND";

// named actions checked against the permission registry
pub const INSERT_ACTION: &str = "insert";
pub const PING_ACTION: &str = "ping";
pub const REVOKE_ACTION: &str = "revoke";
pub const SUITE_ACTION: &str = "suite";
pub const SYNC_ACTION: &str = "sync";

/// Splits a `[quote]names[quote] rest` argument into its quoted part and the trimmed rest.
///
/// The quote is either `"` or `'`; without a leading quote the first space ends the names.
/// Returns `None` if the closing delimiter is missing.
pub fn split_quoted(data: &str) -> Option<(&str, &str)> {
    let (begin, delim) = match data.chars().next() {
        Some('"') => (1, '"'),
        Some('\'') => (1, '\''),
        _ => (0, ' '),
    };
    // the search starts at 1 so a leading space can't produce an empty name
    let end = data.get(1..)?.find(delim)? + 1;
    Some((&data[begin..end], data[end + 1..].trim()))
}

/// Quotes `name` for use in a `PERMIT`/`REVOKE` payload, picking a quote char it doesn't contain.
pub fn quote(name: &str) -> String {
    let q = if name.contains('"') { '\'' } else { '"' };
    format!("{}{}{}", q, name, q)
}
