//! Handlers only a depot registers: report and suite ingestion, peer registration and sync.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderWriter;
use tracing::{debug, info, warn};

use crate::depot::Depot;
use crate::error::{DepotError, Result};
use crate::handler::{error_reply, Conversation, MessageHandler, Reader, Relay, Writer};
use crate::protocol::{
    Statement, INSERT_ACTION, INSERT_COMMAND, INSERT_STDERR_COMMAND, INSERT_STDOUT_COMMAND,
    INSERT_SYSUSAGE_COMMAND, NOTIFY_SUITE_UPDATE_COMMAND, RESEND_COMMAND, SUCCESS_COMMAND,
    SUITE_ACTION, SUITE_UPDATE_COMMAND, SYNC_ACTION, SYNC_COMMAND,
};
use crate::session::Session;
use crate::work::{DelayedWork, Notice, Report};

fn check(depot: &Depot, session: &Session, action: &str) -> Result<()> {
    if depot.permissions().is_permitted(session.identity(), action) {
        Ok(())
    } else {
        Err(DepotError::not_allowed(action, session.identity()))
    }
}

/// `REPORT`, `RESEND` and `NOTIFYREPORT`: a header statement followed by an optional `STDERR`,
/// then `STDOUT` and `SYSUSAGE`. Replies `OK <context>`.
pub struct Insert {
    depot: Arc<Depot>,
}

impl Insert {
    /// creates a handler inserting into `depot`
    pub fn new(depot: Arc<Depot>) -> Self {
        Insert { depot }
    }

    fn read_section(reader: &mut Reader, command: &str) -> Result<String> {
        match reader.peek_command()? {
            Some(next) if next == command => Ok(reader.expect_statement()?.payload_str()),
            _ => Err(DepotError::protocol(format!(
                "{} section missing from REPORT message",
                command
            ))),
        }
    }
}

impl MessageHandler for Insert {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let header = reader.expect_statement()?;
        let (resource, context, target) = Report::parse_header(&header.payload_str())?;
        let stderr = match reader.peek_command()?.as_deref() {
            Some(INSERT_STDERR_COMMAND) => Some(reader.expect_statement()?.payload_str()),
            _ => None,
        };
        let stdout = Self::read_section(reader, INSERT_STDOUT_COMMAND)?;
        let sysusage = Self::read_section(reader, INSERT_SYSUSAGE_COMMAND)?;
        check(&self.depot, session, INSERT_ACTION)?;

        let report = Report {
            resource,
            context,
            target,
            stderr,
            stdout,
            sysusage,
        };
        debug!("Received report '{}' from {}", report.context, report.resource);
        let reply = Statement::ok(report.context.as_str());
        let notice = if header.is(INSERT_COMMAND) || header.is(RESEND_COMMAND) {
            Some(Notice::Report(report.clone()))
        } else {
            None
        };
        self.depot.submit(DelayedWork::InsertReport(report))?;
        writer.write_statement(&reply)?;

        if let Some(notice) = notice {
            self.depot.relay(notice);
        }
        Ok(Conversation::Continue)
    }
}

/// `SUITE <xml>` and `NOTIFYSUITE <xml>`
pub struct SuiteUpdate {
    depot: Arc<Depot>,
}

impl SuiteUpdate {
    /// creates a handler updating suites in `depot`
    pub fn new(depot: Arc<Depot>) -> Self {
        SuiteUpdate { depot }
    }
}

impl MessageHandler for SuiteUpdate {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let statement = reader.expect_statement()?;
        check(&self.depot, session, SUITE_ACTION)?;
        let xml = statement.payload_str();
        self.depot.submit(DelayedWork::UpdateSuite(xml.clone()))?;
        writer.write_statement(&Statement::ok(""))?;

        if statement.is(SUITE_UPDATE_COMMAND) {
            self.depot
                .relay(Notice::Statement(Statement::new(NOTIFY_SUITE_UPDATE_COMMAND, xml)));
        }
        Ok(Conversation::Continue)
    }
}

/// `REGISTER_PEER <uri>` adds the caller to the peer list and answers with this depot's
/// permission document. The caller's identity becomes a trusted peer.
pub struct RegisterPeer {
    depot: Arc<Depot>,
}

impl RegisterPeer {
    /// creates a handler registering peers with `depot`
    pub fn new(depot: Arc<Depot>) -> Self {
        RegisterPeer { depot }
    }
}

impl MessageHandler for RegisterPeer {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let uri = reader.expect_statement()?.payload_str();
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(DepotError::protocol("Peer URI missing from REGISTER_PEER command"));
        }
        if !self.depot.peers().contains(uri) {
            self.depot.peers().add(uri)?;
        }
        writer.write_statement(&Statement::ok(self.depot.permissions().to_xml()))?;
        self.depot.permissions().grant_peer_permission(session.identity());
        info!("Registered peer {} as {}", uri, session.display_identity());
        Ok(Conversation::Close)
    }
}

/// `SYNC` and `SYNCDUMP` stream a base64 snapshot of the store as `OK <payload>`, then close.
///
/// A `SYNC` holds the work queue lock while the snapshot is written.
pub struct SyncResponse {
    depot: Arc<Depot>,
}

impl SyncResponse {
    /// creates a handler serving snapshots of `depot`
    pub fn new(depot: Arc<Depot>) -> Self {
        SyncResponse { depot }
    }
}

impl MessageHandler for SyncResponse {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let statement = reader.expect_statement()?;
        if self.depot.sync().sync_in_progress() {
            return Err(DepotError::protocol("synchronizing"));
        }
        check(&self.depot, session, SYNC_ACTION)?;
        let locking = statement.is(SYNC_COMMAND);
        if locking {
            self.depot.sync().start_sync_response()?;
        }

        let store = self.depot.store();
        let sent = writer.write_with(SUCCESS_COMMAND, |out| {
            let mut encoder = EncoderWriter::new(out, &STANDARD);
            store.write_snapshot(&mut encoder)?;
            encoder.finish()?;
            Ok(())
        });
        if locking {
            if let Err(e) = self.depot.sync().end_sync() {
                warn!("Unable to end synchronization: {}", e);
            }
        }
        match sent {
            Ok(()) => info!("Sent sync data to {}", session.display_identity()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error_reply(writer, &format!("Unable to send sync data: {}", e)),
        }
        Ok(Conversation::Close)
    }
}

/// `SYNCSTART` locks the work queue as if this depot were pulling a snapshot.
pub struct SyncStart {
    depot: Arc<Depot>,
}

impl SyncStart {
    /// creates a handler for `depot`
    pub fn new(depot: Arc<Depot>) -> Self {
        SyncStart { depot }
    }
}

impl MessageHandler for SyncStart {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        reader.expect_statement()?;
        check(&self.depot, session, SYNC_ACTION)?;
        self.depot.sync().start_sync_request()?;
        writer.write_statement(&Statement::ok(""))?;
        Ok(Conversation::Continue)
    }
}

/// `SYNCEND` releases the work queue lock and ends the sync.
pub struct SyncEnd {
    depot: Arc<Depot>,
}

impl SyncEnd {
    /// creates a handler for `depot`
    pub fn new(depot: Arc<Depot>) -> Self {
        SyncEnd { depot }
    }
}

impl MessageHandler for SyncEnd {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        reader.expect_statement()?;
        check(&self.depot, session, SYNC_ACTION)?;
        self.depot.sync().end_sync()?;
        writer.write_statement(&Statement::ok(""))?;
        Ok(Conversation::Continue)
    }
}
