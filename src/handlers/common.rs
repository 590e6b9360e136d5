//! Handlers every server registers: liveness, version check, permissions and logging.

use std::sync::Arc;

use tracing::debug;

use crate::error::{DepotError, Result};
use crate::handler::{Conversation, MessageHandler, Reader, Relay, Writer};
use crate::logging::LogControl;
use crate::permission::PermissionRegistry;
use crate::protocol::{
    split_quoted, Statement, NOTIFY_PERMIT_COMMAND, PING_ACTION, PROTOCOL_VERSION, REVOKE_ACTION,
};
use crate::session::Session;
use crate::work::Notice;

/// `PING text` → `OK text`
pub struct Ping {
    permissions: Arc<PermissionRegistry>,
}

impl Ping {
    /// creates a handler checking `permissions`
    pub fn new(permissions: Arc<PermissionRegistry>) -> Self {
        Ping { permissions }
    }
}

impl MessageHandler for Ping {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let statement = reader.expect_statement()?;
        if !self.permissions.is_permitted(session.identity(), PING_ACTION) {
            return Err(DepotError::not_allowed(PING_ACTION, session.identity()));
        }
        writer.write_statement(&Statement::ok(statement.into_payload()))?;
        Ok(Conversation::Continue)
    }
}

/// `START version` → `OK version` if the versions match, else an `ERROR` naming both.
pub struct VerifyProtocolVersion;

impl MessageHandler for VerifyProtocolVersion {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, _session: &Session) -> Result<Conversation> {
        let theirs = reader.expect_statement()?.payload_str();
        debug!("compare my version {} to {}", PROTOCOL_VERSION, theirs);
        let reply = if theirs == PROTOCOL_VERSION {
            Statement::ok(PROTOCOL_VERSION)
        } else {
            Statement::error(format!(
                "Incompatable version: got {} need {}",
                theirs, PROTOCOL_VERSION
            ))
        };
        writer.write_statement(&reply)?;
        Ok(Conversation::Continue)
    }
}

/// `PERMIT [quote]names[quote] action` grants `action` to each newline separated name.
///
/// The requester must be allowed the action itself, and no name may be refused because another
/// identity already holds the action exclusively. A `PERMIT` (but not the `NOTIFYPERMIT` a peer
/// forwards) is relayed to this depot's peers when a relay is set.
pub struct Permit {
    permissions: Arc<PermissionRegistry>,
    relay: Option<Arc<dyn Relay>>,
}

impl Permit {
    /// creates a handler granting into `permissions`, forwarding through `relay`
    pub fn new(permissions: Arc<PermissionRegistry>, relay: Option<Arc<dyn Relay>>) -> Self {
        Permit { permissions, relay }
    }
}

impl MessageHandler for Permit {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let statement = reader.expect_statement()?;
        let data = statement.payload_str();
        let (names, action) =
            split_quoted(&data).ok_or_else(|| DepotError::protocol("Bad message format"))?;
        let exclusive = || {
            DepotError::protocol(format!(
                "Exclusive permission for {} already registered",
                action
            ))
        };
        if !self.permissions.is_permitted(session.identity(), action) {
            return Err(exclusive());
        }
        for name in names.split('\n').filter(|n| !n.is_empty()) {
            if !self.permissions.grant_permission(Some(name), action) {
                return Err(exclusive());
            }
        }
        writer.write_statement(&Statement::ok(""))?;

        if !statement.is(NOTIFY_PERMIT_COMMAND) {
            if let Some(relay) = &self.relay {
                relay.relay(Notice::Statement(Statement::new(
                    NOTIFY_PERMIT_COMMAND,
                    statement.into_payload(),
                )));
            }
        }
        Ok(Conversation::Continue)
    }
}

/// `REVOKE [quote]name[quote] action`, requires the `revoke` action.
pub struct Revoke {
    permissions: Arc<PermissionRegistry>,
}

impl Revoke {
    /// creates a handler revoking from `permissions`
    pub fn new(permissions: Arc<PermissionRegistry>) -> Self {
        Revoke { permissions }
    }
}

impl MessageHandler for Revoke {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let data = reader.expect_statement()?.payload_str();
        let (name, action) =
            split_quoted(&data).ok_or_else(|| DepotError::protocol("Bad message format"))?;
        if !self.permissions.is_permitted(session.identity(), REVOKE_ACTION) {
            return Err(DepotError::not_allowed(REVOKE_ACTION, session.identity()));
        }
        self.permissions.revoke_permission(Some(name), action);
        writer.write_statement(&Statement::ok(""))?;
        Ok(Conversation::Continue)
    }
}

/// `REVOKEALL action`, requires the `revoke` action.
pub struct RevokeAll {
    permissions: Arc<PermissionRegistry>,
}

impl RevokeAll {
    /// creates a handler revoking from `permissions`
    pub fn new(permissions: Arc<PermissionRegistry>) -> Self {
        RevokeAll { permissions }
    }
}

impl MessageHandler for RevokeAll {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, session: &Session) -> Result<Conversation> {
        let action = reader.expect_statement()?.payload_str();
        if !self.permissions.is_permitted(session.identity(), REVOKE_ACTION) {
            return Err(DepotError::not_allowed(REVOKE_ACTION, session.identity()));
        }
        self.permissions.revoke_all_permissions(action.trim());
        writer.write_statement(&Statement::ok(""))?;
        Ok(Conversation::Continue)
    }
}

/// `LOGCONFIG property=value`
pub struct LogConfig {
    log: Arc<LogControl>,
}

impl LogConfig {
    /// creates a handler configuring `log`
    pub fn new(log: Arc<LogControl>) -> Self {
        LogConfig { log }
    }
}

impl MessageHandler for LogConfig {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, _session: &Session) -> Result<Conversation> {
        let setting = reader.expect_statement()?.payload_str();
        self.log.configure(&setting)?;
        writer.write_statement(&Statement::ok(""))?;
        Ok(Conversation::Continue)
    }
}

/// `GETLOG` → `OK <log text>`
pub struct GetLog {
    log: Arc<LogControl>,
}

impl GetLog {
    /// creates a handler reading from `log`
    pub fn new(log: Arc<LogControl>) -> Self {
        GetLog { log }
    }
}

impl MessageHandler for GetLog {
    fn execute(&mut self, reader: &mut Reader, writer: &mut Writer, _session: &Session) -> Result<Conversation> {
        reader.expect_statement()?;
        // a CRLF pair in the log would end the reply early
        let text = self.log.contents()?.replace("\r\n", "\n");
        writer.write_statement(&Statement::ok(text))?;
        Ok(Conversation::Continue)
    }
}
