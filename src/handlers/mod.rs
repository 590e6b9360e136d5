//! The concrete [`MessageHandler`](crate::handler::MessageHandler)s and the tables that register
//! them.

use std::sync::Arc;

use crate::depot::Depot;
use crate::handler::{HandlerRegistry, MessageHandler, Relay};
use crate::logging::LogControl;
use crate::permission::PermissionRegistry;
use crate::protocol::*;

mod common;
mod depot;

pub use self::common::{GetLog, LogConfig, Permit, Ping, Revoke, RevokeAll, VerifyProtocolVersion};
pub use self::depot::{Insert, RegisterPeer, SuiteUpdate, SyncEnd, SyncResponse, SyncStart};

fn boxed<H: MessageHandler + 'static>(handler: H) -> crate::Result<Box<dyn MessageHandler>> {
    Ok(Box::new(handler))
}

/// Registers the commands every server answers: `PING`, `START`, `PERMIT`, `NOTIFYPERMIT`,
/// `REVOKE`, `REVOKEALL`, `LOGCONFIG` and `GETLOG`.
///
/// A `PERMIT` is forwarded through `relay` when one is given.
pub fn register_common(
    registry: &HandlerRegistry,
    permissions: &Arc<PermissionRegistry>,
    log: &Arc<LogControl>,
    relay: Option<Arc<dyn Relay>>,
) {
    let perms = Arc::clone(permissions);
    registry.register(PING_COMMAND, move || boxed(Ping::new(Arc::clone(&perms))));
    registry.register(START_COMMAND, || boxed(VerifyProtocolVersion));

    for command in [PERMIT_COMMAND, NOTIFY_PERMIT_COMMAND] {
        let perms = Arc::clone(permissions);
        let relay = relay.clone();
        registry.register(command, move || boxed(Permit::new(Arc::clone(&perms), relay.clone())));
    }

    let perms = Arc::clone(permissions);
    registry.register(REVOKE_COMMAND, move || boxed(Revoke::new(Arc::clone(&perms))));
    let perms = Arc::clone(permissions);
    registry.register(REVOKE_ALL_COMMAND, move || boxed(RevokeAll::new(Arc::clone(&perms))));

    let control = Arc::clone(log);
    registry.register(LOG_CONFIG_COMMAND, move || boxed(LogConfig::new(Arc::clone(&control))));
    let control = Arc::clone(log);
    registry.register(GET_LOG_COMMAND, move || boxed(GetLog::new(Arc::clone(&control))));
}

/// Registers the common commands plus everything a depot answers, with `PERMIT` forwarded to
/// the depot's peers.
pub fn register_depot(registry: &HandlerRegistry, depot: &Arc<Depot>) {
    let relay: Arc<dyn Relay> = Arc::clone(depot) as Arc<dyn Relay>;
    register_common(registry, depot.permissions(), depot.log(), Some(relay));

    for command in [INSERT_COMMAND, RESEND_COMMAND, NOTIFY_INSERT_COMMAND] {
        let d = Arc::clone(depot);
        registry.register(command, move || boxed(Insert::new(Arc::clone(&d))));
    }
    for command in [SUITE_UPDATE_COMMAND, NOTIFY_SUITE_UPDATE_COMMAND] {
        let d = Arc::clone(depot);
        registry.register(command, move || boxed(SuiteUpdate::new(Arc::clone(&d))));
    }
    let d = Arc::clone(depot);
    registry.register(REGISTER_PEER_COMMAND, move || boxed(RegisterPeer::new(Arc::clone(&d))));
    for command in [SYNC_COMMAND, SYNC_DUMP_COMMAND] {
        let d = Arc::clone(depot);
        registry.register(command, move || boxed(SyncResponse::new(Arc::clone(&d))));
    }
    let d = Arc::clone(depot);
    registry.register(SYNC_START_COMMAND, move || boxed(SyncStart::new(Arc::clone(&d))));
    let d = Arc::clone(depot);
    registry.register(SYNC_END_COMMAND, move || boxed(SyncEnd::new(Arc::clone(&d))));
}
