//! Authorization of peer identities to perform named actions.
//!
//! Every action is open to everyone until some standard permittee is granted it. From then on the
//! action is restricted: only the identities holding an explicit grant (and peer depots, which are
//! trusted with everything) may perform it. Anonymous connections are never restricted.
//!
//! The table lives in a [`PermissionRegistry`], guarded by one lock. When a path is configured the
//! table is written to it after every mutation and read back lazily on first use.

mod exchange;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// pseudo action under which peer permittees are persisted and exchanged
pub const PEER_ACTION: &str = "PEER";

/// The kind of a [`Permittee`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermitteeGroup {
    /// permittees holding an explicit set of actions
    Standard,
    /// trusted peer depots, permitted to do anything
    Peer,
}

/// An authorization principal, keyed by its identity name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permittee {
    /// an identity holding explicitly granted actions
    Standard {
        /// the identity, usually a certificate subject
        name: String,
        /// the granted action names
        actions: BTreeSet<String>,
    },
    /// a trusted peer depot
    Peer {
        /// the identity of the peer depot
        name: String,
    },
}

impl Permittee {
    fn standard(name: &str) -> Self {
        Permittee::Standard {
            name: name.to_string(),
            actions: BTreeSet::new(),
        }
    }

    fn peer(name: &str) -> Self {
        Permittee::Peer {
            name: name.to_string(),
        }
    }

    /// the identity name of this permittee
    pub fn name(&self) -> &str {
        match self {
            Permittee::Standard { name, .. } | Permittee::Peer { name } => name,
        }
    }

    /// which group this permittee belongs to
    pub fn group(&self) -> PermitteeGroup {
        match self {
            Permittee::Standard { .. } => PermitteeGroup::Standard,
            Permittee::Peer { .. } => PermitteeGroup::Peer,
        }
    }

    /// true if this permittee may perform `action`
    pub fn has_permission(&self, action: &str) -> bool {
        match self {
            Permittee::Standard { actions, .. } => actions.contains(action),
            Permittee::Peer { .. } => true,
        }
    }

    // returns false if the permittee already held the action or is a peer
    fn grant(&mut self, action: &str) -> bool {
        match self {
            Permittee::Standard { actions, .. } => actions.insert(action.to_string()),
            Permittee::Peer { .. } => false,
        }
    }

    fn revoke(&mut self, action: &str) -> bool {
        match self {
            Permittee::Standard { actions, .. } => actions.remove(action),
            Permittee::Peer { .. } => false,
        }
    }

    // adds this permittee's name under every action it holds
    fn collect_into(&self, perms: &mut BTreeMap<String, Vec<String>>) {
        match self {
            Permittee::Standard { name, actions } => {
                for action in actions {
                    perms.entry(action.clone()).or_default().push(name.clone());
                }
            }
            Permittee::Peer { name } => {
                perms.entry(PEER_ACTION.to_string()).or_default().push(name.clone());
            }
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    permittees: BTreeMap<String, Permittee>,
    path: Option<PathBuf>,
    loaded: bool,
}

impl Table {
    fn ensure_loaded(&mut self) {
        if self.loaded && !self.permittees.is_empty() {
            return;
        }
        self.loaded = true;
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return,
        };
        match store::load(&path) {
            Ok(Some(entries)) => {
                debug!("Loaded permissions from {}", path.display());
                self.merge(entries, None);
            }
            Ok(None) => {}
            Err(e) => warn!("Unable to load permissions: {}", e),
        }
    }

    fn merge(&mut self, entries: Vec<(String, Vec<String>)>, local: Option<&str>) {
        for (action, names) in entries {
            for name in names {
                if local == Some(name.as_str()) {
                    continue;
                }
                if action == PEER_ACTION {
                    self.permittees.insert(name.clone(), Permittee::peer(&name));
                } else {
                    self.permittees
                        .entry(name.clone())
                        .or_insert_with(|| Permittee::standard(&name))
                        .grant(&action);
                }
            }
        }
    }

    fn by_action(&self) -> BTreeMap<String, Vec<String>> {
        let mut perms = BTreeMap::new();
        for permittee in self.permittees.values() {
            permittee.collect_into(&mut perms);
        }
        perms
    }

    fn granted_to_standard(&self, action: &str) -> bool {
        self.permittees
            .values()
            .any(|p| p.group() == PermitteeGroup::Standard && p.has_permission(action))
    }

    fn store(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = store::store(path, &self.by_action()) {
                warn!("Unable to store permissions: {}", e);
            }
        }
    }
}

/// The process-wide permission table.
///
/// All operations, including the file I/O a mutation triggers, run under a single lock, so a grant
/// and its persistence are one atomic step.
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    table: Mutex<Table>,
}

impl PermissionRegistry {
    /// creates an empty registry that is not persisted
    pub fn new() -> Self {
        PermissionRegistry::default()
    }

    /// creates a registry persisted to `path`, loading whatever the file holds
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        let registry = PermissionRegistry::new();
        registry.set_path(path);
        registry
    }

    /// Sets the file the table is persisted to and loads it.
    pub fn set_path<P: Into<PathBuf>>(&self, path: P) {
        let mut table = self.table.lock();
        table.path = Some(path.into());
        table.loaded = false;
        table.ensure_loaded();
    }

    /// the file the table is persisted to, if any
    pub fn path(&self) -> Option<PathBuf> {
        self.table.lock().path.clone()
    }

    /// Allows `identity` to perform `action`.
    ///
    /// Returns false, changing nothing, if some other standard permittee already holds `action`:
    /// a granted action is exclusive to its holders. An anonymous identity is always permitted and
    /// never tracked, so granting to `None` is a no-op that succeeds, as is granting an action the
    /// identity already holds (peer permittees hold every action).
    pub fn grant_permission(&self, identity: Option<&str>, action: &str) -> bool {
        let name = match identity {
            Some(name) => name,
            None => return true,
        };
        let mut table = self.table.lock();
        table.ensure_loaded();
        if table
            .permittees
            .get(name)
            .map_or(false, |p| p.has_permission(action))
        {
            return true;
        }
        if table.granted_to_standard(action) {
            debug!("'{}' already granted exclusively, refusing '{}'", action, name);
            return false;
        }
        debug!("Granting permission to '{}' to '{}'", action, name);
        table
            .permittees
            .entry(name.to_string())
            .or_insert_with(|| Permittee::standard(name))
            .grant(action);
        table.store();
        true
    }

    /// Takes `action` away from `identity`. Returns false if it wasn't held explicitly.
    pub fn revoke_permission(&self, identity: Option<&str>, action: &str) -> bool {
        let name = match identity {
            Some(name) => name,
            None => return false,
        };
        let mut table = self.table.lock();
        table.ensure_loaded();
        let revoked = table
            .permittees
            .get_mut(name)
            .map_or(false, |p| p.revoke(action));
        if revoked {
            debug!("Revoked permission to '{}' from '{}'", action, name);
            table.store();
        }
        revoked
    }

    /// Takes `action` away from everyone holding it. Returns true if anyone did.
    pub fn revoke_all_permissions(&self, action: &str) -> bool {
        let mut table = self.table.lock();
        table.ensure_loaded();
        let mut revoked = false;
        for (name, permittee) in table.permittees.iter_mut() {
            if permittee.revoke(action) {
                debug!("Revoked permission to '{}' from '{}'", action, name);
                revoked = true;
            }
        }
        if revoked {
            table.store();
        }
        revoked
    }

    /// Trusts `identity` as a peer depot. Returns false for an anonymous identity or one
    /// already in the table.
    pub fn grant_peer_permission(&self, identity: Option<&str>) -> bool {
        let name = match identity {
            Some(name) => name,
            None => return false,
        };
        let mut table = self.table.lock();
        table.ensure_loaded();
        if table.permittees.contains_key(name) {
            return false;
        }
        debug!("Granting peer permission to '{}'", name);
        table.permittees.insert(name.to_string(), Permittee::peer(name));
        table.store();
        true
    }

    /// Stops trusting `identity` as a peer depot. Returns false unless it was one.
    pub fn revoke_peer_permission(&self, identity: Option<&str>) -> bool {
        let name = match identity {
            Some(name) => name,
            None => return false,
        };
        let mut table = self.table.lock();
        table.ensure_loaded();
        match table.permittees.get(name) {
            Some(p) if p.group() == PermitteeGroup::Peer => {}
            _ => return false,
        }
        debug!("Revoked peer permission from '{}'", name);
        table.permittees.remove(name);
        table.store();
        true
    }

    /// Returns true if `identity` may perform `action`.
    ///
    /// Anonymous identities may do anything, as may everyone while the table is empty. Otherwise
    /// an explicit grant (or peer trust) permits, and failing that the action is open only if no
    /// standard permittee has been granted it.
    pub fn is_permitted(&self, identity: Option<&str>, action: &str) -> bool {
        let name = match identity {
            Some(name) => name,
            None => {
                debug!("Client anonymous allowed to '{}'", action);
                return true;
            }
        };
        let mut table = self.table.lock();
        table.ensure_loaded();
        if table.permittees.is_empty() {
            debug!("Client '{}' allowed to '{}'; no permissions", name, action);
            return true;
        }
        if table
            .permittees
            .get(name)
            .map_or(false, |p| p.has_permission(action))
        {
            debug!("Client '{}' allowed to '{}'; specific permit", name, action);
            return true;
        }
        if table.granted_to_standard(action) {
            debug!("Client '{}' forbidden to '{}'", name, action);
            return false;
        }
        debug!("Client '{}' allowed to '{}'; global permit", name, action);
        true
    }

    /// every permittee that may perform `action` explicitly, peers included
    pub fn permittees_for_action(&self, action: &str) -> Vec<Permittee> {
        let mut table = self.table.lock();
        table.ensure_loaded();
        table
            .permittees
            .values()
            .filter(|p| p.has_permission(action))
            .cloned()
            .collect()
    }

    /// every permittee in `group`
    pub fn permittees_in_group(&self, group: PermitteeGroup) -> Vec<Permittee> {
        let mut table = self.table.lock();
        table.ensure_loaded();
        table
            .permittees
            .values()
            .filter(|p| p.group() == group)
            .cloned()
            .collect()
    }

    /// a snapshot of the whole table, ordered by name
    pub fn all_permittees(&self) -> Vec<Permittee> {
        let mut table = self.table.lock();
        table.ensure_loaded();
        table.permittees.values().cloned().collect()
    }

    /// Renders the table as an exchange document, peers listed under [`PEER_ACTION`].
    pub fn to_xml(&self) -> String {
        let mut table = self.table.lock();
        table.ensure_loaded();
        exchange::to_xml(&table.by_action())
    }

    /// Merges an exchange document into the table, skipping entries naming `local`.
    ///
    /// Peer entries replace whatever the table held for that identity. Standard entries add to
    /// the identity's actions. The table is persisted once the whole document was merged.
    ///
    /// # Errors
    /// [`DepotError::Exchange`](crate::DepotError::Exchange) if `xml` is not a permission
    /// document. The table is left untouched in that case.
    pub fn merge_xml(&self, xml: &str, local: Option<&str>) -> Result<()> {
        let entries = exchange::from_xml(xml)?;
        let mut table = self.table.lock();
        table.ensure_loaded();
        table.merge(entries, local);
        table.store();
        Ok(())
    }

    /// Removes every permittee.
    pub fn reset(&self) {
        let mut table = self.table.lock();
        table.permittees.clear();
        table.store();
    }
}

/// Returns the path of the permissions file kept in `var_dir`.
pub fn permissions_file(var_dir: &Path) -> PathBuf {
    var_dir.join("depot.permissions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_replace_standard_entries_on_merge() {
        let registry = PermissionRegistry::new();
        registry.grant_permission(Some("CN=a"), "ping");
        registry
            .merge_xml(
                "<permissions><permission><action>PEER</action><dns><dn>CN=a</dn></dns></permission></permissions>",
                None,
            )
            .unwrap();
        assert_eq!(registry.all_permittees(), vec![Permittee::peer("CN=a")]);
    }

    #[test]
    fn bad_document_leaves_table_alone() {
        let registry = PermissionRegistry::new();
        registry.grant_permission(Some("CN=a"), "ping");
        assert!(registry.merge_xml("<permissions>", None).is_err());
        assert_eq!(registry.all_permittees().len(), 1);
    }
}
