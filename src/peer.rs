//! Peer depots: the configured list and registration with it.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client::Connector;
use crate::error::{DepotError, Result};
use crate::permission::PermissionRegistry;

/// A peer depot, identified by the URI it is reached at (`scheme://host:port` or `host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerConfig {
    uri: String,
}

impl PeerConfig {
    /// Creates a peer config from `uri`.
    ///
    /// # Errors
    /// [`DepotError::Config`] if the URI has no `host:port` address.
    pub fn new<S: Into<String>>(uri: S) -> Result<Self> {
        let uri = uri.into().trim().to_string();
        let peer = PeerConfig { uri };
        let address = peer.address();
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(peer),
            _ => Err(DepotError::Config(format!(
                "'{}' is not a valid peer address, expected host:port",
                peer.uri
            ))),
        }
    }

    /// the URI as configured
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// the `host:port` part of the URI
    pub fn address(&self) -> &str {
        extract_address(&self.uri)
    }

    /// the host part of the address
    pub fn host(&self) -> &str {
        let address = self.address();
        address.rsplit_once(':').map_or(address, |(host, _)| host)
    }
}

impl fmt::Display for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// strips the `scheme://` prefix from `uri`, if any
pub fn extract_address(uri: &str) -> &str {
    match uri.find("://") {
        Some(offset) => &uri[offset + 3..],
        None => uri,
    }
}

/// Splits a peer list given as one string, separated by whitespace, commas or semicolons.
pub fn parse_peer_list(list: &str) -> Vec<String> {
    list.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// The depot's peers. Append only, a depot never adds itself.
#[derive(Debug)]
pub struct PeerList {
    local_uri: String,
    peers: Mutex<Vec<PeerConfig>>,
}

impl PeerList {
    /// creates an empty list for the depot reachable at `local_uri`
    pub fn new<S: Into<String>>(local_uri: S) -> Self {
        PeerList {
            local_uri: local_uri.into(),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// the URI this depot registers itself with
    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    /// Adds the peer at `uri`. Returns false if it is this depot or already listed.
    ///
    /// Addresses are compared with their scheme stripped, so `depot://host:6324` and `host:6324`
    /// are the same peer.
    pub fn add(&self, uri: &str) -> Result<bool> {
        let peer = PeerConfig::new(uri)?;
        if peer.address().eq_ignore_ascii_case(extract_address(&self.local_uri)) {
            warn!("Refusing to add self to list of peer depots");
            return Ok(false);
        }
        let mut peers = self.peers.lock();
        if peers.iter().any(|p| p.address() == peer.address()) {
            debug!("Peer {} already known", uri);
            return Ok(false);
        }
        info!("Added peer depot {}", peer);
        peers.push(peer);
        Ok(true)
    }

    /// true if a peer with the same address as `uri` is listed
    pub fn contains(&self, uri: &str) -> bool {
        let address = extract_address(uri);
        self.peers.lock().iter().any(|p| p.address() == address)
    }

    /// a snapshot of the list
    pub fn peers(&self) -> Vec<PeerConfig> {
        self.peers.lock().clone()
    }

    /// the number of listed peers
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// true if no peers are listed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers this depot with every listed peer.
///
/// Each peer is sent this depot's URI and answers with its permission table, which is merged into
/// `permissions` (minus entries naming this depot's own identity). The peer's identity is then
/// trusted as a peer. A peer that can't be reached is logged and skipped. Returns the number of
/// peers registered with.
#[instrument(skip_all)]
pub fn register_with_peers(peers: &PeerList, permissions: &PermissionRegistry, connector: &Connector) -> usize {
    let mut registered = 0;
    for peer in peers.peers() {
        let result = connector.connect_peer(&peer).and_then(|mut client| {
            let xml = client.register_peer(peers.local_uri())?;
            permissions.merge_xml(&xml, client.local_identity())?;
            permissions.grant_peer_permission(client.peer_identity());
            Ok(())
        });
        match result {
            Ok(()) => {
                info!("Registered with peer depot {}", peer);
                registered += 1;
            }
            Err(e) => warn!("Failed to register with peer depot {}: {}", peer, e),
        }
    }
    registered
}
