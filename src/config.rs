//! Depot configuration, read from an optional JSON file and overridden from the command line.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DepotError, Result};
use crate::peer::parse_peer_list;
use crate::permission::permissions_file;

/// the address a depot listens on unless told otherwise
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6324";

const DEFAULT_THREADS: u32 = 10;
const DEFAULT_WORKERS: usize = 5;
const WORK_QUEUE_FILE: &str = "depot.work";

/// Which [`ThreadPool`](crate::ThreadPool) serves connections.
///
/// A connection keeps its thread until the peer hangs up, so the bounded pools serve at most
/// `threads` connections at once and queue the rest. The default gives every connection its own
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// [`SharedQueueThreadPool`](crate::SharedQueueThreadPool)
    Shared,
    /// [`NaiveThreadPool`](crate::NaiveThreadPool), a thread per connection
    Naive,
    /// [`RayonThreadPool`](crate::RayonThreadPool)
    Rayon,
}

impl FromStr for PoolKind {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(PoolKind::Shared),
            "naive" => Ok(PoolKind::Naive),
            "rayon" => Ok(PoolKind::Rayon),
            _ => Err(DepotError::Config(format!("unknown thread pool '{}'", s))),
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolKind::Shared => "shared",
            PoolKind::Naive => "naive",
            PoolKind::Rayon => "rayon",
        };
        f.write_str(name)
    }
}

/// Certificate material for TLS connections, as PEM files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    /// this depot's certificate chain
    pub cert: PathBuf,
    /// the private key for `cert`
    pub key: PathBuf,
    /// CA certificates trusted to sign client and peer certificates
    pub trusted: PathBuf,
}

/// Everything a depot is started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// the address to listen on
    pub addr: SocketAddr,
    /// directory for the permissions file, the delayed work queue and sync downloads
    pub var_dir: PathBuf,
    /// the number of connection threads of a bounded pool
    pub threads: u32,
    /// the connection thread pool implementation
    pub pool: PoolKind,
    /// the number of threads applying queued work
    pub workers: usize,
    /// the most jobs the live work queue holds, unbounded if unset
    pub queue_size: Option<usize>,
    /// peer depot URIs
    #[serde(deserialize_with = "peer_list")]
    pub peers: Vec<String>,
    /// the URI peers reach this depot at, `depot://<addr>` if unset
    pub local_uri: Option<String>,
    /// resubmit work left in the delayed queue by a previous run instead of discarding it
    pub recover: bool,
    /// pull a snapshot from a peer at startup
    pub sync: bool,
    /// download a snapshot from a peer and exit
    pub dump: bool,
    /// append logs to this file instead of stderr
    pub log_file: Option<PathBuf>,
    /// `EnvFilter` directives
    pub log_filter: Option<String>,
    /// seconds a peer read may block before it is retried
    pub read_timeout_secs: Option<u64>,
    /// serve and connect over TLS
    pub tls: Option<TlsPaths>,
}

impl Default for DepotConfig {
    fn default() -> Self {
        DepotConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 6324)),
            var_dir: PathBuf::from("var"),
            threads: DEFAULT_THREADS,
            pool: PoolKind::Naive,
            workers: DEFAULT_WORKERS,
            queue_size: None,
            peers: Vec::new(),
            local_uri: None,
            recover: false,
            sync: false,
            dump: false,
            log_file: None,
            log_filter: None,
            read_timeout_secs: None,
            tls: None,
        }
    }
}

impl DepotConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| DepotError::Config(format!("unable to read {}: {}", path.display(), e)))?;
        let config: DepotConfig = serde_json::from_str(&text)
            .map_err(|e| DepotError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(DepotError::Config("threads must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(DepotError::Config("workers must be at least 1".into()));
        }
        if self.queue_size == Some(0) {
            return Err(DepotError::Config("queue_size must be at least 1".into()));
        }
        if (self.sync || self.dump) && self.peers.is_empty() {
            return Err(DepotError::Config(
                "sync and dump need at least one peer".into(),
            ));
        }
        Ok(())
    }

    /// the URI this depot registers with peers
    pub fn local_uri(&self) -> String {
        self.local_uri
            .clone()
            .unwrap_or_else(|| format!("depot://{}", self.addr))
    }

    /// where permissions are persisted
    pub fn permissions_path(&self) -> PathBuf {
        permissions_file(&self.var_dir)
    }

    /// where the delayed work queue lives
    pub fn work_queue_path(&self) -> PathBuf {
        self.var_dir.join(WORK_QUEUE_FILE)
    }

    /// a fresh file name for a downloaded snapshot
    pub fn sync_download_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        self.var_dir.join(format!("sync-response-{}.b64", millis))
    }
}

// peers may be given as a list or as one separated string
fn peer_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Peers {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match Peers::deserialize(deserializer)? {
        Peers::List(list) => list,
        Peers::Joined(joined) => parse_peer_list(&joined),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: DepotConfig =
            serde_json::from_str(r#"{"threads": 4, "peers": "a:1, b:2", "pool": "rayon"}"#).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.pool, PoolKind::Rayon);
        assert_eq!(config.peers, vec!["a:1", "b:2"]);
        assert_eq!(config.addr.to_string(), DEFAULT_ADDRESS);
        assert_eq!(config.local_uri(), "depot://127.0.0.1:6324");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn connections_get_their_own_threads_by_default() {
        assert_eq!(DepotConfig::default().pool, PoolKind::Naive);
        let config: DepotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pool, PoolKind::Naive);
    }

    #[test]
    fn sync_without_peers_is_rejected() {
        let config = DepotConfig {
            sync: true,
            ..DepotConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
