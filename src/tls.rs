//! Mutually authenticated TLS, with identities taken from certificate subjects.
//!
//! Clients that present a certificate are known by its subject (`CN=..., O=...`); clients that
//! don't are accepted as anonymous.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use tracing::debug;

use crate::config::TlsPaths;
use crate::error::{DepotError, Result};
use crate::session::{Authenticator, Connection, Session};

fn tls_error<E: std::fmt::Display>(e: E) -> DepotError {
    DepotError::Config(format!("tls: {}", e))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(tls_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_error)?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(tls_error)?;
    }
    Ok(roots)
}

/// Returns the subject of a DER certificate in `CN=..., O=...` form.
pub fn subject(cert: &CertificateDer<'_>) -> Option<String> {
    x509_parser::parse_x509_certificate(cert.as_ref())
        .ok()
        .map(|(_, cert)| cert.subject().to_string())
}

/// Authenticates connections with a TLS handshake, identifying clients by certificate subject.
pub struct TlsAuthenticator {
    config: Arc<ServerConfig>,
}

impl TlsAuthenticator {
    /// builds a server configuration from `paths`
    pub fn new(paths: &TlsPaths) -> Result<Self> {
        let certs = load_certs(&paths.cert)?;
        let key = PrivateKeyDer::from_pem_file(&paths.key).map_err(tls_error)?;
        let roots = Arc::new(load_roots(&paths.trusted)?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
            .allow_unauthenticated()
            .build()
            .map_err(tls_error)?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(tls_error)?;
        Ok(TlsAuthenticator {
            config: Arc::new(config),
        })
    }
}

impl Authenticator for TlsAuthenticator {
    fn authenticate(&self, mut stream: TcpStream) -> Result<Connection> {
        let peer_addr = stream.peer_addr().ok();
        let mut conn = ServerConnection::new(Arc::clone(&self.config))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }
        let identity = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(subject);
        debug!("TLS handshake with {:?} done, identity {:?}", peer_addr, identity);
        let (reader, writer) = split(StreamOwned::new(conn, stream));
        Ok(Connection {
            reader,
            writer,
            session: Session::new(identity, peer_addr),
        })
    }
}

/// Client side TLS settings, shared by every connection a depot makes to its peers.
#[derive(Debug)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
    local_identity: Option<String>,
}

impl ClientTls {
    /// builds a client configuration from `paths`
    pub fn new(paths: &TlsPaths) -> Result<Self> {
        let certs = load_certs(&paths.cert)?;
        let local_identity = certs.first().and_then(subject);
        let key = PrivateKeyDer::from_pem_file(&paths.key).map_err(tls_error)?;
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(load_roots(&paths.trusted)?)
            .with_client_auth_cert(certs, key)
            .map_err(tls_error)?;
        Ok(ClientTls {
            config: Arc::new(config),
            local_identity,
        })
    }

    /// the subject of this side's certificate
    pub fn local_identity(&self) -> Option<&str> {
        self.local_identity.as_deref()
    }

    /// Runs the handshake with `host` over `stream`, returning the split stream and the server's
    /// identity.
    pub fn connect(
        &self,
        mut stream: TcpStream,
        host: &str,
    ) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>, Option<String>)> {
        let name = ServerName::try_from(host.to_string()).map_err(tls_error)?;
        let mut conn = ClientConnection::new(Arc::clone(&self.config), name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }
        let identity = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(subject);
        let (reader, writer) = split(StreamOwned::new(conn, stream));
        Ok((reader, writer, identity))
    }
}

// both halves share the one TLS stream; the protocol never reads and writes at once
struct Half<S>(Arc<Mutex<S>>);

impl<S: Read> Read for Half<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().read(buf)
    }
}

impl<S: Write> Write for Half<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

fn split<S>(stream: S) -> (Box<dyn Read + Send>, Box<dyn Write + Send>)
where
    S: Read + Write + Send + 'static,
{
    let shared = Arc::new(Mutex::new(stream));
    (Box::new(Half(Arc::clone(&shared))), Box::new(Half(shared)))
}
