//! Upstream connections
//!
//! Each forwarded request gets its own TCP connection, wrapped in TLS
//! verified against the webpki roots (plus any configured extra roots) for
//! `https` destinations.

use super::ca::crypto_provider;
use super::request::Scheme;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Byte stream on either side of the engine
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Dials upstream servers
#[derive(Clone)]
pub struct Upstream {
    connector: TlsConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Upstream {
    /// Create a new upstream dialer from the proxy configuration
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for path in &config.extra_roots {
            let added = add_pem_roots(&mut roots, path)?;
            tracing::info!(path = %path.display(), added, "Loaded extra upstream roots");
        }

        Self::with_roots(
            roots,
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.handshake_timeout_ms),
        )
    }

    pub fn with_roots(
        roots: RootCertStore,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("TLS protocol setup failed: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout,
            handshake_timeout,
        })
    }

    /// Open a connection to `host:port`.
    pub async fn connect(&self, scheme: Scheme, host: &str, port: u16) -> Result<Box<dyn Io>> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                Error::Upstream(format!(
                    "connect to {}:{} timed out after {}ms",
                    host,
                    port,
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::Upstream(format!("connect to {}:{} failed: {}", host, port, e)))?;
        let _ = tcp.set_nodelay(true);

        if scheme == Scheme::Http {
            return Ok(Box::new(tcp));
        }

        let name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Upstream(format!("invalid server name '{}': {}", host, e)))?;
        let tls = tokio::time::timeout(self.handshake_timeout, self.connector.connect(name, tcp))
            .await
            .map_err(|_| Error::Upstream(format!("TLS handshake with {} timed out", host)))?
            .map_err(|e| Error::Upstream(format!("TLS handshake with {} failed: {}", host, e)))?;
        Ok(Box::new(tls))
    }
}

/// Add every certificate in a PEM file to `roots`.
fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<usize> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Tls(format!("Failed to read {}: {}", path.display(), e)))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    let (added, _ignored) = roots.add_parsable_certificates(certs);
    Ok(added)
}
