//! Sandbox certificate authority
//!
//! The sandbox trusts this CA; the traffic engine issues a leaf for every
//! intercepted host on demand and caches the resulting server config.

use crate::error::{Error, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

const CA_COMMON_NAME: &str = "sandgate sandbox CA";

/// Issued leaf configs kept before the cache is reset
const LEAF_CACHE_LIMIT: usize = 4096;

/// Rustls provider used for every TLS config in the crate.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_pem: String,
    provider: Arc<CryptoProvider>,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Generate a fresh CA.
    pub fn generate() -> Result<Self> {
        let key = KeyPair::generate()
            .map_err(|e| Error::Tls(format!("Failed to generate CA key: {}", e)))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "sandgate");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Tls(format!("Failed to self-sign CA: {}", e)))?;
        let cert_pem = cert.pem();
        Ok(Self::assemble(cert, key, cert_pem))
    }

    /// Load a CA from PEM text.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Tls(format!("Failed to parse CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::Tls(format!("Failed to parse CA certificate: {}", e)))?;
        // Re-signing keeps subject and key, so leaves chain to the stored PEM
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Tls(format!("Failed to load CA: {}", e)))?;
        Ok(Self::assemble(cert, key, cert_pem.to_string()))
    }

    /// Load the CA from disk, generating and writing it on first start.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
                Error::Tls(format!("Failed to read {}: {}", cert_path.display(), e))
            })?;
            let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
                Error::Tls(format!("Failed to read {}: {}", key_path.display(), e))
            })?;
            let ca = Self::from_pem(&cert_pem, &key_pem)?;
            tracing::info!(cert = %cert_path.display(), "Loaded sandbox CA");
            return Ok(ca);
        }

        let ca = Self::generate()?;
        ca.write(cert_path, key_path)?;
        tracing::info!(cert = %cert_path.display(), "Generated sandbox CA");
        Ok(ca)
    }

    /// Write certificate and key as PEM; the key file is owner-only.
    pub fn write(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, self.key.serialize_pem())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn assemble(cert: rcgen::Certificate, key: KeyPair, cert_pem: String) -> Self {
        Self {
            cert,
            key,
            cert_pem,
            provider: crypto_provider(),
            leaves: Mutex::new(HashMap::new()),
        }
    }

    /// CA certificate to install in the sandbox trust store.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Server config presenting a leaf for `host`, offering `http/1.1` only.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        if let Some(config) = self.cached(&host) {
            return Ok(config);
        }

        let (chain, key) = self.issue(&host)?;
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("TLS protocol setup failed: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::Tls(format!("Invalid leaf for {}: {}", host, e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Arc::new(config);

        if let Ok(mut leaves) = self.leaves.lock() {
            if leaves.len() >= LEAF_CACHE_LIMIT {
                leaves.clear();
            }
            leaves.insert(host, config.clone());
        }
        Ok(config)
    }

    fn cached(&self, host: &str) -> Option<Arc<ServerConfig>> {
        self.leaves.lock().ok()?.get(host).cloned()
    }

    /// Issue a leaf certificate for `host` signed by this CA.
    pub fn issue(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, host);
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|e| Error::Tls(format!("Invalid host name '{}': {}", host, e)))?,
            ),
        }];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Tls(format!("Failed to generate leaf key: {}", e)))?;
        let leaf = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .map_err(|e| Error::Tls(format!("Failed to sign leaf for {}: {}", host, e)))?;

        tracing::debug!(host = %host, "Issued leaf certificate");

        let chain = vec![leaf.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((chain, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_issue() {
        let ca = CertificateAuthority::generate().unwrap();
        assert!(ca.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        let (chain, _key) = ca.issue("api.example.com").unwrap();
        assert_eq!(chain.len(), 1);
        let (chain, _key) = ca.issue("10.0.0.1").unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_server_config_cached() {
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca.server_config("Example.com").unwrap();
        let b = ca.server_config("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca").join("ca.pem");
        let key = dir.path().join("ca").join("ca-key.pem");

        let first = CertificateAuthority::load_or_generate(&cert, &key).unwrap();
        let second = CertificateAuthority::load_or_generate(&cert, &key).unwrap();
        assert_eq!(first.cert_pem(), second.cert_pem());
        second.issue("example.com").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
