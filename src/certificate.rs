//! TLS material for the secure listener
//! Loads the configured PEM key/cert pair, or generates a self-signed
//! certificate covering the proxy hostname and all of its subdomains.

use crate::error::{ProxyError, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// PEM encoded certificate chain and private key
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Read a certificate and key from disk
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem =
            std::fs::read_to_string(cert_path).map_err(|e| ProxyError::io(cert_path, e))?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| ProxyError::io(key_path, e))?;

        Ok(Self { cert_pem, key_pem })
    }

    /// Generate a self-signed certificate for `hostname` and `*.hostname`
    pub fn self_signed(hostname: &str) -> Result<Self> {
        let subject_alt_names = vec![hostname.to_string(), format!("*.{}", hostname)];

        let cert = generate_simple_self_signed(subject_alt_names)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        let key_pem = cert.serialize_private_key_pem();

        info!("Generated self-signed certificate for: {}", hostname);

        Ok(Self { cert_pem, key_pem })
    }

    /// Build a TLS acceptor for the secure listener
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(self.cert_pem.as_bytes()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| ProxyError::Tls(format!("invalid certificate: {}", e)))?;
        if chain.is_empty() {
            return Err(ProxyError::Tls("no certificate found".to_string()));
        }

        let key: PrivateKeyDer<'static> = private_key(&mut BufReader::new(self.key_pem.as_bytes()))
            .map_err(|e| ProxyError::Tls(format!("invalid private key: {}", e)))?
            .ok_or_else(|| ProxyError::Tls("no private key found".to_string()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_self_signed() {
        let material = TlsMaterial::self_signed("localhost").unwrap();
        assert!(material.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(material.key_pem.contains("PRIVATE KEY"));
        assert!(material.acceptor().is_ok());
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempdir().unwrap();
        let generated = TlsMaterial::self_signed("proxy.test").unwrap();
        std::fs::write(dir.path().join("server.crt"), &generated.cert_pem).unwrap();
        std::fs::write(dir.path().join("server.key"), &generated.key_pem).unwrap();

        let material =
            TlsMaterial::load(&dir.path().join("server.crt"), &dir.path().join("server.key"))
                .unwrap();
        assert_eq!(material.cert_pem, generated.cert_pem);
        assert!(material.acceptor().is_ok());
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let material = TlsMaterial {
            cert_pem: "not a certificate".to_string(),
            key_pem: "not a key".to_string(),
        };
        assert!(matches!(material.acceptor(), Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        let material = TlsMaterial::self_signed("localhost").unwrap();
        assert!(!format!("{:?}", material).contains("PRIVATE KEY"));
    }
}
