//! TLS configuration and connector construction.

use super::{PgError, PgResult};
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// TLS settings. Without a CA the platform's native roots are trusted;
/// a client certificate and key enable mutual TLS.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// CA certificate(s) in PEM format for server verification
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Client certificate in PEM format
    pub client_cert_pem: Option<Vec<u8>>,
    /// Client private key in PEM format
    pub client_key_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_pem", &self.ca_cert_pem.is_some())
            .field("client_cert_pem", &self.client_cert_pem.is_some())
            .field("client_key_pem", &self.client_key_pem.is_some())
            .finish()
    }
}

impl TlsConfig {
    /// Create a TLS config from file paths.
    pub fn from_files(
        ca_path: Option<impl AsRef<std::path::Path>>,
        client: Option<(impl AsRef<std::path::Path>, impl AsRef<std::path::Path>)>,
    ) -> std::io::Result<Self> {
        let (client_cert_pem, client_key_pem) = match client {
            Some((cert, key)) => (Some(std::fs::read(cert)?), Some(std::fs::read(key)?)),
            None => (None, None),
        };
        Ok(Self {
            ca_cert_pem: ca_path.map(std::fs::read).transpose()?,
            client_cert_pem,
            client_key_pem,
        })
    }

    fn root_store(&self) -> PgResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        if let Some(ca_pem) = &self.ca_cert_pem {
            let certs = rustls_pemfile::certs(&mut ca_pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| PgError::Connection(format!("Invalid CA certificate: {}", e)))?;
            let (added, _) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(PgError::Connection(
                    "No usable CA certificate in PEM".to_string(),
                ));
            }
        } else {
            // Use system certs
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                tracing::warn!("Skipping native root certificate: {}", err);
            }
            roots.add_parsable_certificates(native.certs);
        }
        Ok(roots)
    }

    /// Build a rustls connector from this configuration.
    pub fn connector(&self) -> PgResult<TlsConnector> {
        let builder = ClientConfig::builder().with_root_certificates(self.root_store()?);
        let config = match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs: Vec<CertificateDer<'static>> =
                    rustls_pemfile::certs(&mut cert_pem.as_slice())
                        .collect::<Result<_, _>>()
                        .map_err(|e| {
                            PgError::Connection(format!("Invalid client certificate: {}", e))
                        })?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| PgError::Connection(format!("Invalid client key: {:?}", e)))?
                    .ok_or_else(|| PgError::Connection("No private key found in PEM".to_string()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| PgError::Connection(format!("Invalid client cert/key: {}", e)))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(PgError::Connection(
                    "Client certificate and key must be configured together".to_string(),
                ));
            }
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Validate a host name for SNI and certificate verification.
pub(crate) fn server_name(host: &str) -> PgResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| PgError::Connection("Invalid hostname for TLS".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatched_client_auth() {
        let config = TlsConfig {
            ca_cert_pem: None,
            client_cert_pem: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
            client_key_pem: None,
        };
        assert!(matches!(config.connector(), Err(PgError::Connection(_))));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("db.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
