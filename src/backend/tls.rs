//! Client TLS for backend connections.
//!
//! PEM files are read once at construction; unreadable or unpaired files are
//! construction errors. rustls only negotiates TLS 1.2 and newer.

use crate::core::config::BackendConfig;
use crate::core::error::{StorageError, StorageResult};
use std::path::Path;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// PEM file locations for a backend client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    /// CA bundle used to verify the server.
    pub ca_file: Option<String>,
    /// Client certificate chain for mTLS.
    pub cert_file: Option<String>,
    /// Client private key for mTLS.
    pub key_file: Option<String>,
}

impl TlsFiles {
    /// Collect the TLS paths from backend configuration.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            ca_file: config.ca_file.clone(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
        }
    }

    /// Whether any TLS material is configured.
    pub fn is_configured(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some()
    }

    /// Build the tonic client TLS configuration.
    ///
    /// Without a CA file the bundled web PKI roots verify the server.
    pub fn load(&self, domain: Option<&str>) -> StorageResult<ClientTlsConfig> {
        let mut tls = ClientTlsConfig::new();
        if let Some(domain) = domain {
            tls = tls.domain_name(domain);
        }

        tls = match &self.ca_file {
            Some(path) => tls.ca_certificate(Certificate::from_pem(read_pem(path, "CA")?)),
            None => tls.with_webpki_roots(),
        };

        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let identity = Identity::from_pem(
                    read_pem(cert, "client certificate")?,
                    read_pem(key, "client key")?,
                );
                tls = tls.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::construction(
                    "client certificate and key must be configured together",
                ))
            }
        }
        Ok(tls)
    }
}

fn read_pem(path: &str, what: &str) -> StorageResult<Vec<u8>> {
    if !Path::new(path).exists() {
        return Err(StorageError::construction(format!(
            "{} file not found: {}",
            what, path
        )));
    }
    std::fs::read(path)
        .map_err(|e| StorageError::construction(format!("failed to read {} {}: {}", what, path, e)))
}
