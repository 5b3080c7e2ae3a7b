//! Client certificate issuance and certificate material fetchers
//!
//! Every clone source worker authenticates to the target's upload server
//! with a client certificate minted just for it, bound to the upload client
//! name requested on the target PVC. The controller holds the signing CA;
//! the upload proxy only reads its own keypair and the upload server CA
//! bundle, re-fetched per request so rotated material is picked up without
//! a restart.

use async_trait::async_trait;
use rcgen::{
    CertificateParams, DnType, DnValue, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose,
};
use thiserror::Error;
use time::OffsetDateTime;

#[cfg(test)]
use mockall::automock;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Signing a worker certificate failed
    #[error("worker certificate signing failed: {0}")]
    Sign(String),

    /// Generating a worker keypair failed
    #[error("worker key generation failed: {0}")]
    Keygen(String),

    /// The configured CA certificate or key is unusable
    #[error("invalid CA material: {0}")]
    InvalidCa(String),

    /// IO error reading certificate material
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A freshly minted client certificate and its private key, both PEM
#[derive(Debug, Clone)]
pub struct ClientCert {
    /// Certificate in PEM form
    pub cert_pem: Vec<u8>,
    /// Private key in PEM form
    pub key_pem: Vec<u8>,
}

/// Mints client certificates for upload-protocol workers
///
/// The common name becomes the worker's identity on the wire; the upload
/// server authorizes clients by this name.
#[cfg_attr(test, automock)]
pub trait ClientCertGenerator: Send + Sync {
    /// Generate a keypair and a certificate for `common_name`, valid from
    /// now for `valid_for`
    fn make_client_cert(
        &self,
        common_name: &str,
        valid_for: std::time::Duration,
    ) -> Result<ClientCert>;
}

/// Fetches the current client certificate and key (PEM)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertFetcher: Send + Sync {
    /// Current client certificate bytes
    async fn cert_bytes(&self) -> Result<Vec<u8>>;
    /// Current client private key bytes
    async fn key_bytes(&self) -> Result<Vec<u8>>;
}

/// Fetches the current server CA bundle (PEM, possibly several certificates)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertBundleFetcher: Send + Sync {
    /// Current CA bundle bytes
    async fn bundle_bytes(&self) -> Result<Vec<u8>>;
}

/// The CA that signs per-worker upload client certificates.
///
/// Production always loads the CA from a mounted cert/key pair; the signing
/// key is parsed once at startup and held as a ready-to-sign issuer for the
/// life of the process. Worker certificates are one-shot: a fresh keypair
/// per source pod, never reused across clones.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
}

impl CertificateAuthority {
    /// Load the CA from PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let signing_key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::InvalidCa(format!("CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, signing_key)
            .map_err(|e| PkiError::InvalidCa(format!("CA certificate: {}", e)))?;
        Ok(Self { issuer })
    }
}

impl ClientCertGenerator for CertificateAuthority {
    fn make_client_cert(
        &self,
        common_name: &str,
        valid_for: std::time::Duration,
    ) -> Result<ClientCert> {
        let worker_key = KeyPair::generate().map_err(|e| PkiError::Keygen(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| PkiError::Sign(e.to_string()))?;
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );

        // ClientAuth only: workers push to the upload server and never
        // serve anything themselves.
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + valid_for;

        let cert = params
            .signed_by(&worker_key, &self.issuer)
            .map_err(|e| PkiError::Sign(e.to_string()))?;

        Ok(ClientCert {
            cert_pem: cert.pem().into_bytes(),
            key_pem: worker_key.serialize_pem().into_bytes(),
        })
    }
}

/// Client cert/key fetcher backed by files (e.g. a mounted Secret)
pub struct FileCertFetcher {
    /// Path to the client certificate PEM
    pub cert_path: std::path::PathBuf,
    /// Path to the client key PEM
    pub key_path: std::path::PathBuf,
}

#[async_trait]
impl CertFetcher for FileCertFetcher {
    async fn cert_bytes(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.cert_path).await?)
    }

    async fn key_bytes(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.key_path).await?)
    }
}

/// CA bundle fetcher backed by a file (e.g. a mounted ConfigMap)
pub struct FileCertBundleFetcher {
    /// Path to the bundle PEM
    pub path: std::path::PathBuf,
}

#[async_trait]
impl CertBundleFetcher for FileCertBundleFetcher {
    async fn bundle_bytes(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}
