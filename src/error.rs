//! Error types for the pvclone controller and upload proxy

use thiserror::Error;

/// Main error type for pvclone operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Clone request validation error (bad request string, incompatible specs)
    #[error("validation error: {0}")]
    Validation(String),

    /// Token error. Deliberately opaque: callers must not branch on the
    /// underlying failure kind (signature, issuer, expiry, ...).
    #[error("token error: {0}")]
    Token(String),

    /// Certificate generation or parsing error
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// Upload proxy error (client construction, upstream transport)
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A state invariant no longer holds (e.g. duplicate source pods).
    /// Returned to the queue so the condition keeps surfacing until an
    /// operator intervenes.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an opaque token error with the given message
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }

    /// Create a proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invariant-violation error with the given message
    pub fn invariant_violated(msg: impl Into<String>) -> Self {
        Self::InvariantViolated(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for user-fixable failures that must not be retried by the
    /// reconcile queue. These surface as Events on the PVC and leave the
    /// object waiting for an edit.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Token(_))
    }
}
