//! pvclone - host-assisted PVC cloning and authenticated uploads for Kubernetes
//!
//! pvclone copies the contents of one persistent volume claim into another by
//! coordinating a pair of worker pods that speak a TLS-authenticated upload
//! protocol, and exposes a bearer-token-authenticated proxy so clients outside
//! the cluster can push data to an in-cluster upload server.
//!
//! # Architecture
//!
//! - A target PVC annotated with a clone request and a signed clone token is
//!   picked up by the clone controller, which validates the request, places a
//!   finalizer, and launches a source worker pod in the source namespace.
//! - The source pod reads the source volume and streams it to the target's
//!   upload server over mutual TLS; completion is reported back through PVC
//!   annotations written by the upload side.
//! - The upload proxy terminates external HTTPS uploads, validates short-lived
//!   RSA-signed tokens, waits for the target to become ready, and streams the
//!   body through a per-request mTLS client.
//!
//! # Modules
//!
//! - [`token`] - issuance and validation of signed, operation-bound tokens
//! - [`controller`] - the clone reconciler, annotation vocabulary and the
//!   source-pod factory
//! - [`proxy`] - the external upload proxy
//! - [`pki`] - client certificate issuance and cert/bundle fetchers
//! - [`error`] - error types shared across the crate

#![deny(missing_docs)]

pub mod controller;
pub mod error;
pub mod pki;
pub mod proxy;
pub mod token;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the upload proxy listener
///
/// Port 8443 is used instead of 443 to avoid requiring root privileges.
pub const DEFAULT_PROXY_PORT: u16 = 8443;

/// Synchronous upload endpoint path, served by the proxy and by every
/// per-target upload server
pub const UPLOAD_PATH_SYNC: &str = "/upload/sync";

/// Asynchronous upload endpoint path (same handler as the sync path; the
/// upload server differs in when it acknowledges)
pub const UPLOAD_PATH_ASYNC: &str = "/upload/async";
