//! Clone controller: annotation vocabulary, reconciler and pod factory
//!
//! All durable control state lives as annotations, labels and finalizers on
//! PVC and pod objects; this module defines that vocabulary plus the pure
//! helpers shared by the reconciler and the upload proxy.
//!
//! # Modules
//!
//! - [`clone`] - the level-triggered clone reconciler and its trait seams
//! - [`pod`] - the clone-source worker pod factory

pub mod clone;
pub mod pod;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::{Error, Result};

/// Annotation marking a PVC as a clone target; value is `<srcNs>/<srcName>`
pub const ANN_CLONE_REQUEST: &str = "k8s.io/CloneRequest";

/// Annotation set to `"true"` exactly once when a clone completed
pub const ANN_CLONE_OF: &str = "k8s.io/CloneOf";

/// Annotation carrying the signed token authorizing a specific clone
pub const ANN_CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.clone.token";

/// Annotation naming the identity to embed in the worker's client cert
pub const ANN_UPLOAD_CLIENT_NAME: &str = "cdi.kubevirt.io/uploadClientName";

/// Annotation mirroring the latest phase of the target's upload server pod
pub const ANN_POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";

/// Annotation set to `"true"` when the target upload server is ready
pub const ANN_POD_READY: &str = "cdi.kubevirt.io/storage.pod.ready";

/// Annotation tracking a high-water mark of source pod restarts
pub const ANN_POD_RESTARTS: &str = "cdi.kubevirt.io/storage.pod.restarts";

/// Annotation marking pods created by this controller
pub const ANN_CREATED_BY: &str = "cdi.kubevirt.io/storage.createdByController";

/// Annotation encoding cross-namespace parentage as `<ns>/<name>` of the
/// target PVC (native owner references cannot cross namespaces)
pub const ANN_OWNER_REF: &str = "cdi.kubevirt.io/storage.ownerRef";

/// Label used to look up a target PVC's clone source pod
pub const LABEL_CLONE_UNIQUE_ID: &str = "cdi.kubevirt.io/storage.clone.cloneUniqeId";

/// Finalizer held on the target PVC while a source pod exists or may exist
pub const CLONE_SOURCE_POD_FINALIZER: &str = "cdi.kubevirt.io/cloneSource";

/// Pod phase string reported for completed upload servers
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";

/// Well-known event reason strings
pub mod reasons {
    /// Clone data transfer completed and `CloneOf` was set
    pub const CLONE_SUCCEEDED: &str = "CloneSucceeded";
    /// Clone request failed validation and awaits a spec edit
    pub const CLONE_VALIDATION_FAILED: &str = "CloneValidationFailed";
}

/// Well-known event action strings
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

/// Read an annotation off a PVC
pub fn annotation<'a>(pvc: &'a PersistentVolumeClaim, key: &str) -> Option<&'a str> {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Parse the clone request annotation into `(source_namespace, source_name)`.
///
/// Anything other than exactly two non-empty `/`-separated parts means the
/// PVC is not a clone target.
pub fn parse_clone_request_annotation(pvc: &PersistentVolumeClaim) -> Option<(String, String)> {
    let ann = annotation(pvc, ANN_CLONE_REQUEST)?;
    let mut parts = ann.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
            Some((ns.to_string(), name.to_string()))
        }
        _ => None,
    }
}

/// True when the upload-controller reported the target's upload server pod
/// as succeeded
pub fn pod_succeeded_from_pvc(pvc: &PersistentVolumeClaim) -> bool {
    annotation(pvc, ANN_POD_PHASE) == Some(POD_PHASE_SUCCEEDED)
}

/// Parsed readiness annotation; absent or unparseable reads as `None`
pub fn pod_ready_from_pvc(pvc: &PersistentVolumeClaim) -> Option<bool> {
    annotation(pvc, ANN_POD_READY).and_then(|v| v.parse().ok())
}

/// The deterministic name of a target PVC's clone source pod
pub fn clone_source_pod_name(target: &PersistentVolumeClaim) -> String {
    format!("{}-source-pod", target.uid().unwrap_or_default())
}

/// Compose the in-cluster URL of a target PVC's upload server
pub fn upload_server_url(namespace: &str, pvc_name: &str, path: &str) -> String {
    format!("https://cdi-upload-{}.{}.svc{}", pvc_name, namespace, path)
}

/// Parse a storage `Quantity` into bytes, rounding up.
///
/// Neither `kube` nor `k8s-openapi` interprets quantity strings, and the
/// size-compatibility rule needs byte-exact comparison. Supports plain
/// integers, decimal fractions, binary suffixes (Ki..Ei), decimal suffixes
/// (k..E) and milli.
pub fn parse_quantity(q: &Quantity) -> Result<i128> {
    let s = q.0.trim();

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (mult_num, mult_den): (i128, i128) = match suffix {
        "" => (1, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "m" => (1, 1_000),
        _ => {
            return Err(Error::validation(format!(
                "cannot parse quantity {:?}",
                q.0
            )))
        }
    };

    let mut digits = number.splitn(2, '.');
    let int_part = digits.next().unwrap_or("");
    let frac_part = digits.next().unwrap_or("");
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(Error::validation(format!("cannot parse quantity {:?}", q.0)));
    }

    let int: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| Error::validation(format!("cannot parse quantity {:?}", q.0)))?
    };
    let frac: i128 = if frac_part.is_empty() {
        0
    } else {
        frac_part
            .parse()
            .map_err(|_| Error::validation(format!("cannot parse quantity {:?}", q.0)))?
    };

    let scale: i128 = 10_i128.pow(frac_part.len() as u32);
    let numerator = (int * scale + frac) * mult_num;
    let denominator = scale * mult_den;

    // Round up, matching how sizes are compared elsewhere in the ecosystem
    Ok((numerator + denominator - 1) / denominator)
}
