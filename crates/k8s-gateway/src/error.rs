//! Gateway errors and API status classification.
//!
//! The classification helpers map transport-level status responses into the
//! two kinds callers branch on: a create that hit an existing object, and a
//! read or delete that hit a missing one. Both are recoverable by design.

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Pod did not reach Running before the deadline. The pod is left in
    /// place; the caller decides on cleanup.
    #[error("timed out waiting for pod {0} to become running")]
    PodTimeout(String),

    /// Pod was removed while we were waiting for it to start.
    #[error("pod {0} was removed while waiting for it to become running")]
    PodVanished(String),

    /// The single-object watch used to await pod readiness failed.
    #[error("watch failed while waiting for pod {pod}: {message}")]
    PodWatch { pod: String, message: String },

    /// The NatsCluster collection was not served before the deadline.
    #[error("timed out waiting for the NatsCluster definition to be served")]
    DefinitionNotReady,

    /// Client configuration problem.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

/// True when the API rejected a create because the object already exists.
pub fn is_already_exists(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Kube(e) if kube_status(e, 409, "AlreadyExists"))
}

/// True when the API reported a missing object.
pub fn is_not_found(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Kube(e) if kube_status(e, 404, "NotFound"))
}

pub(crate) fn kube_not_found(err: &kube::Error) -> bool {
    kube_status(err, 404, "NotFound")
}

fn kube_status(err: &kube::Error, code: u16, reason: &str) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code && resp.reason == reason)
}
