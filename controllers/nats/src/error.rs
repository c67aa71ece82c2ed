//! Controller-specific error types.

use k8s_gateway::GatewayError;
use thiserror::Error;

/// Errors that can occur in the NATS operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// API gateway error
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Initialization retries exhausted
    #[error("operator initialization failed after {attempts} attempts: {last}")]
    InitFailed { attempts: u32, last: String },

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// Watch stream produced an undecodable frame
    #[error("malformed watch event: {0}")]
    MalformedEvent(String),
}
