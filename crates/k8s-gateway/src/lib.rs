//! Kubernetes API gateway for the NATS operator.
//!
//! Typed wrapper over the orchestrator surface the operator touches: peer
//! pods, the per-cluster headless services, and the `NatsCluster` custom
//! resource collection (list, watch, registration). Templating of the
//! emitted pods and services lives here too so callers only ever deal in
//! cluster names and specs.

pub mod client;
pub mod error;
pub mod templates;
pub mod throttle;

pub use client::{ClusterGateway, ConnectOptions};
pub use error::{is_already_exists, is_not_found, GatewayError};
