//! NATS operator CRD definitions.
//!
//! Custom resource types served under the `nats.io` API group.

pub mod nats_cluster;

pub use nats_cluster::*;
