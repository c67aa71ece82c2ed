//! NATS Operator
//!
//! Manages NATS clusters declared as `NatsCluster` custom resources:
//! registers the resource kind with the API server, watches the declared
//! set, and runs one reconciler per cluster that drives peer pods and the
//! companion services toward the declared size and version.

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod watcher;

use std::sync::Arc;

use config::OperatorConfig;
use controller::Controller;
use error::ControllerError;
use k8s_gateway::ClusterGateway;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting NATS operator");

    let config = OperatorConfig::from_env()?;
    config.validate()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!(
        "  Master host: {}",
        config.master_host.as_deref().unwrap_or("(in-cluster)")
    );
    info!("  PV provisioner: {}", config.pv_provisioner);

    let gateway = Arc::new(ClusterGateway::connect(&config.connect_options()).await?);

    let controller = Controller::new(gateway, config);
    controller.run().await
}
