//! Controller supervisor.
//!
//! Owns the cluster-name -> runtime map (single writer), the
//! resource-definition bootstrap, and the watch/relist cycle. Events are
//! consumed from the demultiplexer channel in stream order; each data event
//! is fully dispatched before the next is read, so per-cluster ordering is
//! preserved even though reconcilers run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crds::{ClusterSpec, NatsCluster};
use k8s_gateway::{is_already_exists, ClusterGateway};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::reconciler::{ClusterRuntime, ReconcileSettings};
use crate::watcher::{self, ClusterEvent, WatchError};

const DEFINITION_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFINITION_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const INIT_MAX_ATTEMPTS: u32 = 10;
const EVENT_CHANNEL_DEPTH: usize = 64;

/// Supervisor for all cluster reconcilers of one namespace.
pub struct Controller {
    gateway: Arc<ClusterGateway>,
    config: OperatorConfig,
    clusters: HashMap<String, ClusterRuntime>,
}

impl Controller {
    pub fn new(gateway: Arc<ClusterGateway>, config: OperatorConfig) -> Self {
        Self {
            gateway,
            config,
            clusters: HashMap::new(),
        }
    }

    fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            interval: self.config.reconcile_interval,
            pod_start_timeout: self.config.pod_start_timeout,
        }
    }

    /// Runs until clean shutdown (interrupt) or an unrecoverable watch
    /// error. Reconciler-local failures never propagate here.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let mut cursor = self.initialize_with_retry().await?;
        info!(
            "watching NatsCluster declarations in {} from cursor {cursor}",
            self.config.namespace
        );

        loop {
            let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
            let pump = tokio::spawn(watcher::pump(
                self.gateway.clone(),
                self.config.namespace.clone(),
                cursor.clone(),
                tx,
            ));

            let interrupted = loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(event) => self.dispatch(event).await,
                        None => break false,
                    },
                    _ = tokio::signal::ctrl_c() => break true,
                }
            };

            if interrupted {
                info!("interrupt received; stopping all cluster reconcilers");
                pump.abort();
                self.halt_all().await;
                return Ok(());
            }

            match pump.await {
                Ok(Ok(())) => {
                    // The pump only returns cleanly once its consumer is
                    // gone; with rx held above this means shutdown.
                    self.halt_all().await;
                    return Ok(());
                }
                Ok(Err(WatchError::HistoryExpired)) => {
                    warn!("watch history expired; relisting clusters");
                    match self.resync().await {
                        Ok(next) => cursor = next,
                        Err(e) => {
                            self.halt_all().await;
                            return Err(e);
                        }
                    }
                }
                Ok(Err(err)) => {
                    // Transient failures are retried inside the pump;
                    // anything surfacing here (a malformed frame) is
                    // unrecoverable.
                    error!("watch failed: {err}");
                    self.halt_all().await;
                    return Err(match err {
                        WatchError::Malformed(frame) => ControllerError::MalformedEvent(frame),
                        other => ControllerError::Watch(other.to_string()),
                    });
                }
                Err(join) => {
                    self.halt_all().await;
                    return Err(ControllerError::Watch(format!("watch task died: {join}")));
                }
            }
        }
    }

    /// Registers the resource definition and determines the starting
    /// cursor, retrying a bounded number of times on a Fibonacci backoff.
    async fn initialize_with_retry(&mut self) -> Result<String, ControllerError> {
        let mut backoff = FibonacciBackoff::new(30, 300);
        let mut last = String::new();

        for attempt in 1..=INIT_MAX_ATTEMPTS {
            match self.initialize().await {
                Ok(cursor) => return Ok(cursor),
                Err(e) => {
                    last = e.to_string();
                    let delay = backoff.next_backoff();
                    error!(
                        "operator initialization failed (attempt {attempt}/{INIT_MAX_ATTEMPTS}): {e}; retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(ControllerError::InitFailed {
            attempts: INIT_MAX_ATTEMPTS,
            last,
        })
    }

    async fn initialize(&mut self) -> Result<String, ControllerError> {
        match self.gateway.register_resource_definition().await {
            Ok(()) => {
                self.gateway
                    .wait_resource_definition_ready(
                        &self.config.namespace,
                        DEFINITION_POLL_INTERVAL,
                        DEFINITION_POLL_TIMEOUT,
                    )
                    .await?;
                info!("NatsCluster resource definition registered and served");
                Ok("0".to_string())
            }
            Err(e) if is_already_exists(&e) => {
                info!("resource definition already registered; recovering existing clusters");
                self.recover_existing().await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the collection, primes a runtime per existing declaration, and
    /// returns the cursor to watch from.
    async fn recover_existing(&mut self) -> Result<String, ControllerError> {
        let (clusters, cursor) = self.gateway.list_clusters(&self.config.namespace).await?;
        for cluster in clusters {
            let name = cluster.name_any();
            if !self.clusters.contains_key(&name) {
                self.admit(name, cluster.spec);
            }
        }
        Ok(cursor)
    }

    /// Applies one event to the clusters map. The supervisor is the only
    /// writer of the map, so no locking is needed.
    async fn dispatch(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::Added(cluster) => {
                let name = cluster.name_any();
                if self.clusters.contains_key(&name) {
                    // Replay after a relist; the declaration may have moved
                    // on while the watch was down.
                    self.forward(&name, cluster);
                } else {
                    self.admit(name, cluster.spec);
                }
            }
            ClusterEvent::Modified(cluster) => {
                let name = cluster.name_any();
                if self.clusters.contains_key(&name) {
                    self.forward(&name, cluster);
                } else {
                    warn!("ignoring modification event: cluster {name} not found (or dead)");
                }
            }
            ClusterEvent::Deleted(cluster) => {
                let name = cluster.name_any();
                match self.clusters.remove(&name) {
                    Some(runtime) => {
                        info!("cluster {name} deleted; stopping its reconciler");
                        runtime.delete().await;
                    }
                    None => warn!("ignoring deletion event: cluster {name} not found (or dead)"),
                }
            }
        }
    }

    /// Spawns a runtime for a newly declared cluster.
    fn admit(&mut self, name: String, spec: ClusterSpec) {
        if let Err(e) = spec.validate() {
            warn!("ignoring cluster {name} with invalid spec: {e}");
            return;
        }

        info!(
            "cluster {name} declared (size {}, version {})",
            spec.size, spec.version
        );
        let runtime = ClusterRuntime::spawn(
            self.gateway.clone(),
            name.clone(),
            self.config.namespace.clone(),
            spec,
            self.settings(),
        );
        self.clusters.insert(name, runtime);
    }

    /// Forwards an updated spec to an existing runtime.
    fn forward(&mut self, name: &str, cluster: NatsCluster) {
        if let Err(e) = cluster.spec.validate() {
            warn!("ignoring invalid spec update for cluster {name}: {e}");
            return;
        }
        if let Some(runtime) = self.clusters.get(name) {
            if !runtime.update(cluster.spec) {
                warn!("cluster {name} reconciler is dead; dropping spec update");
            }
        }
    }

    /// Reconciles the in-memory set against a fresh list after the watch
    /// history expired: synthetic additions for unseen names, synthetic
    /// deletions for vanished ones, and a spec refresh for survivors.
    async fn resync(&mut self) -> Result<String, ControllerError> {
        let (observed, cursor) = self.gateway.list_clusters(&self.config.namespace).await?;

        let observed_names: HashSet<String> = observed.iter().map(|c| c.name_any()).collect();
        let vanished: Vec<String> = self
            .clusters
            .keys()
            .filter(|name| !observed_names.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(runtime) = self.clusters.remove(&name) {
                info!("cluster {name} vanished while the watch was down; tearing it down");
                runtime.delete().await;
            }
        }

        for cluster in observed {
            let name = cluster.name_any();
            if self.clusters.contains_key(&name) {
                self.forward(&name, cluster);
            } else {
                self.admit(name, cluster.spec);
            }
        }

        Ok(cursor)
    }

    /// Cascades stop to every runtime and awaits their completion latches.
    /// Cluster resources are left in place for the next instance.
    async fn halt_all(&mut self) {
        for (name, runtime) in self.clusters.drain() {
            debug!("stopping reconciler of cluster {name}");
            runtime.halt().await;
        }
    }
}
