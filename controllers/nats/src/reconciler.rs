//! Per-cluster reconciler.
//!
//! One cooperative task per declared cluster. The task owns the current
//! spec; the supervisor forwards updates over a channel and signals stop
//! through a cancellation token. Each tick applies at most one mutation so
//! failures stay local: replace one wrong-version peer, then trim excess,
//! then grow toward the declared size.

use std::sync::Arc;
use std::time::Duration;

use crds::ClusterSpec;
use k8s_gateway::{is_already_exists, templates, ClusterGateway, GatewayError};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconcile loop tunables.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Cadence of the periodic reconcile tick.
    pub interval: Duration,
    /// How long a created peer may take to reach Running.
    pub pod_start_timeout: Duration,
}

/// Supervisor-side handle to a running cluster reconciler.
///
/// At most one of these exists per cluster name; the supervisor's map is
/// the only place they live.
pub struct ClusterRuntime {
    name: String,
    namespace: String,
    gateway: Arc<ClusterGateway>,
    updates: mpsc::UnboundedSender<ClusterSpec>,
    stop: CancellationToken,
    done: JoinHandle<()>,
}

impl ClusterRuntime {
    /// Spawns the reconciler task for a newly observed cluster.
    pub fn spawn(
        gateway: Arc<ClusterGateway>,
        name: String,
        namespace: String,
        spec: ClusterSpec,
        settings: ReconcileSettings,
    ) -> Self {
        let stop = CancellationToken::new();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let worker = Reconciler {
            gateway: gateway.clone(),
            name: name.clone(),
            namespace: namespace.clone(),
            spec,
            peers: Vec::new(),
            settings,
        };
        let done = tokio::spawn(worker.run(updates_rx, stop.clone()));

        Self {
            name,
            namespace,
            gateway,
            updates: updates_tx,
            stop,
            done,
        }
    }

    /// Forwards a new spec; the next tick sees it. Returns false when the
    /// reconciler already exited (failed startup).
    pub fn update(&self, spec: ClusterSpec) -> bool {
        self.updates.send(spec).is_ok()
    }

    /// Stops the loop and waits for it, leaving cluster resources in place.
    pub async fn halt(self) {
        self.stop.cancel();
        let _ = self.done.await;
    }

    /// Stops the loop, waits for it, then removes the cluster's services
    /// and any remaining peer pods. Best-effort: missing objects are fine.
    pub async fn delete(self) {
        let ClusterRuntime {
            name,
            namespace,
            gateway,
            updates: _updates,
            stop,
            done,
        } = self;

        stop.cancel();
        let _ = done.await;
        teardown(&gateway, &name, &namespace).await;
    }
}

async fn teardown(gateway: &ClusterGateway, name: &str, namespace: &str) {
    info!("tearing down cluster {namespace}/{name}");

    if let Err(e) = gateway.delete_mgmt_service(name, namespace).await {
        warn!("failed to delete mgmt service of {name}: {e}");
    }
    if let Err(e) = gateway.delete_client_service(name, namespace).await {
        warn!("failed to delete client service of {name}: {e}");
    }

    match gateway.list_peers(namespace, name).await {
        Ok(pods) => {
            for pod in &pods {
                let pod_name = pod.name_any();
                if let Err(e) = gateway.delete_peer(namespace, &pod_name).await {
                    warn!("failed to delete peer {pod_name}: {e}");
                }
            }
        }
        Err(e) => warn!("failed to list peers of {name} during teardown: {e}"),
    }
}

struct Reconciler {
    gateway: Arc<ClusterGateway>,
    name: String,
    namespace: String,
    spec: ClusterSpec,
    /// Names of the running peers observed on the last tick.
    peers: Vec<String>,
    settings: ReconcileSettings,
}

impl Reconciler {
    async fn run(
        mut self,
        mut updates: mpsc::UnboundedReceiver<ClusterSpec>,
        stop: CancellationToken,
    ) {
        if let Err(e) = self.startup().await {
            error!(
                "startup of cluster {}/{} failed: {e}",
                self.namespace, self.name
            );
            return;
        }

        let mut tick = tokio::time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                maybe = updates.recv() => match maybe {
                    Some(spec) => self.apply_update(spec),
                    // Supervisor handle gone; nothing left to do.
                    None => break,
                },
                _ = tick.tick() => {
                    if self.spec.paused {
                        debug!("cluster {} is paused; skipping reconcile", self.name);
                        continue;
                    }
                    // Long waits inside a tick still observe the stop signal;
                    // an in-flight call is abandoned, not awaited to the end.
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        result = self.reconcile_once() => {
                            if let Err(e) = result {
                                warn!("reconcile of cluster {} failed (will retry): {e}", self.name);
                            }
                        }
                    }
                }
            }
        }

        debug!("reconcile loop of cluster {}/{} exited", self.namespace, self.name);
    }

    /// Provisions the companion services. AlreadyExists means a previous
    /// instance got there first (crash recovery) and is not an error.
    async fn startup(&self) -> Result<(), GatewayError> {
        match self.gateway.create_mgmt_service(&self.name, &self.namespace).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                debug!("mgmt service of {} already present", self.name);
            }
            Err(e) => return Err(e),
        }

        match self.gateway.create_client_service(&self.name, &self.namespace).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                debug!("client service of {} already present", self.name);
            }
            Err(e) => return Err(e),
        }

        info!("cluster {}/{} services ready", self.namespace, self.name);
        Ok(())
    }

    fn apply_update(&mut self, spec: ClusterSpec) {
        if spec.version != self.spec.version {
            info!(
                "cluster {} version {} -> {}",
                self.name, self.spec.version, spec.version
            );
        }
        if spec.size != self.spec.size {
            info!("cluster {} size {} -> {}", self.name, self.spec.size, spec.size);
        }
        self.spec = spec;
    }

    async fn reconcile_once(&mut self) -> Result<(), GatewayError> {
        let pods = self.gateway.list_peers(&self.namespace, &self.name).await?;

        let observed: Vec<String> = running_peers(&pods).iter().map(|p| p.name_any()).collect();
        for peer in lost_peers(&self.peers, &observed) {
            info!(
                "peer {peer} of cluster {} disappeared since the last tick (size {} declared, {} running)",
                self.name,
                self.spec.size,
                observed.len()
            );
        }

        match plan_next_action(&self.spec, &pods) {
            Some(PeerAction::Replace(peer)) => {
                info!(
                    "replacing peer {peer} of cluster {} running an outdated version",
                    self.name
                );
                self.gateway.delete_peer(&self.namespace, &peer).await?;
            }
            Some(PeerAction::Remove(peer)) => {
                info!("scaling down cluster {}: removing peer {peer}", self.name);
                self.gateway.delete_peer(&self.namespace, &peer).await?;
            }
            Some(PeerAction::Add) => {
                info!(
                    "scaling up cluster {} toward {} peers",
                    self.name, self.spec.size
                );
                let pod = templates::make_pod_spec(&self.name, &self.spec);
                let created = self
                    .gateway
                    .create_pod_and_wait(&self.namespace, pod, self.settings.pod_start_timeout)
                    .await?;
                debug!("peer {} of cluster {} is running", created.name_any(), self.name);
            }
            None => {}
        }

        self.peers = observed;
        Ok(())
    }
}

/// Peers seen running on the previous tick that are no longer running:
/// externally deleted, crashed, or trimmed by the previous action.
fn lost_peers(previous: &[String], observed: &[String]) -> Vec<String> {
    previous
        .iter()
        .filter(|peer| !observed.contains(peer))
        .cloned()
        .collect()
}

/// One mutation, chosen per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerAction {
    /// Delete a peer running the wrong version; its replacement is created
    /// at the desired version on a later tick.
    Replace(String),
    /// Delete the newest excess peer.
    Remove(String),
    /// Create one peer toward the desired size.
    Add,
}

fn is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

fn running_peers(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter().filter(|p| is_running(p)).collect()
}

/// Picks at most one action bringing the observed peers closer to the
/// declared spec. Priority: version replacement, then trimming excess,
/// then growing the deficit.
fn plan_next_action(spec: &ClusterSpec, pods: &[Pod]) -> Option<PeerAction> {
    let running = running_peers(pods);

    if let Some(outdated) = running
        .iter()
        .find(|p| templates::peer_version(p) != Some(spec.version.as_str()))
    {
        return Some(PeerAction::Replace(outdated.name_any()));
    }

    let desired = spec.size.max(0) as usize;
    if running.len() > desired {
        let newest = running
            .iter()
            .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0))?;
        return Some(PeerAction::Remove(newest.name_any()));
    }
    if running.len() < desired {
        return Some(PeerAction::Add);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::api::core::v1::PodStatus;
    use std::collections::BTreeMap;

    fn spec(size: i32, version: &str) -> ClusterSpec {
        ClusterSpec {
            size,
            version: version.to_string(),
            paused: false,
            anti_affinity: false,
            node_selector: BTreeMap::new(),
        }
    }

    fn peer(name: &str, version: &str, phase: &str, created_secs: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    templates::VERSION_ANNOTATION.to_string(),
                    version.to_string(),
                )])),
                creation_timestamp: Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap())),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn converged_cluster_needs_no_action() {
        let pods = vec![
            peer("a-1", "0.9.2", "Running", 10),
            peer("a-2", "0.9.2", "Running", 20),
            peer("a-3", "0.9.2", "Running", 30),
        ];
        assert_eq!(plan_next_action(&spec(3, "0.9.2"), &pods), None);
    }

    #[test]
    fn deficit_grows_by_one() {
        let pods = vec![peer("a-1", "0.9.2", "Running", 10)];
        assert_eq!(plan_next_action(&spec(3, "0.9.2"), &pods), Some(PeerAction::Add));
    }

    #[test]
    fn empty_cluster_grows() {
        assert_eq!(plan_next_action(&spec(3, "0.9.2"), &[]), Some(PeerAction::Add));
    }

    #[test]
    fn excess_removes_newest_peer() {
        let pods = vec![
            peer("a-1", "0.9.2", "Running", 10),
            peer("a-3", "0.9.2", "Running", 30),
            peer("a-2", "0.9.2", "Running", 20),
        ];
        assert_eq!(
            plan_next_action(&spec(2, "0.9.2"), &pods),
            Some(PeerAction::Remove("a-3".to_string()))
        );
    }

    #[test]
    fn wrong_version_is_replaced_before_scaling() {
        // Even with an excess peer, the outdated one is dealt with first so
        // a rolling upgrade replaces one peer at a time.
        let pods = vec![
            peer("a-1", "0.9.2", "Running", 10),
            peer("a-2", "0.9.4", "Running", 20),
            peer("a-3", "0.9.4", "Running", 30),
            peer("a-4", "0.9.4", "Running", 40),
        ];
        assert_eq!(
            plan_next_action(&spec(3, "0.9.4"), &pods),
            Some(PeerAction::Replace("a-1".to_string()))
        );
    }

    #[test]
    fn downgrade_is_treated_like_any_version_change() {
        let pods = vec![peer("a-1", "0.9.4", "Running", 10)];
        assert_eq!(
            plan_next_action(&spec(1, "0.9.2"), &pods),
            Some(PeerAction::Replace("a-1".to_string()))
        );
    }

    #[test]
    fn non_running_pods_are_not_counted() {
        // A pod still starting neither satisfies the deficit nor gets
        // picked for version replacement.
        let pods = vec![
            peer("a-1", "0.9.2", "Running", 10),
            peer("a-2", "0.9.0", "Pending", 20),
        ];
        assert_eq!(plan_next_action(&spec(2, "0.9.2"), &pods), Some(PeerAction::Add));
    }

    #[test]
    fn lost_peers_reports_vanished_names() {
        let previous = vec!["a-1".to_string(), "a-2".to_string(), "a-3".to_string()];
        let observed = vec!["a-1".to_string(), "a-3".to_string()];
        assert_eq!(lost_peers(&previous, &observed), vec!["a-2".to_string()]);
    }

    #[test]
    fn lost_peers_is_empty_when_peers_only_joined() {
        let previous = vec!["a-1".to_string()];
        let observed = vec!["a-1".to_string(), "a-2".to_string()];
        assert!(lost_peers(&previous, &observed).is_empty());
        assert!(lost_peers(&[], &observed).is_empty());
    }

    #[test]
    fn unannotated_peer_counts_as_wrong_version() {
        let mut pod = peer("a-1", "0.9.2", "Running", 10);
        pod.metadata.annotations = None;
        assert_eq!(
            plan_next_action(&spec(1, "0.9.2"), &[pod]),
            Some(PeerAction::Replace("a-1".to_string()))
        );
    }
}
