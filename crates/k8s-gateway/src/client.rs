//! Kubernetes API client for NATS cluster management.
//!
//! One `ClusterGateway` is shared by the supervisor and every per-cluster
//! reconciler. Mutations are idempotent from the caller's perspective:
//! deletes swallow NotFound, and create callers branch on
//! [`is_already_exists`](crate::error::is_already_exists).

use std::path::PathBuf;
use std::time::Duration;

use crds::NatsCluster;
use futures::Stream;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, CustomResourceExt, ResourceExt};
use kube_runtime::wait::{await_condition, conditions};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{is_not_found, kube_not_found, GatewayError};
use crate::templates;
use crate::throttle::RateGate;

/// Server-side watch session length. The API server closes the response
/// after this many seconds; the consumer reopens at its current cursor.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Connection settings for the API client.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// API server URL; `None` selects in-cluster configuration.
    pub master_host: Option<String>,
    /// Skip server certificate verification.
    pub tls_insecure: bool,
    /// CA bundle for verifying the API server.
    pub ca_file: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// Client key for mutual TLS.
    pub key_file: Option<PathBuf>,
    /// Sustained request rate against the API server.
    pub qps: u32,
    /// Momentary allowance on top of `qps`.
    pub burst: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            master_host: None,
            tls_insecure: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            qps: 100,
            burst: 100,
        }
    }
}

/// Typed wrapper over the orchestrator REST and watch endpoints.
pub struct ClusterGateway {
    client: Client,
    gate: RateGate,
}

impl ClusterGateway {
    /// Connects using the given options: in-cluster configuration when no
    /// master host is set, an explicit endpoint otherwise.
    pub async fn connect(opts: &ConnectOptions) -> Result<Self, GatewayError> {
        let config = match &opts.master_host {
            None => Config::incluster().map_err(|e| GatewayError::InvalidConfig(e.to_string()))?,
            Some(host) => explicit_config(host, opts).await?,
        };
        let client = Client::try_from(config)?;
        Ok(Self::from_client(client, opts.qps, opts.burst))
    }

    /// Wraps an existing client, e.g. one built by a test harness.
    pub fn from_client(client: Client, qps: u32, burst: u32) -> Self {
        Self {
            client,
            gate: RateGate::new(qps, burst),
        }
    }

    // --- Companion services ------------------------------------------------

    /// Creates the headless peer-rendezvous/monitoring service `<name>-mgmt`.
    pub async fn create_mgmt_service(&self, cluster: &str, ns: &str) -> Result<Service, GatewayError> {
        self.gate.acquire().await;
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        Ok(api
            .create(&PostParams::default(), &templates::make_mgmt_service(cluster))
            .await?)
    }

    /// Deletes the mgmt service of a cluster. Missing is fine.
    pub async fn delete_mgmt_service(&self, cluster: &str, ns: &str) -> Result<(), GatewayError> {
        self.delete_service(&templates::mgmt_service_name(cluster), ns).await
    }

    /// Creates the headless client-facing service `<name>`.
    pub async fn create_client_service(&self, cluster: &str, ns: &str) -> Result<Service, GatewayError> {
        self.gate.acquire().await;
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        Ok(api
            .create(&PostParams::default(), &templates::make_client_service(cluster))
            .await?)
    }

    /// Deletes the client service of a cluster. Missing is fine.
    pub async fn delete_client_service(&self, cluster: &str, ns: &str) -> Result<(), GatewayError> {
        self.delete_service(&templates::client_service_name(cluster), ns).await
    }

    async fn delete_service(&self, name: &str, ns: &str) -> Result<(), GatewayError> {
        self.gate.acquire().await;
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if kube_not_found(&e) => {
                debug!("service {ns}/{name} already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- Peer pods ---------------------------------------------------------

    /// Creates a pod and waits for it to reach Running. On deadline the pod
    /// is left in place and a timeout error is returned.
    pub async fn create_pod_and_wait(
        &self,
        ns: &str,
        pod: Pod,
        timeout: Duration,
    ) -> Result<Pod, GatewayError> {
        self.gate.acquire().await;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let created = api.create(&PostParams::default(), &pod).await?;
        let name = created.name_any();
        debug!("created pod {ns}/{name}");
        self.wait_pod_running(api, name, timeout).await
    }

    /// Replaces an existing pod and waits for it to reach Running. Fails
    /// with NotFound when the pod is gone (the caller recreates next tick).
    ///
    /// Intended for in-place edits that must keep the pod's identity
    /// (label or annotation surgery on a live peer). Version rollouts do
    /// not go through here: they delete the peer and let a replacement be
    /// created at the new version.
    pub async fn update_pod_and_wait(
        &self,
        ns: &str,
        pod: Pod,
        timeout: Duration,
    ) -> Result<Pod, GatewayError> {
        self.gate.acquire().await;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let name = pod.name_any();
        api.get(&name).await?;
        let updated = api.replace(&name, &PostParams::default(), &pod).await?;
        self.wait_pod_running(api, updated.name_any(), timeout).await
    }

    async fn wait_pod_running(
        &self,
        api: Api<Pod>,
        name: String,
        timeout: Duration,
    ) -> Result<Pod, GatewayError> {
        let running = await_condition(api, &name, conditions::is_pod_running());
        match tokio::time::timeout(timeout, running).await {
            Ok(Ok(Some(pod))) => Ok(pod),
            Ok(Ok(None)) => Err(GatewayError::PodVanished(name)),
            Ok(Err(e)) => Err(GatewayError::PodWatch {
                pod: name,
                message: e.to_string(),
            }),
            Err(_) => Err(GatewayError::PodTimeout(name)),
        }
    }

    /// Lists the peer pods of a cluster by label selector.
    pub async fn list_peers(&self, ns: &str, cluster: &str) -> Result<Vec<Pod>, GatewayError> {
        self.gate.acquire().await;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let lp = ListParams::default().labels(&templates::peer_selector(cluster));
        Ok(api.list(&lp).await?.items)
    }

    /// Deletes a peer pod. Deleting an already-gone peer is a no-op.
    pub async fn delete_peer(&self, ns: &str, name: &str) -> Result<(), GatewayError> {
        self.gate.acquire().await;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if kube_not_found(&e) => {
                debug!("peer {ns}/{name} already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- NatsCluster collection --------------------------------------------

    /// Lists the declared clusters of a namespace, returning them together
    /// with the collection's resume cursor.
    pub async fn list_clusters(&self, ns: &str) -> Result<(Vec<NatsCluster>, String), GatewayError> {
        self.gate.acquire().await;
        let api: Api<NatsCluster> = Api::namespaced(self.client.clone(), ns);
        let list = api.list(&ListParams::default()).await?;
        let cursor = list
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| "0".to_string());
        Ok((list.items, cursor))
    }

    /// Opens a long-lived watch over the cluster collection, resuming at
    /// `cursor`. The server closes the response periodically; reopening is
    /// the caller's job.
    pub async fn watch_clusters(
        &self,
        ns: &str,
        cursor: &str,
    ) -> Result<impl Stream<Item = Result<WatchEvent<NatsCluster>, kube::Error>>, GatewayError> {
        self.gate.acquire().await;
        let api: Api<NatsCluster> = Api::namespaced(self.client.clone(), ns);
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        Ok(api.watch(&wp, cursor).await?)
    }

    /// Registers the NatsCluster resource definition. AlreadyExists is
    /// surfaced to the caller, which recovers existing state instead.
    pub async fn register_resource_definition(&self) -> Result<(), GatewayError> {
        self.gate.acquire().await;
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd = NatsCluster::crd();
        info!("registering resource definition {}", crd.name_any());
        api.create(&PostParams::default(), &crd).await?;
        Ok(())
    }

    /// Polls the cluster collection until the API serves it. NotFound means
    /// "not served yet"; any other failure aborts the wait.
    pub async fn wait_resource_definition_ready(
        &self,
        ns: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.list_clusters(ns).await {
                Ok(_) => return Ok(()),
                Err(ref e) if is_not_found(e) => {
                    debug!("NatsCluster collection not served yet");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(GatewayError::DefinitionNotReady);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Builds a client configuration for an explicit API server endpoint from
/// the operator's TLS flags, via an in-memory kubeconfig.
async fn explicit_config(host: &str, opts: &ConnectOptions) -> Result<Config, GatewayError> {
    let mut cluster = json!({ "server": host });
    if opts.tls_insecure {
        cluster["insecure-skip-tls-verify"] = json!(true);
    }
    if let Some(ca) = &opts.ca_file {
        cluster["certificate-authority"] = json!(ca);
    }

    let mut user = json!({});
    if let Some(cert) = &opts.cert_file {
        user["client-certificate"] = json!(cert);
    }
    if let Some(key) = &opts.key_file {
        user["client-key"] = json!(key);
    }

    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "default", "cluster": cluster }],
        "users": [{ "name": "default", "user": user }],
        "contexts": [{ "name": "default", "context": { "cluster": "default", "user": "default" } }],
        "current-context": "default",
    }))
    .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;

    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| GatewayError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_not_found;
    use hyper::Body;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Gateway backed by a canned API server that answers every request
    /// with the given status and body, counting the requests it sees.
    fn canned_gateway(
        status: http::StatusCode,
        body: serde_json::Value,
    ) -> (ClusterGateway, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = requests.clone();
        let service = tower::service_fn(move |_req: http::Request<Body>| {
            seen.fetch_add(1, Ordering::SeqCst);
            let body = body.to_string();
            async move {
                Ok::<_, Infallible>(
                    http::Response::builder()
                        .status(status)
                        .header(http::header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
            }
        });
        let client = Client::new(service, "default");
        (ClusterGateway::from_client(client, 100, 100), requests)
    }

    fn not_found_status() -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "pods \"demo-1\" not found",
            "reason": "NotFound",
            "code": 404
        })
    }

    #[tokio::test]
    async fn update_pod_and_wait_requires_an_existing_pod() {
        let (gateway, requests) = canned_gateway(http::StatusCode::NOT_FOUND, not_found_status());

        let mut pod = templates::make_pod_spec(
            "demo",
            &crds::ClusterSpec {
                size: 1,
                version: "0.9.2".to_string(),
                paused: false,
                anti_affinity: false,
                node_selector: Default::default(),
            },
        );
        pod.metadata.name = Some("demo-1".to_string());

        let err = gateway
            .update_pod_and_wait("default", pod, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(is_not_found(&err));
        // The get precondition failed, so no replace was attempted.
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }
}
