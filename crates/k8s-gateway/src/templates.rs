//! Pod and service declarations for NATS clusters.
//!
//! Pure templating: the same cluster name and spec always produce the same
//! declaration, apart from the server-generated pod name suffix.

use std::collections::BTreeMap;

use crds::ClusterSpec;
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Port NATS clients connect to.
pub const CLIENT_PORT: i32 = 4222;
/// Port peers use for route (cluster) traffic.
pub const CLUSTER_PORT: i32 = 6222;
/// Port serving the NATS monitoring endpoint.
pub const MONITORING_PORT: i32 = 8222;

/// Annotation recording the image version a peer was created with.
pub const VERSION_ANNOTATION: &str = "nats.version";

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Name of the client-facing service of a cluster.
pub fn client_service_name(cluster: &str) -> String {
    cluster.to_string()
}

/// Name of the peer-rendezvous and monitoring service of a cluster.
pub fn mgmt_service_name(cluster: &str) -> String {
    format!("{cluster}-mgmt")
}

/// Label selector matching the peer pods of a cluster.
pub fn peer_selector(cluster: &str) -> String {
    format!("app=nats,nats_cluster={cluster}")
}

/// Image version recorded on a peer pod at creation time.
pub fn peer_version(pod: &Pod) -> Option<&str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(VERSION_ANNOTATION))
        .map(String::as_str)
}

fn peer_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "nats".to_string()),
        ("nats_cluster".to_string(), cluster.to_string()),
    ])
}

fn mgmt_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "nats-mgmt".to_string()),
        ("nats_cluster".to_string(), cluster.to_string()),
    ])
}

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn headless_service(name: String, labels: BTreeMap<String, String>, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: Some(ports),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless service NATS clients connect through.
pub fn make_client_service(cluster: &str) -> Service {
    headless_service(
        client_service_name(cluster),
        peer_labels(cluster),
        vec![tcp_port("client", CLIENT_PORT)],
    )
}

/// Headless service used for peer discovery and monitoring.
pub fn make_mgmt_service(cluster: &str) -> Service {
    headless_service(
        mgmt_service_name(cluster),
        mgmt_labels(cluster),
        vec![
            tcp_port("cluster", CLUSTER_PORT),
            tcp_port("monitoring", MONITORING_PORT),
        ],
    )
}

/// Peer pod declaration for a cluster.
///
/// The pod name is left to the server (generate-name prefix `<cluster>-`).
/// Peers rendezvous through the mgmt service DNS name via `--routes`.
pub fn make_pod_spec(cluster: &str, spec: &ClusterSpec) -> Pod {
    let args = vec![
        format!("--cluster=nats://0.0.0.0:{CLUSTER_PORT}"),
        format!("--http_port={MONITORING_PORT}"),
        format!("--routes=nats://{}:{CLUSTER_PORT}", mgmt_service_name(cluster)),
    ];

    let container = Container {
        name: "nats".to_string(),
        image: Some(format!("nats:{}", spec.version)),
        args: Some(args),
        ports: Some(vec![
            container_port("client", CLIENT_PORT),
            container_port("cluster", CLUSTER_PORT),
            container_port("monitoring", MONITORING_PORT),
        ]),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    };

    if spec.anti_affinity {
        pod_spec.affinity = Some(one_peer_per_node(cluster));
    }

    if !spec.node_selector.is_empty() {
        pod_spec.node_selector = Some(spec.node_selector.clone());
    }

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{cluster}-")),
            labels: Some(peer_labels(cluster)),
            annotations: Some(BTreeMap::from([(
                VERSION_ANNOTATION.to_string(),
                spec.version.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(pod_spec),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

/// Required anti-affinity keyed by the cluster label: no two peers of the
/// same cluster may share a node.
fn one_peer_per_node(cluster: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "nats_cluster".to_string(),
                        cluster.to_string(),
                    )])),
                    ..Default::default()
                }),
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(version: &str) -> ClusterSpec {
        ClusterSpec {
            size: 3,
            version: version.to_string(),
            paused: false,
            anti_affinity: false,
            node_selector: BTreeMap::new(),
        }
    }

    #[test]
    fn client_service_is_headless_on_client_port() {
        let svc = make_client_service("demo");
        assert_eq!(svc.metadata.name.as_deref(), Some("demo"));

        let svc_spec = svc.spec.unwrap();
        assert_eq!(svc_spec.cluster_ip.as_deref(), Some("None"));

        let ports = svc_spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, CLIENT_PORT);

        let selector = svc_spec.selector.unwrap();
        assert_eq!(selector.get("app").unwrap(), "nats");
        assert_eq!(selector.get("nats_cluster").unwrap(), "demo");
    }

    #[test]
    fn mgmt_service_exposes_cluster_and_monitoring_ports() {
        let svc = make_mgmt_service("demo");
        assert_eq!(svc.metadata.name.as_deref(), Some("demo-mgmt"));

        let svc_spec = svc.spec.unwrap();
        assert_eq!(svc_spec.cluster_ip.as_deref(), Some("None"));

        let ports: Vec<i32> = svc_spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![CLUSTER_PORT, MONITORING_PORT]);

        let selector = svc_spec.selector.unwrap();
        assert_eq!(selector.get("app").unwrap(), "nats-mgmt");
        assert_eq!(selector.get("nats_cluster").unwrap(), "demo");
    }

    #[test]
    fn pod_runs_versioned_image_with_route_to_mgmt_service() {
        let pod = make_pod_spec("demo", &spec("0.9.2"));

        assert_eq!(pod.metadata.generate_name.as_deref(), Some("demo-"));
        assert_eq!(peer_version(&pod), Some("0.9.2"));

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").unwrap(), "nats");
        assert_eq!(labels.get("nats_cluster").unwrap(), "demo");

        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));

        let container = &pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("nats:0.9.2"));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "--cluster=nats://0.0.0.0:6222".to_string(),
                "--http_port=8222".to_string(),
                "--routes=nats://demo-mgmt:6222".to_string(),
            ]
        );
    }

    #[test]
    fn pod_omits_affinity_and_selector_by_default() {
        let pod = make_pod_spec("demo", &spec("0.9.2"));
        let pod_spec = pod.spec.unwrap();
        assert!(pod_spec.affinity.is_none());
        assert!(pod_spec.node_selector.is_none());
    }

    #[test]
    fn anti_affinity_requests_one_peer_per_node() {
        let mut cs = spec("0.9.2");
        cs.anti_affinity = true;

        let pod = make_pod_spec("demo", &cs);
        let affinity = pod.spec.unwrap().affinity.unwrap();
        let terms = affinity
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();

        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");
        let matched = terms[0]
            .label_selector
            .as_ref()
            .unwrap()
            .match_labels
            .as_ref()
            .unwrap();
        assert_eq!(matched.get("nats_cluster").unwrap(), "demo");
    }

    #[test]
    fn node_selector_restricts_placement() {
        let mut cs = spec("0.9.2");
        cs.node_selector.insert("disktype".to_string(), "ssd".to_string());

        let pod = make_pod_spec("demo", &cs);
        let selector = pod.spec.unwrap().node_selector.unwrap();
        assert_eq!(selector.get("disktype").unwrap(), "ssd");
    }

    #[test]
    fn templating_is_deterministic() {
        let cs = spec("0.9.4");
        assert_eq!(make_pod_spec("demo", &cs), make_pod_spec("demo", &cs));
        assert_eq!(make_mgmt_service("demo"), make_mgmt_service("demo"));
        assert_eq!(make_client_service("demo"), make_client_service("demo"));
    }
}
