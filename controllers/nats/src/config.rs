//! Operator process configuration.
//!
//! Read once from the environment at startup, validated, and threaded
//! through constructors. Nothing here changes after validation, and there
//! are no globals, so tests can instantiate several operators side by side.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use k8s_gateway::ConnectOptions;

use crate::error::ControllerError;

/// Persistent-volume provisioners the operator accepts. Validated at
/// startup; reserved for a future streaming variant.
const SUPPORTED_PV_PROVISIONERS: [&str; 2] = ["kubernetes.io/gce-pd", "kubernetes.io/aws-ebs"];

const DEFAULT_PV_PROVISIONER: &str = "kubernetes.io/gce-pd";
const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(8);
const DEFAULT_POD_START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace whose NatsCluster declarations this instance manages.
    pub namespace: String,
    /// API server URL; `None` selects in-cluster configuration.
    pub master_host: Option<String>,
    /// Skip server certificate verification.
    pub tls_insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Persistent-volume provisioner identifier.
    pub pv_provisioner: String,
    /// Cadence of the periodic reconcile tick.
    pub reconcile_interval: Duration,
    /// How long a created or updated peer may take to reach Running.
    pub pod_start_timeout: Duration,
}

impl OperatorConfig {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        Ok(Self {
            namespace: env::var("NATS_OPERATOR_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            master_host: env::var("MASTER_HOST").ok().filter(|h| !h.is_empty()),
            tls_insecure: env_flag("TLS_INSECURE")?,
            ca_file: env_path("TLS_CA_FILE"),
            cert_file: env_path("TLS_CERT_FILE"),
            key_file: env_path("TLS_KEY_FILE"),
            pv_provisioner: env::var("PV_PROVISIONER")
                .unwrap_or_else(|_| DEFAULT_PV_PROVISIONER.to_string()),
            reconcile_interval: env_secs("RECONCILE_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL)?,
            pod_start_timeout: env_secs("POD_START_TIMEOUT_SECS", DEFAULT_POD_START_TIMEOUT)?,
        })
    }

    /// Validates startup invariants: a supported PV provisioner and a
    /// well-formed master host URL.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if !SUPPORTED_PV_PROVISIONERS.contains(&self.pv_provisioner.as_str()) {
            return Err(ControllerError::InvalidConfig(format!(
                "persistent volume provisioner {} is not supported: options = {:?}",
                self.pv_provisioner, SUPPORTED_PV_PROVISIONERS
            )));
        }

        if let Some(host) = &self.master_host {
            let uri: http::Uri = host.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("malformed master host {host}: {e}"))
            })?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "master host {host} must use http or https"
                    )))
                }
            }
        }

        Ok(())
    }

    /// Connection settings for the API gateway.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            master_host: self.master_host.clone(),
            tls_insecure: self.tls_insecure,
            ca_file: self.ca_file.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ..ConnectOptions::default()
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_flag(key: &str) -> Result<bool, ControllerError> {
    match env::var(key) {
        Err(_) => Ok(false),
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "" | "0" | "false" => Ok(false),
            other => Err(ControllerError::InvalidConfig(format!(
                "{key} must be a boolean, got {other}"
            ))),
        },
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ControllerError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ControllerError::InvalidConfig(format!("{key} must be seconds, got {value}"))),
    }
}
