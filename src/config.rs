//! Cluster configuration resolver.
//!
//! Operator-wide defaults live in a ConfigMap (`beiboot-config` by default)
//! in the operator namespace.  Every value is a string; [`ClusterConfiguration::from_data`]
//! coerces each key to its type.  A Beiboot's `spec.parameters` are then
//! overlaid with [`ClusterConfiguration::merge`].

use std::collections::BTreeMap;

use chrono::TimeDelta;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::crd::beiboot::{BeibootParameters, GefyraParameters, TunnelParameters};
use crate::crd::shared::ResourceSpec;
use crate::error::{is_api_status, Error, Result};
use crate::helpers::{parse_port_mapping, parse_port_range, parse_timedelta, ports_to_pairs};

pub const DEFAULT_NAMESPACE_PREFIX: &str = "getdeck-bbt";
pub const DEFAULT_GEFYRA_PORT_RANGE: (u16, u16) = (31820, 31920);
/// Upper bound of `clusterReadyTimeout`, in seconds (one day).
pub const MAX_CLUSTER_READY_TIMEOUT: u64 = 86_400;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GefyraConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub port_range: (u16, u16),
}

/// Effective configuration for one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfiguration {
    pub namespace_prefix: String,
    pub nodes: u32,
    pub server_resources: ResourceSpec,
    pub node_resources: ResourceSpec,
    pub server_storage_requests: String,
    pub node_storage_requests: String,
    pub storage_class: Option<String>,
    pub ports: Vec<String>,
    pub max_lifetime: Option<String>,
    pub max_session_timeout: Option<String>,
    pub cluster_ready_timeout: u64,
    pub k8s_version: Option<String>,
    pub tunnel: TunnelConfig,
    pub gefyra: GefyraConfig,
    pub shelf_volume_snapshot_class: Option<String>,
}

fn default_resources() -> ResourceSpec {
    ResourceSpec {
        requests: BTreeMap::from([
            ("cpu".to_string(), "1".to_string()),
            ("memory".to_string(), "1Gi".to_string()),
        ]),
        limits: BTreeMap::new(),
    }
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            nodes: 2,
            server_resources: default_resources(),
            node_resources: default_resources(),
            server_storage_requests: "1Gi".to_string(),
            node_storage_requests: "1Gi".to_string(),
            storage_class: None,
            ports: vec![],
            max_lifetime: None,
            max_session_timeout: None,
            cluster_ready_timeout: 180,
            k8s_version: None,
            tunnel: TunnelConfig {
                enabled: true,
                endpoint: None,
            },
            gefyra: GefyraConfig {
                enabled: false,
                endpoint: None,
                port_range: DEFAULT_GEFYRA_PORT_RANGE,
            },
            shelf_volume_snapshot_class: None,
        }
    }
}

fn parse_json<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::config(format!("{key}: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::config(format!("{key}: {other:?} is not a boolean"))),
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let t = raw.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Ports are accepted as a JSON list or a comma separated string.
fn parse_ports(key: &str, raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    let ports: Vec<String> = if raw.starts_with('[') {
        parse_json(key, raw)?
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    };
    for p in &ports {
        parse_port_mapping(p).map_err(|e| Error::config(format!("{key}: {e}")))?;
    }
    Ok(ports)
}

pub fn check_ready_timeout(seconds: u64) -> Result<u64, String> {
    if seconds > MAX_CLUSTER_READY_TIMEOUT {
        return Err(format!(
            "{seconds}s exceeds the maximum of {MAX_CLUSTER_READY_TIMEOUT}s"
        ));
    }
    Ok(seconds)
}

fn check_duration(key: &str, raw: &str) -> Result<String> {
    parse_timedelta(raw, false).map_err(|e| Error::config(format!("{key}: {e}")))?;
    Ok(raw.trim().to_string())
}

impl ClusterConfiguration {
    /// Coerce the string map of the configuration document into typed values.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();
        for (key, raw) in data {
            match key.as_str() {
                "namespacePrefix" => {
                    if let Some(v) = non_empty(raw) {
                        cfg.namespace_prefix = v;
                    }
                }
                "nodes" => {
                    cfg.nodes = raw
                        .trim()
                        .parse()
                        .map_err(|e| Error::config(format!("{key}: {e}")))?;
                }
                "serverResources" => cfg.server_resources = parse_json(key, raw)?,
                "nodeResources" => cfg.node_resources = parse_json(key, raw)?,
                "serverStorageRequests" => {
                    if let Some(v) = non_empty(raw) {
                        cfg.server_storage_requests = v;
                    }
                }
                "nodeStorageRequests" => {
                    if let Some(v) = non_empty(raw) {
                        cfg.node_storage_requests = v;
                    }
                }
                "storageClass" => cfg.storage_class = non_empty(raw),
                "ports" => cfg.ports = parse_ports(key, raw)?,
                "maxLifetime" => {
                    cfg.max_lifetime = non_empty(raw).map(|v| check_duration(key, &v)).transpose()?
                }
                "maxSessionTimeout" => {
                    cfg.max_session_timeout =
                        non_empty(raw).map(|v| check_duration(key, &v)).transpose()?
                }
                "clusterReadyTimeout" => {
                    let seconds = raw
                        .trim()
                        .parse()
                        .map_err(|e| Error::config(format!("{key}: {e}")))?;
                    cfg.cluster_ready_timeout = check_ready_timeout(seconds)
                        .map_err(|e| Error::config(format!("{key}: {e}")))?;
                }
                "k8sVersion" => cfg.k8s_version = non_empty(raw),
                "tunnel" => {
                    let t: TunnelParameters = parse_json(key, raw)?;
                    cfg.apply_tunnel(&t);
                }
                "tunnelEnabled" => cfg.tunnel.enabled = parse_bool(key, raw)?,
                "gefyra" => {
                    let g: GefyraParameters = parse_json(key, raw)?;
                    cfg.apply_gefyra(&g)?;
                }
                "gefyraEnabled" => cfg.gefyra.enabled = parse_bool(key, raw)?,
                "shelfVolumeSnapshotClass" => cfg.shelf_volume_snapshot_class = non_empty(raw),
                other => warn!(key = %other, "ignoring unknown configuration key"),
            }
        }
        Ok(cfg)
    }

    fn apply_tunnel(&mut self, t: &TunnelParameters) {
        if let Some(enabled) = t.enabled {
            self.tunnel.enabled = enabled;
        }
        if let Some(ref endpoint) = t.endpoint {
            self.tunnel.endpoint = non_empty(endpoint);
        }
    }

    fn apply_gefyra(&mut self, g: &GefyraParameters) -> Result<()> {
        if let Some(enabled) = g.enabled {
            self.gefyra.enabled = enabled;
        }
        if let Some(ref endpoint) = g.endpoint {
            self.gefyra.endpoint = non_empty(endpoint);
        }
        if let Some(ref range) = g.port_range {
            self.gefyra.port_range =
                parse_port_range(range).map_err(|e| Error::config(format!("gefyra: {e}")))?;
        }
        Ok(())
    }

    /// Overlay per-cluster parameters on top of these defaults.
    pub fn merge(&self, params: &BeibootParameters) -> Result<Self> {
        let mut cfg = self.clone();
        if let Some(nodes) = params.nodes {
            cfg.nodes = nodes;
        }
        if let Some(ref r) = params.server_resources {
            cfg.server_resources = r.clone();
        }
        if let Some(ref r) = params.node_resources {
            cfg.node_resources = r.clone();
        }
        if let Some(ref s) = params.server_storage_requests {
            cfg.server_storage_requests = s.clone();
        }
        if let Some(ref s) = params.node_storage_requests {
            cfg.node_storage_requests = s.clone();
        }
        if let Some(ref ports) = params.ports {
            cfg.ports = ports.clone();
        }
        if let Some(ref l) = params.max_lifetime {
            cfg.max_lifetime = Some(check_duration("maxLifetime", l)?);
        }
        if let Some(ref t) = params.max_session_timeout {
            cfg.max_session_timeout = Some(check_duration("maxSessionTimeout", t)?);
        }
        if let Some(t) = params.cluster_ready_timeout {
            cfg.cluster_ready_timeout = check_ready_timeout(t)
                .map_err(|e| Error::config(format!("clusterReadyTimeout: {e}")))?;
        }
        if let Some(ref v) = params.k8s_version {
            cfg.k8s_version = Some(v.clone());
        }
        if let Some(ref t) = params.tunnel {
            cfg.apply_tunnel(t);
        }
        if let Some(ref g) = params.gefyra {
            cfg.apply_gefyra(g)?;
        }
        if cfg.nodes == 0 {
            return Err(Error::config("nodes must be at least 1"));
        }
        Ok(cfg)
    }

    /// Snapshot of the effective values, in the shape of `spec.parameters`.
    /// Stored on a Shelf so a restore reproduces the topology.
    pub fn to_parameters(&self) -> BeibootParameters {
        BeibootParameters {
            nodes: Some(self.nodes),
            server_resources: Some(self.server_resources.clone()),
            node_resources: Some(self.node_resources.clone()),
            server_storage_requests: Some(self.server_storage_requests.clone()),
            node_storage_requests: Some(self.node_storage_requests.clone()),
            ports: Some(self.ports.clone()),
            max_lifetime: self.max_lifetime.clone(),
            max_session_timeout: self.max_session_timeout.clone(),
            cluster_ready_timeout: Some(self.cluster_ready_timeout),
            k8s_version: self.k8s_version.clone(),
            tunnel: Some(TunnelParameters {
                enabled: Some(self.tunnel.enabled),
                endpoint: self.tunnel.endpoint.clone(),
            }),
            gefyra: Some(GefyraParameters {
                enabled: Some(self.gefyra.enabled),
                endpoint: self.gefyra.endpoint.clone(),
                port_range: Some(format!(
                    "{}-{}",
                    self.gefyra.port_range.0, self.gefyra.port_range.1
                )),
            }),
        }
    }

    /// Only the topology-relevant fields of a shelved cluster: node count and storage.
    pub fn with_shelf_topology(&self, shelved: &BeibootParameters) -> Self {
        let mut cfg = self.clone();
        if let Some(nodes) = shelved.nodes {
            cfg.nodes = nodes;
        }
        if let Some(ref s) = shelved.server_storage_requests {
            cfg.server_storage_requests = s.clone();
        }
        if let Some(ref s) = shelved.node_storage_requests {
            cfg.node_storage_requests = s.clone();
        }
        cfg
    }

    pub fn max_lifetime(&self) -> Option<TimeDelta> {
        self.max_lifetime
            .as_deref()
            .and_then(|l| parse_timedelta(l, false).ok())
    }

    pub fn max_session_timeout(&self) -> Option<TimeDelta> {
        self.max_session_timeout
            .as_deref()
            .and_then(|t| parse_timedelta(t, false).ok())
    }

    /// Port forwards parsed into `(local, remote)` pairs.  Invalid entries
    /// were rejected at admission; any left over are skipped.
    pub fn port_pairs(&self) -> Vec<(u16, u16)> {
        ports_to_pairs(&self.ports)
    }
}

/// Read the operator-wide configuration document.
/// A missing ConfigMap yields the built-in defaults.
pub async fn load_configuration(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<ClusterConfiguration> {
    let cms: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match cms.get(name).await {
        Ok(cm) => ClusterConfiguration::from_data(&cm.data.unwrap_or_default()),
        Err(ref e) if is_api_status(e, 404) => {
            warn!(%namespace, %name, "configuration ConfigMap not found, using defaults");
            Ok(ClusterConfiguration::default())
        }
        Err(e) => Err(e.into()),
    }
}
