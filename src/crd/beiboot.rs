use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{PortMapping, ResourceSpec, StateTransitions};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// ProviderType selects the backing technology for the nested cluster.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ProviderType {
    #[default]
    #[serde(rename = "k3s")]
    K3s,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::K3s => write!(f, "k3s"),
        }
    }
}

/// TunnelParameters toggles the mTLS tunnel sidecar set.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TunnelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// GefyraParameters toggles the secondary (Gefyra) endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GefyraParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Inclusive nodeport range, e.g. `31820-31920`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
}

/// BeibootParameters overrides the operator-wide cluster configuration.
/// Every field is optional; unset fields fall back to the `beiboot-config` defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BeibootParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_resources: Option<ResourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resources: Option<ResourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_storage_requests: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_storage_requests: Option<String>,

    /// Port forwards as `"local:remote"` strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_session_timeout: Option<String>,

    /// Seconds to wait for the backing workloads before giving up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ready_timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelParameters>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gefyra: Option<GefyraParameters>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// Beiboot is an ephemeral nested Kubernetes cluster running inside the host cluster.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "getdeck.dev",
    version = "v1",
    kind = "Beiboot",
    shortname = "bbt",
    namespaced,
    status = "BeibootStatus",
    printcolumn = r#"{"name": "Provider", "type": "string", "jsonPath": ".spec.provider"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Namespace", "type": "string", "jsonPath": ".status.beibootNamespace"}"#,
    printcolumn = r#"{"name": "Sunset", "type": "string", "jsonPath": ".status.sunset"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BeibootSpec {
    #[serde(default)]
    pub provider: ProviderType,

    #[serde(default)]
    pub parameters: BeibootParameters,

    /// Name of a READY Shelf to restore the cluster's volumes from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_shelf: Option<String>,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// BeibootState is the lifecycle state of a Beiboot.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BeibootState {
    #[default]
    Requested,
    Creating,
    Pending,
    Running,
    Ready,
    Error,
    Terminating,
}

impl BeibootState {
    pub const ALL: [BeibootState; 7] = [
        Self::Requested,
        Self::Creating,
        Self::Pending,
        Self::Running,
        Self::Ready,
        Self::Error,
        Self::Terminating,
    ];

    /// Event reason for entering this state, e.g. `Creating`.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Requested => "Requested",
            Self::Creating => "Creating",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Ready => "Ready",
            Self::Error => "Error",
            Self::Terminating => "Terminating",
        }
    }
}

impl std::fmt::Display for BeibootState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "REQUESTED",
            Self::Creating => "CREATING",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::Terminating => "TERMINATING",
        };
        write!(f, "{s}")
    }
}

/// KubeconfigSource carries the nested cluster's kubeconfig, base64 encoded.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct KubeconfigSource {
    pub source: String,
}

/// TunnelDescriptor holds the client-side mTLS material and the published endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDescriptor {
    pub ca_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

/// GefyraEndpoint records the nodeport assigned for the secondary endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct GefyraEndpoint {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// BeibootStatus is written exclusively by the operator.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeibootStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BeibootState>,

    #[serde(default, skip_serializing_if = "StateTransitions::is_empty")]
    pub state_transitions: StateTransitions,

    /// Write-once: fixed by the `create` transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beiboot_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<KubeconfigSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gefyra: Option<GefyraEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_client_contact: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Beiboot {
    /// Current state; a resource without status is `REQUESTED`.
    pub fn state(&self) -> BeibootState {
        self.status
            .as_ref()
            .and_then(|s| s.state)
            .unwrap_or_default()
    }

    pub fn bound_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.beiboot_namespace.as_deref())
    }

    pub fn has_kubeconfig(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.kubeconfig.as_ref())
            .is_some_and(|k| !k.source.is_empty())
    }

    pub fn gefyra_port(&self) -> Option<u16> {
        self.status
            .as_ref()
            .and_then(|s| s.gefyra.as_ref())
            .map(|g| g.port)
    }
}
