use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::beiboot::BeibootParameters;
use super::shared::StateTransitions;

/// Shelf is a point-in-time snapshot of a Beiboot's persistent volumes.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "getdeck.dev",
    version = "v1",
    kind = "Shelf",
    shortname = "shelf",
    plural = "shelves",
    namespaced,
    status = "ShelfStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShelfSpec {
    pub cluster_name: String,

    /// Requested VolumeSnapshotClass; falls back to `shelfVolumeSnapshotClass`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class: Option<String>,
}

/// ShelfState is the lifecycle state of a Shelf.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShelfState {
    #[default]
    Requested,
    Creating,
    Pending,
    Ready,
    Error,
    Terminating,
}

impl ShelfState {
    pub const ALL: [ShelfState; 6] = [
        Self::Requested,
        Self::Creating,
        Self::Pending,
        Self::Ready,
        Self::Error,
        Self::Terminating,
    ];

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Requested => "Requested",
            Self::Creating => "Creating",
            Self::Pending => "Pending",
            Self::Ready => "Ready",
            Self::Error => "Error",
            Self::Terminating => "Terminating",
        }
    }
}

impl std::fmt::Display for ShelfState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "REQUESTED",
            Self::Creating => "CREATING",
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::Terminating => "TERMINATING",
        };
        write!(f, "{s}")
    }
}

/// One snapshotted volume: which node it belonged to, which claim, and
/// (once the snapshot controller has bound it) the retained content.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentRef {
    pub node: String,
    pub pvc: String,
    /// Name of the retained VolumeSnapshotContent object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
}

/// ShelfStatus is written exclusively by the operator.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShelfStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ShelfState>,

    #[serde(default, skip_serializing_if = "StateTransitions::is_empty")]
    pub state_transitions: StateTransitions,

    /// Effective snapshot class (request value or configured default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_contents: Vec<VolumeSnapshotContentRef>,

    /// Namespace of the source cluster at shelving time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_namespace: Option<String>,

    /// Effective parameters of the source cluster, captured at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_parameters: Option<BeibootParameters>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Shelf {
    pub fn state(&self) -> ShelfState {
        self.status
            .as_ref()
            .and_then(|s| s.state)
            .unwrap_or_default()
    }

    pub fn contents(&self) -> &[VolumeSnapshotContentRef] {
        self.status
            .as_ref()
            .map(|s| s.volume_snapshot_contents.as_slice())
            .unwrap_or_default()
    }
}
