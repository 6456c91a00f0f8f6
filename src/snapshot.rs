//! CSI volume snapshot objects (`snapshot.storage.k8s.io/v1`).
//!
//! There are no typed bindings for these kinds, so they are handled as
//! [`DynamicObject`]s through an [`ApiResource`].

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};

use crate::controller::helpers::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use tracing::debug;

use crate::error::{is_api_status, Result};

pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
pub const SNAPSHOT_VERSION: &str = "v1";

/// Marks a pre-provisioned content with the cluster namespace it was
/// restored into.
pub const RESTORED_FOR_LABEL: &str = "beiboot.getdeck.dev/restored-for";

fn resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: SNAPSHOT_GROUP.to_string(),
        version: SNAPSHOT_VERSION.to_string(),
        kind: kind.to_string(),
    })
}

pub fn volume_snapshot_resource() -> ApiResource {
    resource("VolumeSnapshot")
}

pub fn volume_snapshot_content_resource() -> ApiResource {
    resource("VolumeSnapshotContent")
}

pub fn volume_snapshot_class_resource() -> ApiResource {
    resource("VolumeSnapshotClass")
}

pub fn snapshots_api(client: &Client, ns: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), ns, &volume_snapshot_resource())
}

/// VolumeSnapshotContent and VolumeSnapshotClass are cluster scoped.
pub fn contents_api(client: &Client) -> Api<DynamicObject> {
    Api::all_with(client.clone(), &volume_snapshot_content_resource())
}

pub fn classes_api(client: &Client) -> Api<DynamicObject> {
    Api::all_with(client.clone(), &volume_snapshot_class_resource())
}

/// Name of the snapshot taken of one node's volume for a shelf.
pub fn snapshot_name(shelf: &str, node: &str) -> String {
    format!("{shelf}-{node}")
}

/// Name of the content a node's shelved snapshot is restored from.  The
/// shelf is part of the name so restoring into the same namespace from
/// another shelf never reuses a stale content.
pub fn restored_content_name(ns: &str, shelf: &str, node: &str) -> String {
    format!("{ns}-{shelf}-{node}")
}

/// Selector for the contents restored into `ns`.
pub fn restored_selector(ns: &str) -> String {
    format!("{RESTORED_FOR_LABEL}={ns}")
}

/// A VolumeSnapshot of an existing claim.
pub fn volume_snapshot(name: &str, ns: &str, pvc: &str, class: &str) -> DynamicObject {
    DynamicObject::new(name, &volume_snapshot_resource())
        .within(ns)
        .data(json!({
            "spec": {
                "volumeSnapshotClassName": class,
                "source": { "persistentVolumeClaimName": pvc }
            }
        }))
}

/// A pre-provisioned VolumeSnapshotContent pointing at an existing snapshot
/// handle, bound to `snapshot_ns/snapshot_name`.
pub fn pre_provisioned_content(
    name: &str,
    driver: &str,
    handle: &str,
    class: &str,
    snapshot_ns: &str,
    snapshot_name: &str,
) -> DynamicObject {
    let mut content = DynamicObject::new(name, &volume_snapshot_content_resource()).data(json!({
        "spec": {
            "deletionPolicy": "Retain",
            "driver": driver,
            "volumeSnapshotClassName": class,
            "source": { "snapshotHandle": handle },
            "volumeSnapshotRef": {
                "name": snapshot_name,
                "namespace": snapshot_ns
            }
        }
    }));
    content.metadata.labels = Some(
        [
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (RESTORED_FOR_LABEL.to_string(), snapshot_ns.to_string()),
        ]
        .into(),
    );
    content
}

/// A VolumeSnapshot bound statically to a pre-provisioned content.
pub fn bound_volume_snapshot(name: &str, ns: &str, content: &str, class: &str) -> DynamicObject {
    DynamicObject::new(name, &volume_snapshot_resource())
        .within(ns)
        .data(json!({
            "spec": {
                "volumeSnapshotClassName": class,
                "source": { "volumeSnapshotContentName": content }
            }
        }))
}

fn status(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status")
}

/// `status.readyToUse` of a VolumeSnapshot or VolumeSnapshotContent.
pub fn ready_to_use(obj: &DynamicObject) -> bool {
    status(obj)
        .and_then(|s| s.get("readyToUse"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn bound_content_name(snapshot: &DynamicObject) -> Option<String> {
    status(snapshot)
        .and_then(|s| s.get("boundVolumeSnapshotContentName"))
        .and_then(Value::as_str)
        .map(String::from)
}

pub fn snapshot_handle(content: &DynamicObject) -> Option<String> {
    status(content)
        .and_then(|s| s.get("snapshotHandle"))
        .and_then(Value::as_str)
        .map(String::from)
}

pub fn content_driver(content: &DynamicObject) -> Option<String> {
    content
        .data
        .get("spec")
        .and_then(|s| s.get("driver"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Create `obj`, treating 409 Conflict as success.
pub async fn create_or_ignore(api: &Api<DynamicObject>, obj: &DynamicObject) -> Result<()> {
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(ref e) if is_api_status(e, 409) => {
            debug!(name = ?obj.metadata.name, "snapshot object already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Switch a content to `deletionPolicy: Retain` so it outlives its namespace.
pub async fn retain_content(client: &Client, name: &str, field_manager: &str) -> Result<()> {
    let patch = json!({"spec": {"deletionPolicy": "Retain"}});
    contents_api(client)
        .patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn test_resources_use_snapshot_group() {
        let vs = volume_snapshot_resource();
        assert_eq!(vs.api_version, "snapshot.storage.k8s.io/v1");
        assert_eq!(vs.plural, "volumesnapshots");
        assert_eq!(volume_snapshot_content_resource().plural, "volumesnapshotcontents");
        assert_eq!(volume_snapshot_class_resource().kind, "VolumeSnapshotClass");
    }

    #[test]
    fn test_volume_snapshot_manifest() {
        let vs = volume_snapshot("shelf1-server", "getdeck-bbt-demo", "k8s-data-server-0", "csi-snap");
        assert_eq!(vs.metadata.namespace.as_deref(), Some("getdeck-bbt-demo"));
        assert_eq!(
            vs.data["spec"]["source"]["persistentVolumeClaimName"],
            "k8s-data-server-0"
        );
        assert_eq!(vs.data["spec"]["volumeSnapshotClassName"], "csi-snap");
    }

    #[test]
    fn test_restored_content_names_differ_per_shelf() {
        let a = restored_content_name("getdeck-bbt-demo", "monday", "server");
        let b = restored_content_name("getdeck-bbt-demo", "tuesday", "server");
        assert_eq!(a, "getdeck-bbt-demo-monday-server");
        assert_ne!(a, b);
        assert_eq!(
            restored_selector("getdeck-bbt-demo"),
            "beiboot.getdeck.dev/restored-for=getdeck-bbt-demo"
        );
    }

    #[test]
    fn test_status_accessors() {
        let mut vs = volume_snapshot("s", "ns", "pvc", "c");
        assert!(!ready_to_use(&vs));
        assert_eq!(bound_content_name(&vs), None);
        vs.data["status"] = json!({
            "readyToUse": true,
            "boundVolumeSnapshotContentName": "snapcontent-1"
        });
        assert!(ready_to_use(&vs));
        assert_eq!(bound_content_name(&vs).as_deref(), Some("snapcontent-1"));

        let mut content = pre_provisioned_content("c1", "ebs.csi.aws.com", "snap-123", "c", "ns", "s");
        assert_eq!(content.labels()[RESTORED_FOR_LABEL], "ns");
        assert_eq!(content_driver(&content).as_deref(), Some("ebs.csi.aws.com"));
        assert_eq!(content.data["spec"]["deletionPolicy"], "Retain");
        content.data["status"] = json!({"snapshotHandle": "snap-123"});
        assert_eq!(snapshot_handle(&content).as_deref(), Some("snap-123"));
    }
}
