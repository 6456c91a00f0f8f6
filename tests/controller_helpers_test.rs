//! Unit tests for controller helper functions.

use kube::api::ObjectMeta;

use beiboot_operator::controller::helpers::*;
use beiboot_operator::crd::shelf::{Shelf, ShelfSpec};

fn test_shelf(name: &str) -> Shelf {
    Shelf {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some("shelf-uid-5678".to_string()),
            ..Default::default()
        },
        spec: ShelfSpec {
            cluster_name: "demo".to_string(),
            volume_snapshot_class: None,
        },
        status: None,
    }
}

#[test]
fn test_kube_object_ref_for_shelf() {
    let oref = kube_object_ref(&test_shelf("snap"));
    assert_eq!(oref.api_version.as_deref(), Some("getdeck.dev/v1"));
    assert_eq!(oref.kind.as_deref(), Some("Shelf"));
    assert_eq!(oref.name.as_deref(), Some("snap"));
    assert_eq!(oref.namespace.as_deref(), Some("default"));
    assert_eq!(oref.uid.as_deref(), Some("shelf-uid-5678"));
}

#[test]
fn test_managed_labels_match_selector() {
    let labels = managed_labels();
    let (key, value) = labels.iter().next().unwrap();
    assert_eq!(managed_selector(), format!("{key}={value}"));
    assert_eq!(labels.len(), 1);
}

#[test]
fn test_env_sets_plain_value() {
    let var = env("K3S_TOKEN", "abc");
    assert_eq!(var.name, "K3S_TOKEN");
    assert_eq!(var.value.as_deref(), Some("abc"));
    assert!(var.value_from.is_none());
}
