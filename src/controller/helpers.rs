//! Shared helpers for controller modules.
//!
//! Object references, event publishing, label selectors and the small
//! create-or-ignore / exec wrappers used by the provider and the tunnel.
//! Pure utility functions (naming, durations, ports) live in
//! `crate::helpers` instead.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{EnvVar, Namespace, ObjectReference, Pod};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{is_api_status, Error, Result};

/// Field manager name used for status patches.
pub const FIELD_MANAGER: &str = "beiboot-operator";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "beiboot-operator";
pub const IS_NODE_LABEL: &str = "beiboot.getdeck.dev/is-node";
pub const ROLE_LABEL: &str = "beiboot.getdeck.dev/role";
pub const NODE_LABEL: &str = "beiboot.getdeck.dev/node";
pub const TUNNEL_LABEL: &str = "beiboot.getdeck.dev/tunnel";

/// Selector matching everything the operator created in a cluster namespace.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Publish a Kubernetes event attached to the given resource.
/// Errors are logged but never block reconciliation.
pub async fn publish_event<K: Resource<DynamicType = ()>>(
    client: &Client,
    reporter: &Reporter,
    obj: &K,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let rec = Recorder::new(client.clone(), reporter.clone());
    let oref = kube_object_ref(obj);
    if let Err(e) = rec
        .publish(
            &KubeEvent {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            },
            &oref,
        )
        .await
    {
        warn!(%e, "failed to publish event");
    }
}

/// Shorthand for a plain-value `EnvVar`.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Create `obj`; a 409 Conflict counts as success.
pub async fn create_or_ignore<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(ref e) if is_api_status(e, 409) => {
            debug!(name = ?obj.meta().name, "already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete every object matching `selector`; 404s are ignored.
pub async fn delete_labelled<K>(api: &Api<K>, selector: &str) -> Result<usize>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let items = api.list(&ListParams::default().labels(selector)).await?.items;
    let mut deleted = 0;
    for obj in items {
        let name = obj.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => deleted += 1,
            Err(ref e) if is_api_status(e, 404) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Create the namespace if it doesn't exist yet.
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    };
    create_or_ignore(&namespaces, &ns).await
}

/// Captured result of a command run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Run `command` in `container` of `pod` and collect its output.
/// A pod that does not exist (yet) is reported as a temporary condition.
pub async fn exec_capture(
    client: &Client,
    ns: &str,
    pod: &str,
    container: &str,
    command: Vec<String>,
) -> Result<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
    let params = AttachParams::default()
        .container(container)
        .stdin(false)
        .stdout(true)
        .stderr(true);
    let mut attached = match pods.exec(pod, command, &params).await {
        Ok(a) => a,
        Err(ref e) if is_api_status(e, 404) => {
            return Err(Error::temporary(format!("pod {ns}/{pod} not found")));
        }
        Err(e) => return Err(e.into()),
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let out_reader = attached.stdout();
    let err_reader = attached.stderr();
    let status = attached.take_status();

    let read_out = async {
        if let Some(mut r) = out_reader {
            r.read_to_end(&mut stdout).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let read_err = async {
        if let Some(mut r) = err_reader {
            r.read_to_end(&mut stderr).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (o, e) = tokio::join!(read_out, read_err);
    o.and(e)
        .map_err(|e| Error::temporary(format!("reading exec output from {ns}/{pod}: {e}")))?;

    let success = match status {
        Some(fut) => fut
            .await
            .is_some_and(|s| s.status.as_deref() == Some("Success")),
        None => true,
    };

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        success,
    })
}

/// `cat` a file inside a container.  A non-zero exit means the file isn't
/// there yet, which is temporary.
pub async fn read_container_file(
    client: &Client,
    ns: &str,
    pod: &str,
    container: &str,
    path: &str,
) -> Result<String> {
    let out = exec_capture(
        client,
        ns,
        pod,
        container,
        vec!["cat".to_string(), path.to_string()],
    )
    .await?;
    file_contents(out, &format!("{ns}/{pod}"), path)
}

fn file_contents(out: ExecOutput, location: &str, path: &str) -> Result<String> {
    if !out.success || out.stdout.is_empty() {
        return Err(Error::temporary(format!(
            "{path} not available in {location}: {}",
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::beiboot::{Beiboot, BeibootSpec};

    #[test]
    fn test_kube_object_ref_for_beiboot() {
        let mut bbt = Beiboot::new("demo", BeibootSpec::default());
        bbt.metadata.namespace = Some("getdeck".into());
        bbt.metadata.uid = Some("uid-1".into());
        let r = kube_object_ref(&bbt);
        assert_eq!(r.api_version.as_deref(), Some("getdeck.dev/v1"));
        assert_eq!(r.kind.as_deref(), Some("Beiboot"));
        assert_eq!(r.name.as_deref(), Some("demo"));
        assert_eq!(r.namespace.as_deref(), Some("getdeck"));
        assert_eq!(r.uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn test_missing_file_is_temporary() {
        let out = ExecOutput {
            stdout: String::new(),
            stderr: "cat: /getdeck/kube-config.yaml: No such file or directory\n".into(),
            success: false,
        };
        let err = file_contents(out, "ns/server-0", "/getdeck/kube-config.yaml").unwrap_err();
        assert!(err.is_temporary());
        assert!(err.to_string().contains("No such file or directory"));

        // cat of a file that is still being written
        let empty = ExecOutput { success: true, ..Default::default() };
        assert!(file_contents(empty, "ns/server-0", "/x").unwrap_err().is_temporary());

        let ok = ExecOutput { stdout: "apiVersion: v1\n".into(), success: true, ..Default::default() };
        assert_eq!(file_contents(ok, "ns/server-0", "/x").unwrap(), "apiVersion: v1\n");
    }

    #[test]
    fn test_managed_selector() {
        assert_eq!(managed_selector(), "app.kubernetes.io/managed-by=beiboot-operator");
        assert_eq!(managed_labels()[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
    }
}
