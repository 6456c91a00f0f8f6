//! k3s provider: one StatefulSet per node, a `kubeapi` service and one
//! service per explicit port forward.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::TimeDelta;
use k8s_openapi::api::{
    apps::v1::{StatefulSet, StatefulSetSpec},
    core::v1::{
        Container, ContainerPort, EmptyDirVolumeSource, Namespace, PersistentVolumeClaim,
        PersistentVolumeClaimSpec, Pod, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
        SecurityContext, Service, ServicePort, ServiceSpec, TCPSocketAction,
        TypedLocalObjectReference, Volume, VolumeMount, VolumeResourceRequirements,
    },
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::ClusterConfiguration;
use crate::controller::helpers::{
    create_or_ignore, delete_labelled, env, exec_capture, managed_labels, managed_selector,
    read_container_file, IS_NODE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, NODE_LABEL,
    ROLE_LABEL,
};
use crate::crd::shared::ResourceSpec;
use crate::crd::shelf::Shelf;
use crate::error::{is_api_status, Error, Result};
use crate::helpers::{generate_node_token, parse_timedelta};
use crate::snapshot;

use super::Provider;

pub const API_PORT: u16 = 6443;
pub const SERVER_NODE: &str = "server";
pub const K3S_CONTAINER: &str = "k3s";
pub const DATA_VOLUME: &str = "k8s-data";
pub const KUBECONFIG_PATH: &str = "/getdeck/kube-config.yaml";
pub const KUBEAPI_SERVICE: &str = "kubeapi";
pub const GEFYRA_SERVICE: &str = "gefyra-nodeport";
pub const GEFYRA_TARGET_PORT: u16 = 31820;
pub const K3S_IMAGE_REPOSITORY: &str = "rancher/k3s";
pub const DEFAULT_K3S_TAG: &str = "v1.31.3-k3s1";

/// Nodes that have been non-ready for longer than this are evicted.
pub const STALE_NODE_SECONDS: i64 = 30;

pub struct K3sProvider {
    client: Client,
    http: reqwest::Client,
    registry_url: String,
}

impl K3sProvider {
    pub fn new(client: Client, http: reqwest::Client, registry_url: impl Into<String>) -> Self {
        Self {
            client,
            http,
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Image for the requested version.  A specific version must exist in
    /// the registry; a missing tag is permanent.
    async fn resolve_image(&self, version: Option<&str>) -> Result<String> {
        let tag = image_tag(version);
        if version.is_none() {
            return Ok(format!("{K3S_IMAGE_REPOSITORY}:{tag}"));
        }
        let url = format!(
            "{}/v2/repositories/{K3S_IMAGE_REPOSITORY}/tags/{tag}",
            self.registry_url
        );
        let resp = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(|e| Error::temporary(format!("probing image tag {tag}: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(format!("{K3S_IMAGE_REPOSITORY}:{tag}")),
            reqwest::StatusCode::NOT_FOUND => Err(Error::permanent(format!(
                "k3s image tag {tag} does not exist"
            ))),
            s => Err(Error::temporary(format!(
                "image registry answered {s} for tag {tag}"
            ))),
        }
    }

    /// Shared path of create and restore.  With a shelf, every node volume
    /// gets a data source pointing at the restored snapshot.
    async fn submit(&self, ns: &str, cfg: &ClusterConfiguration, shelf: Option<&Shelf>) -> Result<()> {
        let image = self.resolve_image(cfg.k8s_version.as_deref()).await?;
        let token = generate_node_token();

        let mut sources: BTreeMap<String, String> = BTreeMap::new();
        if let Some(shelf) = shelf {
            sources = self.restore_snapshots(ns, shelf).await?;
        }

        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
        for node in node_names(cfg.nodes) {
            let sts = node_statefulset(&node, ns, cfg, &token, &image, sources.get(&node).cloned());
            create_or_ignore(&sts_api, &sts).await?;
        }

        let svc_api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        create_or_ignore(&svc_api, &cluster_ip_service(ns, KUBEAPI_SERVICE, API_PORT)).await?;
        for (_, remote) in cfg.port_pairs() {
            let svc = cluster_ip_service(ns, &port_service_name(remote), remote);
            create_or_ignore(&svc_api, &svc).await?;
        }
        info!(%ns, nodes = cfg.nodes, %image, "submitted k3s workloads");
        Ok(())
    }

    /// Re-create the shelved snapshots in `ns`.  Returns node → VolumeSnapshot name.
    async fn restore_snapshots(&self, ns: &str, shelf: &Shelf) -> Result<BTreeMap<String, String>> {
        let shelf_name = shelf.name_any();
        let class = shelf
            .status
            .as_ref()
            .and_then(|s| s.volume_snapshot_class.clone())
            .ok_or_else(|| Error::permanent(format!("shelf {shelf_name} has no snapshot class")))?;
        let contents = snapshot::contents_api(&self.client);
        let snapshots = snapshot::snapshots_api(&self.client, ns);

        let mut sources = BTreeMap::new();
        for entry in shelf.contents() {
            let (Some(content_name), Some(handle)) = (&entry.name, &entry.snapshot_handle) else {
                return Err(Error::permanent(format!(
                    "shelf {shelf_name} has no snapshot recorded for node {}",
                    entry.node
                )));
            };
            let original = contents.get(content_name).await.map_err(|e| {
                if is_api_status(&e, 404) {
                    Error::permanent(format!("VolumeSnapshotContent {content_name} is gone"))
                } else {
                    e.into()
                }
            })?;
            let driver = snapshot::content_driver(&original).ok_or_else(|| {
                Error::permanent(format!("VolumeSnapshotContent {content_name} has no driver"))
            })?;

            let vs_name = snapshot::snapshot_name(&shelf_name, &entry.node);
            let restored_content = snapshot::restored_content_name(ns, &shelf_name, &entry.node);
            snapshot::create_or_ignore(
                &contents,
                &snapshot::pre_provisioned_content(
                    &restored_content,
                    &driver,
                    handle,
                    &class,
                    ns,
                    &vs_name,
                ),
            )
            .await?;
            snapshot::create_or_ignore(
                &snapshots,
                &snapshot::bound_volume_snapshot(&vs_name, ns, &restored_content, &class),
            )
            .await?;
            sources.insert(entry.node.clone(), vs_name);
        }
        Ok(sources)
    }
}

#[async_trait]
impl Provider for K3sProvider {
    async fn create(&self, ns: &str, cfg: &ClusterConfiguration) -> Result<()> {
        self.submit(ns, cfg, None).await
    }

    async fn restore(&self, ns: &str, cfg: &ClusterConfiguration, shelf: &Shelf) -> Result<()> {
        self.submit(ns, cfg, Some(shelf)).await
    }

    async fn delete(&self, ns: &str) -> Result<()> {
        let selector = managed_selector();
        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
        let svcs: Api<Service> = Api::namespaced(self.client.clone(), ns);
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        let contents = snapshot::contents_api(&self.client);
        for result in [
            delete_labelled(&sts, &selector).await,
            delete_labelled(&svcs, &selector).await,
            delete_labelled(&pvcs, &selector).await,
            delete_labelled(&contents, &snapshot::restored_selector(ns)).await,
        ] {
            match result {
                Ok(n) => debug!(%ns, deleted = n, "removed cluster objects"),
                Err(Error::Kube(ref e)) if is_api_status(e, 404) => {}
                Err(e) => return Err(e),
            }
        }

        // The namespace finishes terminating on its own.
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(ns, &DeleteParams::background()).await {
            Ok(_) => info!(%ns, "namespace deletion requested"),
            Err(ref e) if is_api_status(e, 404) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn running(&self, ns: &str) -> Result<bool> {
        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
        let items = sts
            .list(&ListParams::default().labels(&format!("{IS_NODE_LABEL}=true")))
            .await?
            .items;
        Ok(!items.is_empty() && items.iter().all(statefulset_converged))
    }

    /// Evicts nodes that have been non-ready for too long.  Always reports
    /// ready once the sweep ran; the evicted node rejoins when its pod
    /// restarts.
    async fn ready(&self, ns: &str) -> Result<bool> {
        let pod = format!("{SERVER_NODE}-0");
        let out = exec_capture(
            &self.client,
            ns,
            &pod,
            K3S_CONTAINER,
            vec!["kubectl".into(), "get".into(), "nodes".into(), "--no-headers".into()],
        )
        .await?;
        if !out.success {
            return Err(Error::temporary(format!(
                "kubectl get nodes failed in {ns}: {}",
                out.stderr.trim()
            )));
        }
        let rows = parse_node_table(&out.stdout);
        for name in stale_nodes(&rows, TimeDelta::seconds(STALE_NODE_SECONDS)) {
            warn!(%ns, node = %name, "evicting stale node");
            let res = exec_capture(
                &self.client,
                ns,
                &pod,
                K3S_CONTAINER,
                vec!["kubectl".into(), "delete".into(), "node".into(), name.clone()],
            )
            .await;
            if let Err(e) = res {
                warn!(%ns, node = %name, %e, "failed to evict node");
            }
        }
        Ok(true)
    }

    async fn get_kubeconfig(&self, ns: &str) -> Result<String> {
        read_container_file(
            &self.client,
            ns,
            &format!("{SERVER_NODE}-0"),
            K3S_CONTAINER,
            KUBECONFIG_PATH,
        )
        .await
    }

    fn get_ports(&self, cfg: &ClusterConfiguration) -> Vec<String> {
        published_ports(cfg)
    }

    async fn get_pvc_mapping(&self, ns: &str) -> Result<BTreeMap<String, String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let items = pods
            .list(&ListParams::default().labels(&format!("{IS_NODE_LABEL}=true")))
            .await?
            .items;
        Ok(pvc_mapping_from_pods(&items))
    }

    async fn expose_gefyra(&self, ns: &str, node_port: u16) -> Result<()> {
        let svc_api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        let svc = gefyra_service(ns, node_port);
        match svc_api.create(&PostParams::default(), &svc).await {
            Ok(_) => Ok(()),
            Err(ref e) if is_api_status(e, 409) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Layout ────────────────────────────────────────────────────────────────────

/// `server`, then `agent-1` … `agent-(n-1)`.
pub fn node_names(nodes: u32) -> Vec<String> {
    let mut names = vec![SERVER_NODE.to_string()];
    names.extend((1..nodes.max(1)).map(|i| format!("agent-{i}")));
    names
}

/// Claim created by the StatefulSet's volume claim template for `node`.
pub fn pvc_name(node: &str) -> String {
    format!("{DATA_VOLUME}-{node}-0")
}

pub fn port_service_name(remote: u16) -> String {
    format!("port-{remote}")
}

/// `1.31.3` → `v1.31.3-k3s1`.  A full tag such as `v1.30.2-k3s2` is kept.
pub fn image_tag(version: Option<&str>) -> String {
    match version.map(str::trim).filter(|v| !v.is_empty()) {
        None => DEFAULT_K3S_TAG.to_string(),
        Some(v) => {
            let v = v.trim_start_matches('v');
            if v.contains("k3s") {
                format!("v{v}")
            } else {
                format!("v{v}-k3s1")
            }
        }
    }
}

/// Requested forwards plus the API port, unless a forward already targets it.
pub fn published_ports(cfg: &ClusterConfiguration) -> Vec<String> {
    let mut ports = cfg.ports.clone();
    if !cfg.port_pairs().iter().any(|&(_, remote)| remote == API_PORT) {
        ports.push(format!("{API_PORT}:{API_PORT}"));
    }
    ports
}

fn node_labels(node: &str) -> BTreeMap<String, String> {
    let role = if node == SERVER_NODE { "server" } else { "agent" };
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (IS_NODE_LABEL.to_string(), "true".to_string()),
        (ROLE_LABEL.to_string(), role.to_string()),
        (NODE_LABEL.to_string(), node.to_string()),
    ])
}

fn server_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(NODE_LABEL.to_string(), SERVER_NODE.to_string())])
}

fn quantities(m: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if m.is_empty() {
        return None;
    }
    Some(
        m.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn resource_requirements(spec: &ResourceSpec) -> ResourceRequirements {
    ResourceRequirements {
        requests: quantities(&spec.requests),
        limits: quantities(&spec.limits),
        ..Default::default()
    }
}

fn k3s_args(node: &str, ns: &str) -> Vec<String> {
    if node == SERVER_NODE {
        vec![
            "server".into(),
            format!("--https-listen-port={API_PORT}"),
            format!("--write-kubeconfig={KUBECONFIG_PATH}"),
            "--write-kubeconfig-mode=0644".into(),
            format!("--tls-san={KUBEAPI_SERVICE}"),
            format!("--tls-san={KUBEAPI_SERVICE}.{ns}.svc.cluster.local"),
            "--disable=traefik".into(),
            "--node-name=server".into(),
        ]
    } else {
        vec!["agent".into(), format!("--node-name={node}")]
    }
}

/// StatefulSet for one node.  `data_source` names a VolumeSnapshot to
/// provision the data volume from.
pub fn node_statefulset(
    node: &str,
    ns: &str,
    cfg: &ClusterConfiguration,
    token: &str,
    image: &str,
    data_source: Option<String>,
) -> StatefulSet {
    let is_server = node == SERVER_NODE;
    let labels = node_labels(node);
    let (resources, storage) = if is_server {
        (&cfg.server_resources, &cfg.server_storage_requests)
    } else {
        (&cfg.node_resources, &cfg.node_storage_requests)
    };

    let mut env_vars = vec![env("K3S_TOKEN", token)];
    if !is_server {
        env_vars.push(env(
            "K3S_URL",
            format!("https://{KUBEAPI_SERVICE}.{ns}.svc.cluster.local:{API_PORT}"),
        ));
    }

    let readiness_probe = is_server.then(|| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(API_PORT.into()),
            ..Default::default()
        }),
        period_seconds: Some(2),
        ..Default::default()
    });

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.clone()),
                )])),
                ..Default::default()
            }),
            storage_class_name: cfg.storage_class.clone(),
            data_source: data_source.map(|name| TypedLocalObjectReference {
                api_group: Some(snapshot::SNAPSHOT_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(node.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    NODE_LABEL.to_string(),
                    node.to_string(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: K3S_CONTAINER.to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec!["k3s".to_string()]),
                        args: Some(k3s_args(node, ns)),
                        env: Some(env_vars),
                        ports: is_server.then(|| {
                            vec![ContainerPort {
                                name: Some("kubeapi".to_string()),
                                container_port: API_PORT.into(),
                                ..Default::default()
                            }]
                        }),
                        resources: Some(resource_requirements(resources)),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        readiness_probe,
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: DATA_VOLUME.to_string(),
                                mount_path: "/var/lib/rancher/k3s".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "getdeck".to_string(),
                                mount_path: "/getdeck".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "getdeck".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service in front of the server node.
pub fn cluster_ip_service(ns: &str, name: &str, port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(server_selector()),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(format!("tcp-{port}")),
                port: port.into(),
                target_port: Some(IntOrString::Int(port.into())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// NodePort service for the secondary endpoint (WireGuard, UDP).
pub fn gefyra_service(ns: &str, node_port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(GEFYRA_SERVICE.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(server_selector()),
            type_: Some("NodePort".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("gefyra".to_string()),
                port: GEFYRA_TARGET_PORT.into(),
                target_port: Some(IntOrString::Int(GEFYRA_TARGET_PORT.into())),
                node_port: Some(node_port.into()),
                protocol: Some("UDP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

/// Desired replicas are ready and the controller has observed the current generation.
pub fn statefulset_converged(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let generation = sts.metadata.generation.unwrap_or(0);
    status.ready_replicas.unwrap_or(0) == desired
        && status.replicas == desired
        && status.observed_generation.unwrap_or(0) >= generation
}

/// One row of `kubectl get nodes --no-headers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRow {
    pub name: String,
    pub status: String,
    pub age: Option<TimeDelta>,
}

/// Parse `NAME STATUS ROLES AGE VERSION` rows.  A header line is skipped;
/// an age that isn't in `d/h/m/s` form (e.g. years) is left unset.
pub fn parse_node_table(output: &str) -> Vec<NodeRow> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 || cols[0] == "NAME" {
                return None;
            }
            Some(NodeRow {
                name: cols[0].to_string(),
                status: cols[1].to_string(),
                age: parse_timedelta(cols[3], false).ok(),
            })
        })
        .collect()
}

/// Nodes whose status is not exactly `Ready` and that are older than `threshold`.
pub fn stale_nodes(rows: &[NodeRow], threshold: TimeDelta) -> Vec<String> {
    rows.iter()
        .filter(|r| r.status != "Ready" && r.age.is_some_and(|a| a > threshold))
        .map(|r| r.name.clone())
        .collect()
}

/// Node identifier (from the node label) → claim name, read off the pods' volumes.
pub fn pvc_mapping_from_pods(pods: &[Pod]) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for pod in pods {
        let Some(node) = pod.labels().get(NODE_LABEL) else {
            continue;
        };
        let claim = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .into_iter()
            .flatten()
            .filter(|v| v.name == DATA_VOLUME)
            .find_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| c.claim_name.clone());
        if let Some(claim) = claim {
            mapping.insert(node.clone(), claim);
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;

    fn shelf_with_content(name: &str) -> Shelf {
        use crate::crd::shelf::{ShelfSpec, ShelfState, ShelfStatus, VolumeSnapshotContentRef};
        let mut shelf = Shelf::new(
            name,
            ShelfSpec {
                cluster_name: "demo".into(),
                volume_snapshot_class: None,
            },
        );
        shelf.status = Some(ShelfStatus {
            state: Some(ShelfState::Ready),
            volume_snapshot_class: Some("csi-snap".into()),
            volume_snapshot_contents: vec![VolumeSnapshotContentRef {
                node: SERVER_NODE.into(),
                pvc: pvc_name(SERVER_NODE),
                name: Some(format!("snapcontent-{name}")),
                snapshot_handle: Some(format!("snap-{name}")),
            }],
            ..Default::default()
        });
        shelf
    }

    #[tokio::test]
    async fn test_restored_contents_are_per_shelf_and_removed_with_the_cluster() {
        use crate::fixtures::ApiServer;
        use http::Method;
        use serde_json::{json, Value};

        const CONTENTS: &str = "/apis/snapshot.storage.k8s.io/v1/volumesnapshotcontents";
        let ns = "getdeck-bbt-demo";
        let original = |name: &str| {
            (
                format!("{CONTENTS}/snapcontent-{name}"),
                json!({
                    "apiVersion": "snapshot.storage.k8s.io/v1",
                    "kind": "VolumeSnapshotContent",
                    "metadata": { "name": format!("snapcontent-{name}") },
                    "spec": { "driver": "ebs.csi.aws.com" }
                }),
            )
        };
        let restored = json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshotContentList",
            "metadata": {},
            "items": [{
                "apiVersion": "snapshot.storage.k8s.io/v1",
                "kind": "VolumeSnapshotContent",
                "metadata": { "name": "getdeck-bbt-demo-monday-server" }
            }]
        });
        let (client, server) = ApiServer::start(vec![
            original("monday"),
            original("tuesday"),
            (CONTENTS.to_string(), restored),
        ]);
        let provider = K3sProvider::new(client, reqwest::Client::new(), "https://registry.invalid");
        let cfg = ClusterConfiguration::default();

        for name in ["monday", "tuesday"] {
            provider.restore(ns, &cfg, &shelf_with_content(name)).await.unwrap();
        }
        let created: Vec<Value> = server
            .calls()
            .into_iter()
            .filter(|c| c.method == Method::POST && c.path == CONTENTS)
            .map(|c| c.body)
            .collect();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0]["metadata"]["name"], "getdeck-bbt-demo-monday-server");
        assert_eq!(created[1]["metadata"]["name"], "getdeck-bbt-demo-tuesday-server");
        assert_eq!(created[1]["spec"]["source"]["snapshotHandle"], "snap-tuesday");
        for content in &created {
            assert_eq!(content["metadata"]["labels"][snapshot::RESTORED_FOR_LABEL], ns);
        }

        provider.delete(ns).await.unwrap();
        let listed = server
            .calls()
            .into_iter()
            .any(|c| c.method == Method::GET && c.path == CONTENTS && c.query.contains("restored-for"));
        assert!(listed);
        assert_eq!(
            server.count(Method::DELETE, "/volumesnapshotcontents/getdeck-bbt-demo-monday-server"),
            1
        );
        assert_eq!(server.count(Method::DELETE, &format!("/api/v1/namespaces/{ns}")), 1);
    }

    #[test]
    fn test_node_names() {
        assert_eq!(node_names(1), vec!["server"]);
        assert_eq!(node_names(3), vec!["server", "agent-1", "agent-2"]);
        assert_eq!(node_names(0), vec!["server"]);
        assert_eq!(pvc_name("agent-1"), "k8s-data-agent-1-0");
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag(None), DEFAULT_K3S_TAG);
        assert_eq!(image_tag(Some("1.30.2")), "v1.30.2-k3s1");
        assert_eq!(image_tag(Some("v1.30.2")), "v1.30.2-k3s1");
        assert_eq!(image_tag(Some("v1.30.2-k3s2")), "v1.30.2-k3s2");
        assert_eq!(image_tag(Some(" ")), DEFAULT_K3S_TAG);
    }

    #[test]
    fn test_published_ports_appends_api_port_once() {
        let cfg = ClusterConfiguration {
            ports: vec!["8080:80".into()],
            ..Default::default()
        };
        assert_eq!(published_ports(&cfg), vec!["8080:80", "6443:6443"]);
        let cfg = ClusterConfiguration {
            ports: vec!["6443:6443".into()],
            ..Default::default()
        };
        assert_eq!(published_ports(&cfg), vec!["6443:6443"]);
        let cfg = ClusterConfiguration {
            ports: vec!["16443:6443".into()],
            ..Default::default()
        };
        assert_eq!(published_ports(&cfg), vec!["16443:6443"]);
    }

    #[test]
    fn test_server_statefulset() {
        let cfg = ClusterConfiguration {
            server_storage_requests: "5Gi".into(),
            storage_class: Some("fast".into()),
            ..Default::default()
        };
        let sts = node_statefulset("server", "getdeck-bbt-demo", &cfg, "tok", "rancher/k3s:v1", None);
        let labels = sts.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[ROLE_LABEL], "server");
        assert_eq!(labels[IS_NODE_LABEL], "true");

        let spec = sts.spec.as_ref().unwrap();
        let claim = &spec.volume_claim_templates.as_ref().unwrap()[0];
        let claim_spec = claim.spec.as_ref().unwrap();
        assert_eq!(claim.metadata.name.as_deref(), Some(DATA_VOLUME));
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(
            claim_spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("5Gi".into())
        );
        assert!(claim_spec.data_source.is_none());

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "K3S_TOKEN" && e.value.as_deref() == Some("tok")));
        assert!(!env.iter().any(|e| e.name == "K3S_URL"));
        assert!(container
            .args
            .as_ref()
            .unwrap()
            .contains(&format!("--write-kubeconfig={KUBECONFIG_PATH}")));
    }

    #[test]
    fn test_agent_statefulset_joins_server_and_restores() {
        let cfg = ClusterConfiguration::default();
        let sts = node_statefulset(
            "agent-1",
            "ns1",
            &cfg,
            "tok",
            "img",
            Some("shelf-agent-1".into()),
        );
        let spec = sts.spec.as_ref().unwrap();
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "K3S_URL"
            && e.value.as_deref() == Some("https://kubeapi.ns1.svc.cluster.local:6443")));
        assert!(container.readiness_probe.is_none());

        let ds = spec.volume_claim_templates.as_ref().unwrap()[0]
            .spec
            .as_ref()
            .unwrap()
            .data_source
            .clone()
            .unwrap();
        assert_eq!(ds.kind, "VolumeSnapshot");
        assert_eq!(ds.name, "shelf-agent-1");
        assert_eq!(ds.api_group.as_deref(), Some("snapshot.storage.k8s.io"));
    }

    #[test]
    fn test_statefulset_converged() {
        let mut sts = StatefulSet {
            metadata: ObjectMeta {
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: None,
        };
        assert!(!statefulset_converged(&sts));

        sts.status = Some(StatefulSetStatus {
            replicas: 1,
            ready_replicas: Some(1),
            observed_generation: Some(1),
            ..Default::default()
        });
        assert!(!statefulset_converged(&sts), "stale generation");

        sts.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(statefulset_converged(&sts));

        sts.status.as_mut().unwrap().ready_replicas = Some(0);
        assert!(!statefulset_converged(&sts));
    }

    #[test]
    fn test_stale_node_detection() {
        let out = "\
NAME      STATUS     ROLES                  AGE   VERSION
server    Ready      control-plane,master   10m   v1.31.3+k3s1
agent-1   NotReady   <none>                 2m5s  v1.31.3+k3s1
agent-2   NotReady   <none>                 12s   v1.31.3+k3s1
agent-3   Ready,SchedulingDisabled   <none> 3h    v1.31.3+k3s1
agent-4   NotReady   <none>                 2y    v1.31.3+k3s1
";
        let rows = parse_node_table(out);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[1].age, Some(TimeDelta::seconds(125)));
        assert_eq!(rows[4].age, None);
        assert_eq!(
            stale_nodes(&rows, TimeDelta::seconds(STALE_NODE_SECONDS)),
            vec!["agent-1".to_string(), "agent-3".to_string()]
        );
    }

    #[test]
    fn test_pvc_mapping_from_pods() {
        let pod = |node: &str, claim: &str| Pod {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([(NODE_LABEL.to_string(), node.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![
                    Volume {
                        name: "getdeck".into(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    },
                    Volume {
                        name: DATA_VOLUME.into(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: claim.into(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mapping = pvc_mapping_from_pods(&[
            pod("server", "k8s-data-server-0"),
            pod("agent-1", "k8s-data-agent-1-0"),
            Pod::default(),
        ]);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["agent-1"], pvc_name("agent-1"));
    }

    #[test]
    fn test_gefyra_service_is_udp_nodeport() {
        let svc = gefyra_service("ns", 31825);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.node_port, Some(31825));
        assert_eq!(port.protocol.as_deref(), Some("UDP"));
    }
}
