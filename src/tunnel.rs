//! mTLS tunnel sidecar set.
//!
//! A `beiboot-tunnel` Deployment whose init container mints a private CA plus
//! server and client certificates, followed by one ghostunnel container per
//! forwarded port.  Each port is published through its own NodePort service.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, Node, Pod, PodSpec,
        PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use kube::api::{Api, ListParams, ObjectMeta};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::controller::helpers::{
    create_or_ignore, env, read_container_file, MANAGED_BY_LABEL, MANAGED_BY_VALUE, TUNNEL_LABEL,
};
use crate::crd::beiboot::TunnelDescriptor;
use crate::crd::shared::PortMapping;
use crate::error::{is_api_status, Error, Result};
use crate::provider::k3s::{port_service_name, KUBEAPI_SERVICE};

pub const TUNNEL_DEPLOYMENT: &str = "beiboot-tunnel";
pub const PKI_DIR: &str = "/pki";
pub const STATUS_PORT_BASE: u16 = 8100;
pub const LISTEN_PORT_BASE: u16 = 20000;
pub const PKI_IMAGE: &str = "alpine/openssl:3.3.2";
pub const GHOSTUNNEL_IMAGE: &str = "ghostunnel/ghostunnel:v1.8.1";

const PKI_SCRIPT: &str = r#"set -e
cd /pki
[ -f client.crt ] && exit 0
openssl req -x509 -newkey rsa:2048 -nodes -days 3650 -subj "/CN=beiboot-ca" -keyout ca.key -out ca.crt
openssl req -newkey rsa:2048 -nodes -subj "/CN=beiboot-tunnel" -keyout server.key -out server.csr
printf "subjectAltName=%s\n" "$TUNNEL_SANS" > server.ext
openssl x509 -req -in server.csr -CA ca.crt -CAkey ca.key -CAcreateserial -days 3650 -extfile server.ext -out server.crt
openssl req -newkey rsa:2048 -nodes -subj "/CN=beiboot-client" -keyout client.key -out client.csr
openssl x509 -req -in client.csr -CA ca.crt -CAkey ca.key -CAcreateserial -days 3650 -out client.crt
chmod 0644 /pki/*
"#;

fn tunnel_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (TUNNEL_LABEL.to_string(), "true".to_string()),
    ])
}

pub fn tunnel_container_name(remote: u16) -> String {
    format!("tunnel-{remote}")
}

/// Upstream service inside the cluster namespace for a remote port.
fn upstream(ns: &str, remote: u16) -> String {
    let svc = if remote == crate::provider::k3s::API_PORT {
        KUBEAPI_SERVICE.to_string()
    } else {
        port_service_name(remote)
    };
    format!("{svc}.{ns}.svc.cluster.local:{remote}")
}

/// `subjectAltName` value for the server certificate.
pub fn subject_alt_names(endpoint: Option<&str>, addresses: &[String]) -> String {
    let mut sans: Vec<String> = Vec::new();
    for a in endpoint.into_iter().chain(addresses.iter().map(String::as_str)) {
        let entry = match a.parse::<IpAddr>() {
            Ok(_) => format!("IP:{a}"),
            Err(_) => format!("DNS:{a}"),
        };
        if !sans.contains(&entry) {
            sans.push(entry);
        }
    }
    if sans.is_empty() {
        sans.push("DNS:localhost".to_string());
    }
    sans.join(",")
}

/// Deployment carrying the PKI init container and one proxy per port.
/// `ports` are `(local, remote)` pairs; only the remote side matters here.
pub fn tunnel_deployment(ns: &str, ports: &[(u16, u16)], sans: &str) -> Deployment {
    let pki_mount = VolumeMount {
        name: "pki".to_string(),
        mount_path: PKI_DIR.to_string(),
        ..Default::default()
    };

    let proxies: Vec<Container> = ports
        .iter()
        .enumerate()
        .map(|(i, &(_, remote))| {
            let status_port = STATUS_PORT_BASE + i as u16;
            let listen_port = LISTEN_PORT_BASE + i as u16;
            Container {
                name: tunnel_container_name(remote),
                image: Some(GHOSTUNNEL_IMAGE.to_string()),
                args: Some(vec![
                    "server".into(),
                    format!("--listen=0.0.0.0:{listen_port}"),
                    format!("--target={}", upstream(ns, remote)),
                    format!("--cert={PKI_DIR}/server.crt"),
                    format!("--key={PKI_DIR}/server.key"),
                    format!("--cacert={PKI_DIR}/ca.crt"),
                    "--allow-all".into(),
                    format!("--status=0.0.0.0:{status_port}"),
                ]),
                ports: Some(vec![ContainerPort {
                    name: Some(format!("tunnel-{i}")),
                    container_port: listen_port.into(),
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some("/_status".to_string()),
                        port: IntOrString::Int(status_port.into()),
                        ..Default::default()
                    }),
                    period_seconds: Some(2),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![pki_mount.clone()]),
                ..Default::default()
            }
        })
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(TUNNEL_DEPLOYMENT.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(tunnel_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    TUNNEL_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(tunnel_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![Container {
                        name: "pki".to_string(),
                        image: Some(PKI_IMAGE.to_string()),
                        command: Some(vec!["/bin/sh".into(), "-c".into(), PKI_SCRIPT.into()]),
                        env: Some(vec![env("TUNNEL_SANS", sans)]),
                        volume_mounts: Some(vec![pki_mount]),
                        ..Default::default()
                    }]),
                    containers: proxies,
                    volumes: Some(vec![Volume {
                        name: "pki".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// NodePort services, one per forwarded port.
pub fn tunnel_services(ns: &str, ports: &[(u16, u16)]) -> Vec<Service> {
    ports
        .iter()
        .enumerate()
        .map(|(i, &(_, remote))| Service {
            metadata: ObjectMeta {
                name: Some(tunnel_container_name(remote)),
                namespace: Some(ns.to_string()),
                labels: Some(tunnel_labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    TUNNEL_LABEL.to_string(),
                    "true".to_string(),
                )])),
                type_: Some("NodePort".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some(format!("tunnel-{remote}")),
                    port: remote.into(),
                    target_port: Some(IntOrString::Int((LISTEN_PORT_BASE + i as u16).into())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

/// Address clients reach the host nodes on.
pub async fn discover_node_address(client: &Client) -> Result<Option<String>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let items = nodes.list(&ListParams::default()).await?.items;
    Ok(first_node_address(&items))
}

/// First ExternalIP of any node, else the first InternalIP (clusters
/// without external addresses, e.g. kind or bare metal).
pub fn first_node_address(nodes: &[Node]) -> Option<String> {
    let addresses: Vec<_> = nodes
        .iter()
        .filter_map(|n| n.status.as_ref()?.addresses.as_ref())
        .flatten()
        .collect();
    ["ExternalIP", "InternalIP"].iter().find_map(|kind| {
        addresses
            .iter()
            .find(|a| a.type_ == *kind)
            .map(|a| a.address.clone())
    })
}

/// Deploy the sidecar set.  Existing objects are left as they are.
pub async fn deploy(
    client: &Client,
    ns: &str,
    ports: &[(u16, u16)],
    endpoint: Option<&str>,
) -> Result<()> {
    let addresses: Vec<String> = discover_node_address(client).await?.into_iter().collect();
    let sans = subject_alt_names(endpoint, &addresses);

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
    create_or_ignore(&deployments, &tunnel_deployment(ns, ports, &sans)).await?;

    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    for svc in tunnel_services(ns, ports) {
        create_or_ignore(&services, &svc).await?;
    }
    info!(%ns, ports = ports.len(), %sans, "deployed tunnel");
    Ok(())
}

/// All replicas updated, available and at the current generation.
pub fn deployment_converged(dep: &Deployment) -> bool {
    let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = dep.status.as_ref() else {
        return false;
    };
    status.updated_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.observed_generation.unwrap_or(0) >= dep.metadata.generation.unwrap_or(0)
}

pub async fn ready(client: &Client, ns: &str) -> Result<bool> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
    match deployments.get(TUNNEL_DEPLOYMENT).await {
        Ok(dep) => Ok(deployment_converged(&dep)),
        Err(ref e) if is_api_status(e, 404) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// CA, client certificate and client key, read from a running proxy.
pub async fn credentials(client: &Client, ns: &str, container: &str) -> Result<(String, String, String)> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
    let pod = pods
        .list(&ListParams::default().labels(&format!("{TUNNEL_LABEL}=true")))
        .await?
        .items
        .into_iter()
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .ok_or_else(|| Error::temporary(format!("no running tunnel pod in {ns}")))?;
    let pod_name = pod.name_any();

    let read = |file: &'static str| {
        let path = format!("{PKI_DIR}/{file}");
        let pod_name = pod_name.clone();
        async move { read_container_file(client, ns, &pod_name, container, &path).await }
    };
    let ca = read("ca.crt").await?;
    let cert = read("client.crt").await?;
    let key = read("client.key").await?;
    Ok((ca, cert, key))
}

/// Published endpoints: each tunnel service's node port, paired with its
/// remote target port.
pub fn port_mappings_from_services(services: &[Service], address: &str) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = services
        .iter()
        .filter_map(|svc| svc.spec.as_ref()?.ports.as_ref()?.first())
        .filter_map(|p| {
            let node_port = p.node_port?;
            Some(PortMapping {
                target: u16::try_from(p.port).ok()?,
                endpoint: format!("{address}:{node_port}"),
            })
        })
        .collect();
    mappings.sort_by_key(|m| m.target);
    mappings
}

pub async fn port_mappings(
    client: &Client,
    ns: &str,
    endpoint: Option<&str>,
) -> Result<Vec<PortMapping>> {
    let address = match endpoint {
        Some(e) => e.to_string(),
        None => discover_node_address(client)
            .await?
            .ok_or_else(|| Error::temporary("no external node address discovered"))?,
    };
    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    let items = services
        .list(&ListParams::default().labels(&format!("{TUNNEL_LABEL}=true")))
        .await?
        .items;
    Ok(port_mappings_from_services(&items, &address))
}

/// Everything a client needs to reach the tunnel.  Temporary until the
/// proxies are up and the PKI has been written.
pub async fn descriptor(
    client: &Client,
    ns: &str,
    ports: &[(u16, u16)],
    endpoint: Option<&str>,
) -> Result<TunnelDescriptor> {
    let Some(&(_, first_remote)) = ports.first() else {
        return Err(Error::permanent("tunnel has no ports"));
    };
    if !ready(client, ns).await? {
        return Err(Error::temporary(format!("tunnel in {ns} not ready")));
    }
    let (ca_pem, client_cert_pem, client_key_pem) =
        credentials(client, ns, &tunnel_container_name(first_remote)).await?;
    let ports = port_mappings(client, ns, endpoint).await?;
    debug!(%ns, ports = ports.len(), "tunnel descriptor assembled");
    Ok(TunnelDescriptor {
        ca_pem,
        client_cert_pem,
        client_key_pem,
        ports,
    })
}
