use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kube::api::{Api, ListParams};
use serde_json::json;
use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::controller::state_machine::BeibootMachine;
use crate::crd::beiboot::{Beiboot, GefyraEndpoint};
use crate::error::{Error, Result};
use crate::helpers::pick_free_port;
use crate::provider::k3s::API_PORT;

use super::State;

/// Name of the kubeconfig context added for the Gefyra endpoint.
pub const GEFYRA_CONTEXT: &str = "gefyra";

/// Running: workloads are up.  Extract the kubeconfig and, when enabled,
/// expose the Gefyra endpoint.
pub struct Running;

#[async_trait]
impl State for Running {
    async fn on_enter(&self, m: &BeibootMachine<'_>) -> Result<()> {
        if m.beiboot().has_kubeconfig() {
            return Ok(());
        }
        let ns = m.namespace();
        let mut kubeconfig = m.provider().get_kubeconfig(ns).await?;

        let mut gefyra = None;
        if m.cfg().gefyra.enabled {
            match expose_gefyra(m, &kubeconfig).await {
                Ok((endpoint, rewritten)) => {
                    kubeconfig = rewritten;
                    gefyra = Some(endpoint);
                }
                Err(e) => warn!(%ns, %e, "gefyra endpoint not exposed"),
            }
        }

        m.patch_status(json!({
            "kubeconfig": { "source": STANDARD.encode(kubeconfig.as_bytes()) },
            "gefyra": gefyra,
        }))
        .await?;
        info!(%ns, "stored kubeconfig");
        Ok(())
    }
}

/// Pick a nodeport no other cluster holds, expose it and add a kubeconfig
/// context for the external endpoint.
async fn expose_gefyra(m: &BeibootMachine<'_>, kubeconfig: &str) -> Result<(GefyraEndpoint, String)> {
    let client = &m.ctx().client;
    let all: Api<Beiboot> = Api::all(client.clone());
    let taken: BTreeSet<u16> = all
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .filter_map(Beiboot::gefyra_port)
        .collect();

    let range = m.cfg().gefyra.port_range;
    let port = pick_free_port(range, &taken, &mut rand::thread_rng()).ok_or_else(|| {
        Error::permanent(format!("no free gefyra port in {}-{}", range.0, range.1))
    })?;
    m.provider().expose_gefyra(m.namespace(), port).await?;

    let endpoint = match m.cfg().gefyra.endpoint.clone() {
        Some(e) => Some(e),
        None => crate::tunnel::discover_node_address(client).await?,
    };
    let rewritten = match endpoint.as_deref() {
        Some(host) => add_kubeconfig_context(
            kubeconfig,
            GEFYRA_CONTEXT,
            &format!("https://{host}:{API_PORT}"),
        )?,
        None => kubeconfig.to_string(),
    };
    info!(ns = %m.namespace(), port, ?endpoint, "exposed gefyra endpoint");
    Ok((GefyraEndpoint { port, endpoint }, rewritten))
}

fn entries<'a>(doc: &'a mut Mapping, key: &str) -> Result<&'a mut Vec<Value>> {
    let slot = doc
        .entry(Value::from(key))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if slot.is_null() {
        *slot = Value::Sequence(Vec::new());
    }
    slot.as_sequence_mut()
        .ok_or_else(|| Error::reconcile(format!("kubeconfig `{key}` is not a list")))
}

fn first_named<'a>(list: &'a [Value], field: &str) -> Option<&'a Value> {
    list.first().and_then(|v| v.get(field))
}

/// Add a cluster, user and context all named `name` to `kubeconfig`,
/// copying credentials from the first existing entries and pointing the
/// cluster at `server`.  The current context is left unchanged.  An
/// existing entry of that name is replaced.
pub fn add_kubeconfig_context(kubeconfig: &str, name: &str, server: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(kubeconfig)?;
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::reconcile("kubeconfig is not a mapping"))?;

    let mut cluster = first_named(entries(map, "clusters")?, "cluster")
        .cloned()
        .unwrap_or_else(|| Value::Mapping(Mapping::new()));
    if let Some(c) = cluster.as_mapping_mut() {
        c.insert("server".into(), Value::from(server));
    }
    let user = first_named(entries(map, "users")?, "user")
        .cloned()
        .unwrap_or_else(|| Value::Mapping(Mapping::new()));

    let mut context = Mapping::new();
    context.insert("cluster".into(), Value::from(name));
    context.insert("user".into(), Value::from(name));

    for (key, field, body) in [
        ("clusters", "cluster", cluster),
        ("users", "user", user),
        ("contexts", "context", Value::Mapping(context)),
    ] {
        let list = entries(map, key)?;
        list.retain(|v| v.get("name").and_then(Value::as_str) != Some(name));
        let mut entry = Mapping::new();
        entry.insert("name".into(), Value::from(name));
        entry.insert(field.into(), body);
        list.push(Value::Mapping(entry));
    }

    Ok(serde_yaml::to_string(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    certificate-authority-data: Q0E=
    server: https://127.0.0.1:6443
users:
- name: default
  user:
    client-certificate-data: Q0VSVA==
    client-key-data: S0VZ
contexts:
- name: default
  context:
    cluster: default
    user: default
current-context: default
"#;

    fn named<'a>(doc: &'a Value, list: &str, name: &str) -> &'a Value {
        doc[list]
            .as_sequence()
            .unwrap()
            .iter()
            .find(|v| v["name"].as_str() == Some(name))
            .unwrap()
    }

    #[test]
    fn test_adds_context_with_copied_credentials() {
        let out = add_kubeconfig_context(KUBECONFIG, "gefyra", "https://1.2.3.4:6443").unwrap();
        let doc: Value = serde_yaml::from_str(&out).unwrap();

        let cluster = &named(&doc, "clusters", "gefyra")["cluster"];
        assert_eq!(cluster["server"].as_str(), Some("https://1.2.3.4:6443"));
        assert_eq!(cluster["certificate-authority-data"].as_str(), Some("Q0E="));
        assert_eq!(
            named(&doc, "users", "gefyra")["user"]["client-key-data"].as_str(),
            Some("S0VZ")
        );
        assert_eq!(
            named(&doc, "contexts", "gefyra")["context"]["cluster"].as_str(),
            Some("gefyra")
        );
        // default entries untouched
        assert_eq!(
            named(&doc, "clusters", "default")["cluster"]["server"].as_str(),
            Some("https://127.0.0.1:6443")
        );
        assert_eq!(doc["current-context"].as_str(), Some("default"));
    }

    #[test]
    fn test_replaces_existing_context() {
        let once = add_kubeconfig_context(KUBECONFIG, "gefyra", "https://a:6443").unwrap();
        let twice = add_kubeconfig_context(&once, "gefyra", "https://b:6443").unwrap();
        let doc: Value = serde_yaml::from_str(&twice).unwrap();
        assert_eq!(doc["clusters"].as_sequence().unwrap().len(), 2);
        assert_eq!(doc["contexts"].as_sequence().unwrap().len(), 2);
        assert_eq!(
            named(&doc, "clusters", "gefyra")["cluster"]["server"].as_str(),
            Some("https://b:6443")
        );
    }

    #[test]
    fn test_rejects_non_mapping() {
        assert!(add_kubeconfig_context("- a\n- b\n", "gefyra", "https://x:6443").is_err());
    }
}
