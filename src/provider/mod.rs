//! Workload provisioners.
//!
//! A [`Provider`] turns a [`ClusterConfiguration`] into concrete workloads in
//! the cluster namespace and reports on their health.  Only k3s ships; the
//! trait exists so the state machines can be driven against a fake in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ClusterConfiguration;
use crate::crd::beiboot::ProviderType;
use crate::crd::shelf::Shelf;
use crate::error::Result;

pub mod k3s;

pub use k3s::K3sProvider;

/// Capability set of a backing technology.  Every call names the cluster
/// namespace explicitly; implementations hold no per-cluster state.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Submit the workloads and services of a fresh cluster.
    /// Objects that already exist count as success.
    async fn create(&self, ns: &str, cfg: &ClusterConfiguration) -> Result<()>;

    /// Like [`Provider::create`], but every node volume is provisioned from
    /// the snapshot recorded on `shelf`.
    async fn restore(&self, ns: &str, cfg: &ClusterConfiguration, shelf: &Shelf) -> Result<()>;

    /// Best-effort teardown; not-found is success.
    async fn delete(&self, ns: &str) -> Result<()>;

    /// All backing units report the desired replica count at the current generation.
    async fn running(&self, ns: &str) -> Result<bool>;

    /// Whether the nested control plane is serving.
    async fn ready(&self, ns: &str) -> Result<bool>;

    /// Raw kubeconfig YAML of the nested cluster.  Temporary while not yet written.
    async fn get_kubeconfig(&self, ns: &str) -> Result<String>;

    /// Published `local:remote` port list, including the API port.
    fn get_ports(&self, cfg: &ClusterConfiguration) -> Vec<String>;

    /// Node identifier → volume claim name.
    async fn get_pvc_mapping(&self, ns: &str) -> Result<BTreeMap<String, String>>;

    /// Expose the secondary endpoint on the given nodeport.
    async fn expose_gefyra(&self, ns: &str, node_port: u16) -> Result<()>;
}

/// Pick the provider implementation for a cluster.
pub fn for_beiboot(
    provider: ProviderType,
    k3s: &Arc<dyn Provider>,
) -> Arc<dyn Provider> {
    match provider {
        ProviderType::K3s => k3s.clone(),
    }
}

#[cfg(test)]
pub mod fake {
    //! Recording provider used by the state machine tests.

    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    pub struct FakeProvider {
        pub calls: Mutex<Vec<String>>,
        pub running: Mutex<bool>,
        pub kubeconfig: Mutex<Option<String>>,
        pub pvcs: BTreeMap<String, String>,
        pub fail_create: Option<String>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                running: Mutex::new(true),
                kubeconfig: Mutex::new(Some("apiVersion: v1\nkind: Config\n".into())),
                ..Default::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            if let Ok(mut c) = self.calls.lock() {
                c.push(call.into());
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn count(&self, name: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(name)).count()
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn create(&self, ns: &str, _cfg: &ClusterConfiguration) -> Result<()> {
            self.record(format!("create {ns}"));
            match self.fail_create {
                Some(ref msg) => Err(Error::permanent(msg.clone())),
                None => Ok(()),
            }
        }

        async fn restore(&self, ns: &str, _cfg: &ClusterConfiguration, shelf: &Shelf) -> Result<()> {
            self.record(format!("restore {ns} {}", kube::ResourceExt::name_any(shelf)));
            Ok(())
        }

        async fn delete(&self, ns: &str) -> Result<()> {
            self.record(format!("delete {ns}"));
            Ok(())
        }

        async fn running(&self, _ns: &str) -> Result<bool> {
            self.record("running");
            Ok(self.running.lock().map(|r| *r).unwrap_or(false))
        }

        async fn ready(&self, _ns: &str) -> Result<bool> {
            self.record("ready");
            Ok(true)
        }

        async fn get_kubeconfig(&self, _ns: &str) -> Result<String> {
            self.record("get_kubeconfig");
            self.kubeconfig
                .lock()
                .ok()
                .and_then(|k| k.clone())
                .ok_or_else(|| Error::temporary("kubeconfig not yet written"))
        }

        fn get_ports(&self, cfg: &ClusterConfiguration) -> Vec<String> {
            let mut ports = cfg.ports.clone();
            ports.push("6443:6443".into());
            ports
        }

        async fn get_pvc_mapping(&self, _ns: &str) -> Result<BTreeMap<String, String>> {
            Ok(self.pvcs.clone())
        }

        async fn expose_gefyra(&self, ns: &str, node_port: u16) -> Result<()> {
            self.record(format!("expose_gefyra {ns} {node_port}"));
            Ok(())
        }
    }
}
