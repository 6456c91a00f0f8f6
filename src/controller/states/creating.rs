use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::controller::helpers::ensure_namespace;
use crate::controller::state_machine::BeibootMachine;
use crate::error::Result;
use crate::helpers::ports_to_pairs;

use super::State;

/// Creating: namespace, workloads and (optionally) the tunnel sidecars.
pub struct Creating;

#[async_trait]
impl State for Creating {
    async fn on_enter(&self, m: &BeibootMachine<'_>) -> Result<()> {
        let ns = m.namespace();
        let cfg = m.cfg();
        ensure_namespace(&m.ctx().client, ns).await?;

        match m.shelf() {
            Some(shelf) => {
                info!(%ns, shelf = %shelf.name_any(), "restoring cluster from shelf");
                m.provider().restore(ns, cfg, shelf).await?;
            }
            None => m.provider().create(ns, cfg).await?,
        }

        if cfg.tunnel.enabled {
            let ports = ports_to_pairs(&m.provider().get_ports(cfg));
            crate::tunnel::deploy(&m.ctx().client, ns, &ports, cfg.tunnel.endpoint.as_deref())
                .await?;
        }
        Ok(())
    }
}
