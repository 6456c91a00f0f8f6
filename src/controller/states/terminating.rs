use async_trait::async_trait;
use tracing::{info, warn};

use crate::controller::state_machine::BeibootMachine;
use crate::error::Result;

use super::State;

/// Terminating: tear down workloads, services and volumes.  The namespace
/// is left to finish deleting on its own.
pub struct Terminating;

#[async_trait]
impl State for Terminating {
    async fn on_enter(&self, m: &BeibootMachine<'_>) -> Result<()> {
        let ns = m.namespace();
        match m.provider().delete(ns).await {
            Ok(()) => info!(%ns, "cluster removed"),
            Err(e) => warn!(%ns, %e, "cluster teardown incomplete"),
        }
        Ok(())
    }
}
