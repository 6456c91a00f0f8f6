use std::time::Duration;

use async_trait::async_trait;

use crate::controller::state_machine::{wait_for_running, BeibootMachine};
use crate::error::Result;

use super::State;

/// Pending: block until the backing workloads run, bounded by
/// `clusterReadyTimeout`.
pub struct Pending;

#[async_trait]
impl State for Pending {
    async fn on_enter(&self, m: &BeibootMachine<'_>) -> Result<()> {
        wait_for_running(
            m.provider(),
            m.namespace(),
            Duration::from_secs(m.cfg().cluster_ready_timeout),
            m.ctx().poll_interval,
        )
        .await
    }
}
