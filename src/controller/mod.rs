//! Controllers for the `Beiboot` and `Shelf` kinds.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::Reporter;
use kube::Client;

use crate::config::{load_configuration, ClusterConfiguration};
use crate::crd::beiboot::ProviderType;
use crate::error::{Result, Severity};
use crate::provider::{self, Provider};

pub mod beiboot;
pub mod helpers;
pub mod shelf;
pub mod shelf_machine;
pub mod state_machine;
pub mod states;

/// Shared context passed to every reconcile call.
pub struct Context {
    pub client: Client,
    pub reporter: Reporter,
    /// Namespace holding the configuration ConfigMap.
    pub operator_namespace: String,
    pub config_map_name: String,
    pub k3s: Arc<dyn Provider>,
    /// Periodic reconcile interval.
    pub timer_interval: Duration,
    /// Delay before retrying a temporary condition.
    pub retry_delay: Duration,
    /// Interval of the readiness polling loops.
    pub poll_interval: Duration,
}

impl Context {
    pub fn provider(&self, kind: ProviderType) -> Arc<dyn Provider> {
        provider::for_beiboot(kind, &self.k3s)
    }

    /// Operator-wide defaults, re-read on every tick.
    pub async fn configuration(&self) -> Result<ClusterConfiguration> {
        load_configuration(&self.client, &self.operator_namespace, &self.config_map_name).await
    }
}

/// What to do with an error raised while driving a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Leave the state as is and try again after the retry delay.
    Retry,
    /// Move to ERROR.
    Impair,
    /// Hand the error to the controller's error policy.
    Escalate,
}

/// Route by severity.  Unclassified errors impair while `pipeline` holds
/// (the initial provisioning steps) and escalate otherwise.
pub fn route(severity: Severity, pipeline: bool) -> Routing {
    match severity {
        Severity::Temporary => Routing::Retry,
        Severity::Permanent => Routing::Impair,
        Severity::Unclassified if pipeline => Routing::Impair,
        Severity::Unclassified => Routing::Escalate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_always_retries() {
        assert_eq!(route(Severity::Temporary, true), Routing::Retry);
        assert_eq!(route(Severity::Temporary, false), Routing::Retry);
    }

    #[test]
    fn test_permanent_always_impairs() {
        assert_eq!(route(Severity::Permanent, true), Routing::Impair);
        assert_eq!(route(Severity::Permanent, false), Routing::Impair);
    }

    #[test]
    fn test_unclassified_impairs_only_in_pipeline() {
        assert_eq!(route(Severity::Unclassified, true), Routing::Impair);
        assert_eq!(route(Severity::Unclassified, false), Routing::Escalate);
    }
}
