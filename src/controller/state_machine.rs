//! Lifecycle state machine of a Beiboot.
//!
//! Transitions are a static table of `(event, from, to)` rows and
//! [`next_state`] is the only way a new state is computed.  Entering a state
//! persists it (merge patch on `/status`), posts an event and then runs the
//! state's `on_enter` hook from [`super::states`].  A self-loop writes nothing.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::runtime::events::EventType;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ClusterConfiguration;
use crate::crd::beiboot::{Beiboot, BeibootState};
use crate::crd::shelf::Shelf;
use crate::error::{self, Result};
use crate::helpers::utc_now_iso;
use crate::provider::Provider;

use super::helpers::{publish_event, FIELD_MANAGER};
use super::Context;

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEvent {
    Create,
    Boot,
    Operate,
    Reconcile,
    Impair,
    Recover,
    Terminate,
}

impl ClusterEvent {
    pub const ALL: [ClusterEvent; 7] = [
        Self::Create,
        Self::Boot,
        Self::Operate,
        Self::Reconcile,
        Self::Impair,
        Self::Recover,
        Self::Terminate,
    ];
}

impl ClusterEvent {
    /// Event `action` recorded with each transition, e.g. `Create`.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Boot => "Boot",
            Self::Operate => "Operate",
            Self::Reconcile => "Reconcile",
            Self::Impair => "Impair",
            Self::Recover => "Recover",
            Self::Terminate => "Terminate",
        }
    }
}

impl std::fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Boot => "boot",
            Self::Operate => "operate",
            Self::Reconcile => "reconcile",
            Self::Impair => "impair",
            Self::Recover => "recover",
            Self::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

// ── Transition table ────────────────────────────────────────────────────────

/// A single row in the transition table.
pub struct Transition {
    pub event: ClusterEvent,
    pub from: BeibootState,
    pub to: BeibootState,
}

use BeibootState::*;

const fn row(event: ClusterEvent, from: BeibootState, to: BeibootState) -> Transition {
    Transition { event, from, to }
}

/// The complete lifecycle transition table.
pub static TRANSITIONS: &[Transition] = &[
    row(ClusterEvent::Create, Requested, Creating),
    // Replaying create while already creating is a no-op.
    row(ClusterEvent::Create, Creating, Creating),
    row(ClusterEvent::Boot, Creating, Pending),
    row(ClusterEvent::Operate, Pending, Running),
    row(ClusterEvent::Reconcile, Running, Ready),
    row(ClusterEvent::Reconcile, Ready, Ready),
    row(ClusterEvent::Reconcile, Error, Ready),
    row(ClusterEvent::Impair, Requested, Error),
    row(ClusterEvent::Impair, Creating, Error),
    row(ClusterEvent::Impair, Pending, Error),
    row(ClusterEvent::Impair, Running, Error),
    row(ClusterEvent::Impair, Ready, Error),
    row(ClusterEvent::Recover, Error, Running),
    row(ClusterEvent::Terminate, Requested, Terminating),
    row(ClusterEvent::Terminate, Creating, Terminating),
    row(ClusterEvent::Terminate, Pending, Terminating),
    row(ClusterEvent::Terminate, Running, Terminating),
    row(ClusterEvent::Terminate, Ready, Terminating),
    row(ClusterEvent::Terminate, Error, Terminating),
];

/// Target of `event` fired in state `from`.
pub fn next_state(from: BeibootState, event: ClusterEvent) -> Result<BeibootState> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.event == event)
        .map(|t| t.to)
        .ok_or_else(|| error::Error::TransitionNotAllowed {
            event: event.to_string(),
            from: from.to_string(),
        })
}

/// Whether deleting a Beiboot in `state` has to tear down workloads.
/// Nothing was provisioned yet in `REQUESTED`; `TERMINATING` already ran.
pub fn needs_teardown(state: BeibootState) -> bool {
    !matches!(state, Requested | Terminating)
}

// ── Machine ─────────────────────────────────────────────────────────────────

/// One Beiboot bound to everything its transitions need.  Built fresh on
/// every reconcile from the stored object; nothing is carried between ticks.
pub struct BeibootMachine<'a> {
    ctx: &'a Context,
    beiboot: &'a Beiboot,
    cfg: ClusterConfiguration,
    provider: Arc<dyn Provider>,
    namespace: String,
    shelf: Option<Shelf>,
    state: BeibootState,
}

impl<'a> BeibootMachine<'a> {
    pub fn new(
        ctx: &'a Context,
        beiboot: &'a Beiboot,
        cfg: ClusterConfiguration,
        namespace: String,
        shelf: Option<Shelf>,
    ) -> Self {
        Self {
            ctx,
            beiboot,
            provider: ctx.provider(beiboot.spec.provider),
            cfg,
            namespace,
            shelf,
            state: beiboot.state(),
        }
    }

    pub fn state(&self) -> BeibootState {
        self.state
    }

    pub fn ctx(&self) -> &Context {
        self.ctx
    }

    pub fn beiboot(&self) -> &Beiboot {
        self.beiboot
    }

    pub fn cfg(&self) -> &ClusterConfiguration {
        &self.cfg
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    /// Shelf to restore from, when `spec.fromShelf` is set.
    pub fn shelf(&self) -> Option<&Shelf> {
        self.shelf.as_ref()
    }

    /// Merge-patch `status` with `patch`.
    pub async fn patch_status(&self, patch: Value) -> Result<()> {
        let api: Api<Beiboot> = Api::namespaced(
            self.ctx.client.clone(),
            &self.beiboot.namespace().unwrap_or_default(),
        );
        api.patch_status(
            &self.beiboot.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&json!({ "status": patch })),
        )
        .await?;
        Ok(())
    }

    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        publish_event(
            &self.ctx.client,
            &self.ctx.reporter,
            self.beiboot,
            type_,
            reason,
            action,
            Some(note),
        )
        .await;
    }

    /// Fire `event`: persist the new state, post the event, run the entry hook.
    /// `extra` is merged into the same status patch.
    async fn fire(&mut self, event: ClusterEvent, extra: Value, note: String) -> Result<()> {
        let from = self.state;
        let to = next_state(from, event)?;
        if to == from {
            debug!(name = %self.beiboot.name_any(), state = %to, %event, "self-loop");
            return Ok(());
        }

        let mut transitions = serde_json::Map::new();
        transitions.insert(to.to_string(), Value::String(utc_now_iso()));
        let mut patch = serde_json::Map::new();
        patch.insert("state".into(), json!(to));
        patch.insert("stateTransitions".into(), Value::Object(transitions));
        if let Value::Object(extra) = extra {
            patch.extend(extra);
        }
        self.patch_status(Value::Object(patch)).await?;
        self.state = to;

        info!(name = %self.beiboot.name_any(), %from, %to, %event, "state transition");
        let type_ = if to == Error {
            EventType::Warning
        } else {
            EventType::Normal
        };
        self.event(type_, to.reason(), event.action(), note).await;

        super::states::state_for(to).on_enter(self).await
    }

    /// Run the entry hook of the current state again, without a transition.
    /// Used to resume a transition sequence interrupted on an earlier tick.
    pub async fn reenter(&self) -> Result<()> {
        super::states::state_for(self.state).on_enter(self).await
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    pub async fn create(&mut self) -> Result<()> {
        let mut extra = json!({});
        if self.beiboot.bound_namespace().is_none() {
            extra = json!({ "beibootNamespace": self.namespace });
        }
        let note = format!("Creating cluster in namespace {}", self.namespace);
        self.fire(ClusterEvent::Create, extra, note).await
    }

    pub async fn boot(&mut self) -> Result<()> {
        self.fire(ClusterEvent::Boot, json!({}), "Waiting for cluster workloads".into())
            .await
    }

    pub async fn operate(&mut self) -> Result<()> {
        self.fire(ClusterEvent::Operate, json!({}), "Cluster workloads are running".into())
            .await
    }

    /// Re-validate health and settle in READY, then record the tunnel once
    /// it is up.
    pub async fn reconcile(&mut self) -> Result<()> {
        if !self.provider.running(&self.namespace).await? {
            return Err(error::Error::temporary(format!(
                "workloads in {} are not running",
                self.namespace
            )));
        }
        if !self.provider.ready(&self.namespace).await? {
            return Err(error::Error::temporary(format!(
                "cluster API in {} is not ready",
                self.namespace
            )));
        }
        self.fire(ClusterEvent::Reconcile, json!({}), "Cluster is ready".into())
            .await?;

        let tunnel_recorded = self
            .beiboot
            .status
            .as_ref()
            .is_some_and(|s| s.tunnel.is_some());
        if self.cfg.tunnel.enabled && !tunnel_recorded {
            // retried on the next tick until the descriptor is complete
            if let Err(e) = self.record_tunnel().await {
                debug!(name = %self.beiboot.name_any(), %e, "tunnel not recorded yet");
            }
        }
        Ok(())
    }

    async fn record_tunnel(&self) -> Result<()> {
        let ports = crate::helpers::ports_to_pairs(&self.provider.get_ports(&self.cfg));
        let descriptor = crate::tunnel::descriptor(
            &self.ctx.client,
            &self.namespace,
            &ports,
            self.cfg.tunnel.endpoint.as_deref(),
        )
        .await?;
        self.patch_status(json!({ "tunnel": descriptor })).await
    }

    /// Submit the workloads again without a transition.  For an impaired
    /// cluster whose workloads never came up; objects that exist are kept.
    pub async fn reprovision(&self) -> Result<()> {
        if self.beiboot.spec.from_shelf.is_some() && self.shelf.is_none() {
            return Err(error::Error::permanent("shelf to restore from is gone"));
        }
        info!(name = %self.beiboot.name_any(), ns = %self.namespace, "resubmitting cluster workloads");
        super::states::state_for(Creating).on_enter(self).await
    }

    /// Move to ERROR with `reason`.  Never fails; problems are logged.
    pub async fn impair(&mut self, reason: &str) {
        let name = self.beiboot.name_any();
        if next_state(self.state, ClusterEvent::Impair).is_err() {
            warn!(%name, state = %self.state, %reason, "cannot impair from current state");
            return;
        }
        let extra = json!({ "message": reason });
        if let Err(e) = self.fire(ClusterEvent::Impair, extra, reason.to_string()).await {
            warn!(%name, %e, %reason, "failed to record impairment");
        }
    }

    pub async fn recover(&mut self) -> Result<()> {
        self.fire(
            ClusterEvent::Recover,
            json!({ "message": Value::Null }),
            "Cluster workloads recovered".into(),
        )
        .await
    }

    pub async fn terminate(&mut self) -> Result<()> {
        self.fire(ClusterEvent::Terminate, json!({}), "Removing cluster".into())
            .await
    }
}

// ── Polling ─────────────────────────────────────────────────────────────────

/// Poll `provider.running()` every `interval` until it reports true.
/// Exceeding `timeout` is permanent; a timeout past the clock's range never
/// expires.  Errors while polling are logged and polled through.
pub async fn wait_for_running(
    provider: &dyn Provider,
    ns: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match provider.running(ns).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(%ns, "cluster workloads not running yet"),
            Err(e) => warn!(%ns, %e, "polling cluster workloads failed"),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(error::Error::permanent(format!(
                "cluster workloads in {ns} not running after {}s",
                timeout.as_secs()
            )));
        }
        sleep(interval).await;
    }
}
