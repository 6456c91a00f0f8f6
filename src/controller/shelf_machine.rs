//! Lifecycle state machine of a Shelf.
//!
//! Same shape as the Beiboot machine: a static transition table and a
//! machine that persists each entry before running its side effects.  The
//! persistence guard differs: an entry is only written when the latest
//! recorded transition does not already name the target state, so replaying
//! an event adds no duplicate records or events.

use std::collections::BTreeMap;

use kube::api::{Api, DeleteParams, Patch, PatchParams, ResourceExt};
use kube::runtime::events::EventType;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::crd::beiboot::BeibootParameters;
use crate::crd::shared::{latest_transition, record_transition, StateTransitions};
use crate::crd::shelf::{Shelf, ShelfState, VolumeSnapshotContentRef};
use crate::error::{self, is_api_status, Result};
use crate::snapshot;

use super::helpers::{publish_event, FIELD_MANAGER};
use super::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShelfEvent {
    Create,
    Shelve,
    Reconcile,
    Impair,
    Recover,
    Terminate,
}

impl ShelfEvent {
    pub const ALL: [ShelfEvent; 6] = [
        Self::Create,
        Self::Shelve,
        Self::Reconcile,
        Self::Impair,
        Self::Recover,
        Self::Terminate,
    ];
}

impl ShelfEvent {
    /// Event `action` recorded with each transition, e.g. `Shelve`.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Shelve => "Shelve",
            Self::Reconcile => "Reconcile",
            Self::Impair => "Impair",
            Self::Recover => "Recover",
            Self::Terminate => "Terminate",
        }
    }
}

impl std::fmt::Display for ShelfEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Shelve => "shelve",
            Self::Reconcile => "reconcile",
            Self::Impair => "impair",
            Self::Recover => "recover",
            Self::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

pub struct ShelfTransition {
    pub event: ShelfEvent,
    pub from: ShelfState,
    pub to: ShelfState,
}

use ShelfState::*;

const fn row(event: ShelfEvent, from: ShelfState, to: ShelfState) -> ShelfTransition {
    ShelfTransition { event, from, to }
}

pub static TRANSITIONS: &[ShelfTransition] = &[
    row(ShelfEvent::Create, Requested, Creating),
    row(ShelfEvent::Shelve, Creating, Pending),
    row(ShelfEvent::Reconcile, Pending, Ready),
    row(ShelfEvent::Reconcile, Ready, Ready),
    row(ShelfEvent::Reconcile, Error, Ready),
    row(ShelfEvent::Impair, Requested, Error),
    row(ShelfEvent::Impair, Creating, Error),
    row(ShelfEvent::Impair, Pending, Error),
    row(ShelfEvent::Impair, Ready, Error),
    row(ShelfEvent::Recover, Error, Creating),
    row(ShelfEvent::Terminate, Creating, Terminating),
    row(ShelfEvent::Terminate, Pending, Terminating),
    row(ShelfEvent::Terminate, Ready, Terminating),
    row(ShelfEvent::Terminate, Error, Terminating),
];

pub fn next_state(from: ShelfState, event: ShelfEvent) -> Result<ShelfState> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.event == event)
        .map(|t| t.to)
        .ok_or_else(|| error::Error::TransitionNotAllowed {
            event: event.to_string(),
            from: from.to_string(),
        })
}

/// Whether entering `to` from `current` must be persisted.
pub fn needs_write(current: ShelfState, transitions: &StateTransitions, to: ShelfState) -> bool {
    current != to || latest_transition(transitions) != Some(to.to_string().as_str())
}

/// Everything `create` needs, resolved from the source cluster beforehand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfPlan {
    pub cluster_namespace: String,
    pub volume_snapshot_class: String,
    /// Node identifier → volume claim name.
    pub pvcs: BTreeMap<String, String>,
    pub parameters: BeibootParameters,
}

impl ShelfPlan {
    pub fn contents(&self) -> Vec<VolumeSnapshotContentRef> {
        self.pvcs
            .iter()
            .map(|(node, pvc)| VolumeSnapshotContentRef {
                node: node.clone(),
                pvc: pvc.clone(),
                name: None,
                snapshot_handle: None,
            })
            .collect()
    }

    fn status_fields(&self) -> Value {
        json!({
            "volumeSnapshotClass": self.volume_snapshot_class,
            "clusterNamespace": self.cluster_namespace,
            "clusterParameters": self.parameters,
        })
    }
}

pub struct ShelfMachine<'a> {
    ctx: &'a Context,
    shelf: &'a Shelf,
    state: ShelfState,
    transitions: StateTransitions,
    contents: Vec<VolumeSnapshotContentRef>,
    cluster_namespace: Option<String>,
    class: Option<String>,
}

impl<'a> ShelfMachine<'a> {
    pub fn new(ctx: &'a Context, shelf: &'a Shelf) -> Self {
        let status = shelf.status.clone().unwrap_or_default();
        Self {
            ctx,
            shelf,
            state: shelf.state(),
            transitions: status.state_transitions,
            contents: status.volume_snapshot_contents,
            cluster_namespace: status.cluster_namespace,
            class: status.volume_snapshot_class,
        }
    }

    pub fn state(&self) -> ShelfState {
        self.state
    }

    pub fn contents(&self) -> &[VolumeSnapshotContentRef] {
        &self.contents
    }

    /// True once `pending` recorded the retained contents.
    pub fn has_recorded_contents(&self) -> bool {
        !self.contents.is_empty() && self.contents.iter().all(|c| c.name.is_some())
    }

    async fn patch_status(&self, patch: Value) -> Result<()> {
        let api: Api<Shelf> =
            Api::namespaced(self.ctx.client.clone(), &self.shelf.namespace().unwrap_or_default());
        api.patch_status(
            &self.shelf.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&json!({ "status": patch })),
        )
        .await?;
        Ok(())
    }

    async fn fire(&mut self, event: ShelfEvent, extra: Value, note: String) -> Result<()> {
        let from = self.state;
        let to = next_state(from, event)?;
        let name = self.shelf.name_any();
        if !needs_write(from, &self.transitions, to) {
            debug!(%name, state = %to, %event, "already entered");
            return Ok(());
        }

        let ts = record_transition(&mut self.transitions, &to.to_string());
        let mut entered = serde_json::Map::new();
        entered.insert(to.to_string(), Value::String(ts));
        let mut patch = serde_json::Map::new();
        patch.insert("state".into(), json!(to));
        patch.insert("stateTransitions".into(), Value::Object(entered));
        if let Value::Object(extra) = extra {
            patch.extend(extra);
        }
        self.patch_status(Value::Object(patch)).await?;
        self.state = to;

        info!(%name, %from, %to, %event, "shelf state transition");
        let type_ = if to == Error {
            EventType::Warning
        } else {
            EventType::Normal
        };
        publish_event(
            &self.ctx.client,
            &self.ctx.reporter,
            self.shelf,
            type_,
            to.reason(),
            event.action(),
            Some(note),
        )
        .await;

        self.on_enter(to).await
    }

    async fn on_enter(&mut self, state: ShelfState) -> Result<()> {
        match state {
            Creating => self.enter_creating().await,
            Pending => self.enter_pending().await,
            Terminating => self.enter_terminating().await,
            Requested | Ready | Error => Ok(()),
        }
    }

    /// Run the entry hook of the current state again.
    pub async fn reenter(&mut self) -> Result<()> {
        self.on_enter(self.state).await
    }

    fn cluster_namespace(&self) -> Result<&str> {
        self.cluster_namespace
            .as_deref()
            .ok_or_else(|| error::Error::permanent("source cluster namespace not recorded"))
    }

    /// Record one entry per volume and snapshot each claim.
    async fn enter_creating(&mut self) -> Result<()> {
        if self.contents.is_empty() {
            return Err(error::Error::permanent("source cluster has no volumes to shelve"));
        }
        let ns = self.cluster_namespace()?.to_string();
        let class = self
            .class
            .clone()
            .ok_or_else(|| error::Error::permanent("no volume snapshot class resolved"))?;
        self.patch_status(json!({ "volumeSnapshotContents": self.contents }))
            .await?;

        let shelf = self.shelf.name_any();
        let api = snapshot::snapshots_api(&self.ctx.client, &ns);
        for entry in &self.contents {
            let name = snapshot::snapshot_name(&shelf, &entry.node);
            snapshot::create_or_ignore(
                &api,
                &snapshot::volume_snapshot(&name, &ns, &entry.pvc, &class),
            )
            .await?;
        }
        info!(%shelf, %ns, volumes = self.contents.len(), "requested volume snapshots");
        Ok(())
    }

    /// Retain every bound content and record its name and handle.
    async fn enter_pending(&mut self) -> Result<()> {
        let ns = self.cluster_namespace()?.to_string();
        let shelf = self.shelf.name_any();
        let snapshots = snapshot::snapshots_api(&self.ctx.client, &ns);
        let contents = snapshot::contents_api(&self.ctx.client);

        for entry in self.contents.iter_mut() {
            let vs = snapshots
                .get(&snapshot::snapshot_name(&shelf, &entry.node))
                .await?;
            let bound = snapshot::bound_content_name(&vs).ok_or_else(|| {
                error::Error::temporary(format!("snapshot of {} not bound yet", entry.node))
            })?;
            snapshot::retain_content(&self.ctx.client, &bound, FIELD_MANAGER).await?;
            let content = contents.get(&bound).await?;
            entry.snapshot_handle = snapshot::snapshot_handle(&content);
            entry.name = Some(bound);
        }
        self.patch_status(json!({ "volumeSnapshotContents": self.contents }))
            .await
    }

    /// Delete every retained content and the snapshots that produced them.
    async fn enter_terminating(&mut self) -> Result<()> {
        let shelf = self.shelf.name_any();
        let contents = snapshot::contents_api(&self.ctx.client);
        let delete_policy = json!({ "spec": { "deletionPolicy": "Delete" } });
        for name in self.contents.iter().filter_map(|c| c.name.as_deref()) {
            match contents
                .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&delete_policy))
                .await
            {
                Ok(_) => {}
                Err(ref e) if is_api_status(e, 404) => continue,
                Err(e) => return Err(e.into()),
            }
            match contents.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(%shelf, content = %name, "deleted volume snapshot content"),
                Err(ref e) if is_api_status(e, 404) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(ns) = self.cluster_namespace.as_deref() {
            let snapshots = snapshot::snapshots_api(&self.ctx.client, ns);
            for entry in &self.contents {
                let name = snapshot::snapshot_name(&shelf, &entry.node);
                match snapshots.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(ref e) if is_api_status(e, 404) => {}
                    Err(e) => warn!(%shelf, snapshot = %name, %e, "failed to delete volume snapshot"),
                }
            }
        }
        Ok(())
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    pub async fn create(&mut self, plan: &ShelfPlan) -> Result<()> {
        self.adopt(plan);
        let note = format!(
            "Shelving {} volumes of {}",
            plan.pvcs.len(),
            self.shelf.spec.cluster_name
        );
        self.fire(ShelfEvent::Create, plan.status_fields(), note).await
    }

    /// Advance once every snapshot is ready and bound; temporary otherwise.
    pub async fn shelve(&mut self) -> Result<()> {
        let ns = self.cluster_namespace()?.to_string();
        let shelf = self.shelf.name_any();
        let api = snapshot::snapshots_api(&self.ctx.client, &ns);
        for entry in &self.contents {
            let name = snapshot::snapshot_name(&shelf, &entry.node);
            let ready = api
                .get_opt(&name)
                .await?
                .is_some_and(|vs| {
                    snapshot::ready_to_use(&vs) && snapshot::bound_content_name(&vs).is_some()
                });
            if !ready {
                return Err(error::Error::temporary(format!("snapshot {name} not ready")));
            }
        }
        self.fire(ShelfEvent::Shelve, json!({}), "Volume snapshots taken".into())
            .await
    }

    /// Every recorded content still exists and is ready; temporary otherwise.
    pub async fn reconcile(&mut self) -> Result<()> {
        if !self.has_recorded_contents() {
            return Err(error::Error::temporary("volume snapshot contents not recorded yet"));
        }
        let api = snapshot::contents_api(&self.ctx.client);
        for name in self.contents.iter().filter_map(|c| c.name.as_deref()) {
            let ready = api
                .get_opt(name)
                .await?
                .is_some_and(|c| snapshot::ready_to_use(&c));
            if !ready {
                return Err(error::Error::temporary(format!(
                    "volume snapshot content {name} not ready"
                )));
            }
        }
        self.fire(ShelfEvent::Reconcile, json!({}), "Shelf is ready".into())
            .await
    }

    /// Move to ERROR with `reason`.  Never fails; problems are logged.
    pub async fn impair(&mut self, reason: &str) {
        let name = self.shelf.name_any();
        if next_state(self.state, ShelfEvent::Impair).is_err() {
            warn!(%name, state = %self.state, %reason, "cannot impair from current state");
            return;
        }
        let extra = json!({ "message": reason });
        if let Err(e) = self.fire(ShelfEvent::Impair, extra, reason.to_string()).await {
            warn!(%name, %e, %reason, "failed to record impairment");
        }
    }

    /// Start over from CREATING with a freshly resolved plan.
    pub async fn recover(&mut self, plan: &ShelfPlan) -> Result<()> {
        self.adopt(plan);
        let mut extra = plan.status_fields();
        extra["message"] = Value::Null;
        self.fire(ShelfEvent::Recover, extra, "Retrying volume snapshots".into())
            .await
    }

    pub async fn terminate(&mut self) -> Result<()> {
        self.fire(ShelfEvent::Terminate, json!({}), "Removing shelved volumes".into())
            .await
    }

    fn adopt(&mut self, plan: &ShelfPlan) {
        self.contents = plan.contents();
        self.cluster_namespace = Some(plan.cluster_namespace.clone());
        self.class = Some(plan.volume_snapshot_class.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_sequence() {
        let mut s = Requested;
        for (event, expected) in [
            (ShelfEvent::Create, Creating),
            (ShelfEvent::Shelve, Pending),
            (ShelfEvent::Reconcile, Ready),
            (ShelfEvent::Reconcile, Ready),
        ] {
            s = next_state(s, event).unwrap();
            assert_eq!(s, expected);
        }
    }

    #[test]
    fn test_error_recovers_to_creating() {
        for from in [Requested, Creating, Pending, Ready] {
            assert_eq!(next_state(from, ShelfEvent::Impair).unwrap(), Error);
        }
        assert_eq!(next_state(Error, ShelfEvent::Recover).unwrap(), Creating);
        assert_eq!(next_state(Error, ShelfEvent::Reconcile).unwrap(), Ready);
    }

    #[test]
    fn test_terminate_not_from_requested() {
        assert!(next_state(Requested, ShelfEvent::Terminate).is_err());
        for from in [Creating, Pending, Ready, Error] {
            assert_eq!(next_state(from, ShelfEvent::Terminate).unwrap(), Terminating);
        }
    }

    #[test]
    fn test_replayed_entry_is_not_written() {
        let mut transitions = StateTransitions::new();
        transitions.insert("PENDING".into(), "2024-01-01T00:00:00.000000+00:00".into());
        transitions.insert("READY".into(), "2024-01-01T00:05:00.000000+00:00".into());
        assert!(!needs_write(Ready, &transitions, Ready));
        assert!(needs_write(Ready, &transitions, Error));
        assert!(needs_write(Pending, &transitions, Ready));
    }

    #[test]
    fn test_stale_latest_transition_is_rewritten() {
        let mut transitions = StateTransitions::new();
        transitions.insert("PENDING".into(), "2024-01-01T00:00:00.000000+00:00".into());
        assert!(needs_write(Ready, &transitions, Ready));
    }

    #[test]
    fn test_plan_contents_one_entry_per_claim() {
        let plan = ShelfPlan {
            cluster_namespace: "getdeck-bbt-demo".into(),
            volume_snapshot_class: "csi-snapclass".into(),
            pvcs: BTreeMap::from([
                ("server".into(), "k8s-data-server-0".into()),
                ("node-1".into(), "k8s-data-node-1-0".into()),
            ]),
            parameters: BeibootParameters::default(),
        };
        let contents = plan.contents();
        assert_eq!(contents.len(), 2);
        assert!(contents.iter().all(|c| c.name.is_none() && c.snapshot_handle.is_none()));
        assert_eq!(contents[1].node, "server");
        assert_eq!(contents[1].pvc, "k8s-data-server-0");
        let fields = plan.status_fields();
        assert_eq!(fields["volumeSnapshotClass"], "csi-snapclass");
        assert_eq!(fields["clusterNamespace"], "getdeck-bbt-demo");
    }
}
