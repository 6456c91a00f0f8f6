//! Beiboot controller: resolves configuration, enforces the sunset policy
//! and drives the lifecycle state machine one tick at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DeleteParams, ResourceExt},
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ClusterConfiguration;
use crate::crd::beiboot::{Beiboot, BeibootState};
use crate::crd::shelf::Shelf;
use crate::error::{is_api_status, Error, Result, Severity};
use crate::helpers::{beiboot_namespace, format_iso, latest_client_contact, SunsetCheck};

use super::helpers::publish_event;
use super::state_machine::{needs_teardown, BeibootMachine};
use super::{route, Context, Routing};

const FINALIZER: &str = "getdeck.dev/beiboot-cleanup";

/// ConfigMap in the cluster namespace holding `client-id → timestamp` heartbeats.
pub const HEARTBEAT_CONFIG_MAP: &str = "beiboot-clients";

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the Beiboot controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>, concurrency: u16) {
    let beiboots: Api<Beiboot> = Api::all(ctx.client.clone());

    Controller::new(beiboots, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((_obj, _action)) => {}
                Err(e) => {
                    let msg = format!("{e:?}");
                    if msg.contains("ObjectNotFound") {
                        debug!("reconcile: object already deleted");
                    } else {
                        warn!("reconcile failed: {msg}");
                    }
                }
            }
        })
        .await;
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

async fn reconcile(beiboot: Arc<Beiboot>, ctx: Arc<Context>) -> Result<Action> {
    let ns = beiboot.namespace().unwrap_or_default();
    let api: Api<Beiboot> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER, beiboot, |event| async {
        match event {
            FinalizerEvent::Apply(beiboot) => reconcile_beiboot(&beiboot, &ctx).await,
            FinalizerEvent::Cleanup(beiboot) => cleanup_beiboot(&beiboot, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(beiboot: Arc<Beiboot>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = beiboot.name_any();
    if matches!(error, Error::Finalizer(e) if e.to_string().contains("ObjectNotFound")) {
        debug!(%name, "object already deleted, skipping requeue");
        return Action::await_change();
    }
    warn!(%name, %error, "reconcile error, requeuing in 30s");
    Action::requeue(Duration::from_secs(30))
}

/// The create/boot/operate pipeline treats unclassified errors as permanent.
pub fn in_pipeline(state: BeibootState) -> bool {
    matches!(
        state,
        BeibootState::Requested | BeibootState::Creating | BeibootState::Pending
    )
}

async fn reconcile_beiboot(beiboot: &Beiboot, ctx: &Context) -> Result<Action> {
    let name = beiboot.name_any();
    let state = beiboot.state();
    if state == BeibootState::Terminating {
        return Ok(Action::await_change());
    }
    debug!(%name, %state, "reconciling Beiboot");

    let (cfg, shelf, invalid) = match resolve_configuration(beiboot, ctx).await {
        Ok((cfg, shelf)) => (cfg, shelf, None),
        Err(e) if e.is_temporary() => {
            debug!(%name, %e, "configuration not resolvable yet");
            return Ok(Action::requeue(ctx.retry_delay));
        }
        Err(e) if e.severity() == Severity::Permanent => {
            (ClusterConfiguration::default(), None, Some(e))
        }
        Err(e) => return Err(e),
    };
    let namespace = beiboot
        .bound_namespace()
        .map(str::to_string)
        .unwrap_or_else(|| beiboot_namespace(&cfg.namespace_prefix, &name));
    let mut machine = BeibootMachine::new(ctx, beiboot, cfg, namespace, shelf);

    if let Some(e) = invalid {
        warn!(%name, %e, "invalid cluster configuration");
        machine.impair(&e.to_string()).await;
        return Ok(Action::requeue(ctx.timer_interval));
    }

    if sunset(&machine).await? {
        return Ok(Action::await_change());
    }

    match drive(&mut machine).await {
        Ok(()) => Ok(Action::requeue(ctx.timer_interval)),
        Err(e) => match route(e.severity(), in_pipeline(state)) {
            Routing::Retry => {
                debug!(%name, state = %machine.state(), %e, "retrying");
                Ok(Action::requeue(ctx.retry_delay))
            }
            Routing::Impair => {
                warn!(%name, state = %machine.state(), %e, "cluster impaired");
                machine.impair(&e.to_string()).await;
                Ok(Action::requeue(ctx.timer_interval))
            }
            Routing::Escalate => Err(e),
        },
    }
}

/// Run the transitions the current state calls for.
async fn drive(m: &mut BeibootMachine<'_>) -> Result<()> {
    match m.state() {
        BeibootState::Requested => {
            m.create().await?;
            m.boot().await?;
            m.operate().await?;
            m.reconcile().await
        }
        BeibootState::Creating => {
            m.reenter().await?;
            m.boot().await?;
            m.operate().await?;
            m.reconcile().await
        }
        BeibootState::Pending => {
            m.reenter().await?;
            m.operate().await?;
            m.reconcile().await
        }
        BeibootState::Running => {
            m.reenter().await?;
            m.reconcile().await
        }
        BeibootState::Ready => m.reconcile().await,
        BeibootState::Error => {
            if m.provider().running(m.namespace()).await? {
                m.recover().await?;
                m.reconcile().await
            } else if m.beiboot().bound_namespace().is_some() {
                // impaired before its workloads came up
                m.reprovision().await
            } else {
                Ok(())
            }
        }
        BeibootState::Terminating => Ok(()),
    }
}

/// Operator defaults merged with the request.  When restoring, the shelf's
/// captured topology wins and the shelf is returned for the creating hook.
/// In ERROR the shelf is only needed to resubmit, so a missing one is not
/// an error there.
async fn resolve_configuration(
    beiboot: &Beiboot,
    ctx: &Context,
) -> Result<(ClusterConfiguration, Option<Shelf>)> {
    let mut cfg = ctx.configuration().await?.merge(&beiboot.spec.parameters)?;

    let state = beiboot.state();
    let restoring = matches!(
        state,
        BeibootState::Requested | BeibootState::Creating | BeibootState::Error
    );
    let Some(shelf_name) = beiboot.spec.from_shelf.as_deref().filter(|_| restoring) else {
        return Ok((cfg, None));
    };
    let shelves: Api<Shelf> =
        Api::namespaced(ctx.client.clone(), &beiboot.namespace().unwrap_or_default());
    let shelf = match shelves.get_opt(shelf_name).await? {
        Some(shelf) => shelf,
        None if state == BeibootState::Error => return Ok((cfg, None)),
        None => return Err(Error::permanent(format!("shelf {shelf_name} does not exist"))),
    };
    if let Some(params) = shelf.status.as_ref().and_then(|s| s.cluster_parameters.as_ref()) {
        cfg = cfg.with_shelf_topology(params);
    }
    Ok((cfg, Some(shelf)))
}

/// Evaluate lifetime and session deadlines.  Records changed instants on the
/// status; returns true when the Beiboot was deleted.
async fn sunset(m: &BeibootMachine<'_>) -> Result<bool> {
    let beiboot = m.beiboot();
    let name = beiboot.name_any();
    let client = &m.ctx().client;

    let heartbeats: Api<ConfigMap> = Api::namespaced(client.clone(), m.namespace());
    let last_contact = heartbeats
        .get_opt(HEARTBEAT_CONFIG_MAP)
        .await?
        .and_then(|cm| latest_client_contact(&cm.data.unwrap_or_default()));

    let check = SunsetCheck::evaluate(
        beiboot.metadata.creation_timestamp.as_ref().map(|t| t.0),
        m.cfg().max_lifetime(),
        last_contact,
        m.cfg().max_session_timeout(),
    );

    let sunset = check.sunset.map(format_iso);
    let contact = last_contact.map(format_iso);
    let status = beiboot.status.clone().unwrap_or_default();
    if status.sunset != sunset || status.last_client_contact != contact {
        m.patch_status(json!({ "sunset": sunset, "lastClientContact": contact }))
            .await?;
    }

    if !check.expired(Utc::now()) {
        return Ok(false);
    }
    info!(%name, ?sunset, ?contact, "cluster reached its sunset");
    publish_event(
        client,
        &m.ctx().reporter,
        beiboot,
        EventType::Normal,
        "Sunset",
        "Terminate",
        Some("Cluster lifetime or session timeout exceeded".into()),
    )
    .await;
    let api: Api<Beiboot> = Api::namespaced(client.clone(), &beiboot.namespace().unwrap_or_default());
    match api.delete(&name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(e) if is_api_status(&e, 404) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup_beiboot(beiboot: &Beiboot, ctx: &Context) -> Result<Action> {
    let name = beiboot.name_any();
    let state = beiboot.state();
    if !needs_teardown(state) {
        info!(%name, %state, "nothing to tear down");
        return Ok(Action::await_change());
    }

    let cfg = match ctx.configuration().await {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(%name, %e, "using default configuration for teardown");
            ClusterConfiguration::default()
        }
    };
    let namespace = beiboot
        .bound_namespace()
        .map(str::to_string)
        .unwrap_or_else(|| beiboot_namespace(&cfg.namespace_prefix, &name));
    info!(%name, %namespace, "cleaning up Beiboot");

    let mut machine = BeibootMachine::new(ctx, beiboot, cfg, namespace, None);
    machine.terminate().await?;
    Ok(Action::await_change())
}
