//! Shelf controller: snapshots a READY Beiboot's volumes and keeps the
//! retained contents alive until the Shelf is deleted.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
};
use tracing::{debug, info, warn};

use crate::crd::beiboot::{Beiboot, BeibootState};
use crate::crd::shelf::{Shelf, ShelfState};
use crate::error::{Error, Result};

use super::shelf_machine::{ShelfMachine, ShelfPlan};
use super::{route, Context, Routing};

const FINALIZER: &str = "getdeck.dev/shelf-cleanup";

/// Start the Shelf controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>, concurrency: u16) {
    let shelves: Api<Shelf> = Api::all(ctx.client.clone());

    Controller::new(shelves, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                let msg = format!("{e:?}");
                if msg.contains("ObjectNotFound") {
                    debug!("shelf reconcile: object already deleted");
                } else {
                    warn!("shelf reconcile failed: {msg}");
                }
            }
        })
        .await;
}

async fn reconcile(shelf: Arc<Shelf>, ctx: Arc<Context>) -> Result<Action> {
    let ns = shelf.namespace().unwrap_or_default();
    let api: Api<Shelf> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER, shelf, |event| async {
        match event {
            FinalizerEvent::Apply(shelf) => reconcile_shelf(&shelf, &ctx).await,
            FinalizerEvent::Cleanup(shelf) => cleanup_shelf(&shelf, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(shelf: Arc<Shelf>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = shelf.name_any();
    if matches!(error, Error::Finalizer(e) if e.to_string().contains("ObjectNotFound")) {
        debug!(%name, "object already deleted, skipping requeue");
        return Action::await_change();
    }
    warn!(%name, %error, "reconcile error, requeuing in 30s");
    Action::requeue(Duration::from_secs(30))
}

async fn reconcile_shelf(shelf: &Shelf, ctx: &Context) -> Result<Action> {
    let name = shelf.name_any();
    let state = shelf.state();
    debug!(%name, %state, "reconciling Shelf");

    let mut machine = ShelfMachine::new(ctx, shelf);
    let pipeline = matches!(state, ShelfState::Requested | ShelfState::Creating);
    match drive(&mut machine, shelf, ctx).await {
        Ok(()) => Ok(Action::requeue(ctx.timer_interval)),
        Err(e) => match route(e.severity(), pipeline) {
            Routing::Retry => {
                debug!(%name, state = %machine.state(), %e, "retrying");
                Ok(Action::requeue(ctx.retry_delay))
            }
            Routing::Impair => {
                warn!(%name, state = %machine.state(), %e, "shelf impaired");
                machine.impair(&e.to_string()).await;
                Ok(Action::requeue(ctx.timer_interval))
            }
            Routing::Escalate => Err(e),
        },
    }
}

async fn drive(m: &mut ShelfMachine<'_>, shelf: &Shelf, ctx: &Context) -> Result<()> {
    match m.state() {
        ShelfState::Requested => {
            let plan = resolve_plan(shelf, ctx).await?;
            m.create(&plan).await?;
            m.shelve().await?;
            m.reconcile().await
        }
        ShelfState::Creating => {
            m.reenter().await?;
            m.shelve().await?;
            m.reconcile().await
        }
        ShelfState::Pending => {
            m.reenter().await?;
            m.reconcile().await
        }
        ShelfState::Ready => m.reconcile().await,
        ShelfState::Error if m.has_recorded_contents() => m.reconcile().await,
        ShelfState::Error => {
            let plan = resolve_plan(shelf, ctx).await?;
            m.recover(&plan).await?;
            m.shelve().await?;
            m.reconcile().await
        }
        ShelfState::Terminating => Ok(()),
    }
}

/// Resolve the source cluster, its volume claims and the snapshot class.
async fn resolve_plan(shelf: &Shelf, ctx: &Context) -> Result<ShelfPlan> {
    let cluster_name = &shelf.spec.cluster_name;
    let beiboots: Api<Beiboot> =
        Api::namespaced(ctx.client.clone(), &shelf.namespace().unwrap_or_default());
    let cluster = beiboots
        .get_opt(cluster_name)
        .await?
        .ok_or_else(|| Error::permanent(format!("cluster {cluster_name} does not exist")))?;
    if cluster.state() != BeibootState::Ready {
        return Err(Error::permanent(format!(
            "cluster {cluster_name} is {}, not READY",
            cluster.state()
        )));
    }
    let cluster_namespace = cluster
        .bound_namespace()
        .ok_or_else(|| Error::permanent(format!("cluster {cluster_name} has no namespace")))?
        .to_string();

    let cfg = ctx.configuration().await?.merge(&cluster.spec.parameters)?;
    let volume_snapshot_class = plan_class(shelf, cfg.shelf_volume_snapshot_class.as_deref())?;

    let pvcs = ctx
        .provider(cluster.spec.provider)
        .get_pvc_mapping(&cluster_namespace)
        .await?;
    if pvcs.is_empty() {
        return Err(Error::temporary(format!(
            "no volume claims found for cluster {cluster_name}"
        )));
    }

    Ok(ShelfPlan {
        cluster_namespace,
        volume_snapshot_class,
        pvcs,
        parameters: cfg.to_parameters(),
    })
}

/// The requested class, else the configured default.
pub fn plan_class(shelf: &Shelf, default: Option<&str>) -> Result<String> {
    shelf
        .spec
        .volume_snapshot_class
        .as_deref()
        .or(default)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::permanent("no volume snapshot class requested or configured"))
}

async fn cleanup_shelf(shelf: &Shelf, ctx: &Context) -> Result<Action> {
    let name = shelf.name_any();
    let state = shelf.state();
    if state == ShelfState::Requested {
        info!(%name, "nothing to remove");
        return Ok(Action::await_change());
    }
    info!(%name, %state, "cleaning up Shelf");
    let mut machine = ShelfMachine::new(ctx, shelf);
    if state == ShelfState::Terminating {
        // an earlier cleanup stopped part way
        machine.reenter().await?;
    } else {
        machine.terminate().await?;
    }
    Ok(Action::await_change())
}
