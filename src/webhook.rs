//! Validating admission webhook for Beiboot and Shelf.
//!
//! Only CREATE is validated.  A Beiboot is rejected when:
//! - its namespace name is too long or already exists
//! - `maxLifetime`, `maxSessionTimeout`, `clusterReadyTimeout`, `ports` or the
//!   Gefyra port range are malformed or out of range
//! - `fromShelf` names a Shelf that does not exist or is not READY
//!
//! A Shelf is rejected when its cluster is not READY or its requested
//! VolumeSnapshotClass does not exist.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use tracing::{info, warn};
use warp::Filter;

use crate::config::check_ready_timeout;
use crate::controller::Context;
use crate::crd::beiboot::{Beiboot, BeibootParameters, BeibootState};
use crate::crd::shelf::{Shelf, ShelfState};
use crate::helpers::{
    beiboot_namespace, parse_port_mapping, parse_port_range, parse_timedelta, MAX_NAMESPACE_LEN,
};
use crate::snapshot;

/// Start the validating webhook server on the given address.
/// Returns a future that runs the HTTPS server forever.
pub async fn run(addr: std::net::SocketAddr, tls_cert: &str, tls_key: &str, ctx: Arc<Context>) {
    let with_ctx = warp::any().map(move || ctx.clone());

    let beiboot = warp::post()
        .and(warp::path("validate-getdeck-dev-v1-beiboot"))
        .and(warp::body::json())
        .and(with_ctx.clone())
        .and_then(|review: AdmissionReview<Beiboot>, ctx: Arc<Context>| async move {
            Ok::<_, Infallible>(warp::reply::json(&review_beiboot(review, &ctx).await))
        });
    let shelf = warp::post()
        .and(warp::path("validate-getdeck-dev-v1-shelf"))
        .and(warp::body::json())
        .and(with_ctx)
        .and_then(|review: AdmissionReview<Shelf>, ctx: Arc<Context>| async move {
            Ok::<_, Infallible>(warp::reply::json(&review_shelf(review, &ctx).await))
        });

    info!(%addr, "starting validating webhook server");
    warp::serve(beiboot.or(shelf))
        .tls()
        .cert_path(tls_cert)
        .key_path(tls_key)
        .run(addr)
        .await;
}

fn respond<K>(req: &AdmissionRequest<K>, verdict: Result<(), String>) -> AdmissionReview<DynamicObject>
where
    K: kube::Resource,
{
    match verdict {
        Ok(()) => AdmissionResponse::from(req).into_review(),
        Err(msg) => {
            info!(name = %req.name, kind = %req.kind.kind, %msg, "admission denied");
            AdmissionResponse::from(req).deny(msg).into_review()
        }
    }
}

async fn review_beiboot(review: AdmissionReview<Beiboot>, ctx: &Context) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<Beiboot> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(%e, "invalid admission request");
            return AdmissionResponse::invalid(format!("invalid request: {e}")).into_review();
        }
    };
    let verdict = match (&req.operation, req.object.as_ref()) {
        (Operation::Create, Some(beiboot)) => {
            validate_beiboot(beiboot, req.namespace.as_deref(), ctx).await
        }
        _ => Ok(()),
    };
    respond(&req, verdict)
}

async fn review_shelf(review: AdmissionReview<Shelf>, ctx: &Context) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<Shelf> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(%e, "invalid admission request");
            return AdmissionResponse::invalid(format!("invalid request: {e}")).into_review();
        }
    };
    let verdict = match (&req.operation, req.object.as_ref()) {
        (Operation::Create, Some(shelf)) => {
            validate_shelf(shelf, req.namespace.as_deref(), ctx).await
        }
        _ => Ok(()),
    };
    respond(&req, verdict)
}

async fn validate_beiboot(beiboot: &Beiboot, ns: Option<&str>, ctx: &Context) -> Result<(), String> {
    validate_parameters(&beiboot.spec.parameters)?;

    let cfg = ctx
        .configuration()
        .await
        .map_err(|e| format!("cannot read cluster configuration: {e}"))?;
    let target = beiboot_namespace(&cfg.namespace_prefix, &beiboot.name_any());
    check_namespace_name(&target)?;
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let existing = namespaces
        .get_opt(&target)
        .await
        .map_err(|e| format!("cannot look up namespace {target}: {e}"))?;
    if existing.is_some() {
        return Err(format!("namespace {target} already exists"));
    }

    if let Some(name) = beiboot.spec.from_shelf.as_deref() {
        let shelves: Api<Shelf> = Api::namespaced(ctx.client.clone(), ns.unwrap_or("default"));
        let shelf = shelves
            .get_opt(name)
            .await
            .map_err(|e| format!("cannot look up shelf {name}: {e}"))?;
        check_source_shelf(name, shelf.as_ref())?;
    }
    Ok(())
}

async fn validate_shelf(shelf: &Shelf, ns: Option<&str>, ctx: &Context) -> Result<(), String> {
    let name = &shelf.spec.cluster_name;
    let beiboots: Api<Beiboot> = Api::namespaced(ctx.client.clone(), ns.unwrap_or("default"));
    let cluster = beiboots
        .get_opt(name)
        .await
        .map_err(|e| format!("cannot look up cluster {name}: {e}"))?;
    check_source_cluster(name, cluster.as_ref())?;

    if let Some(class) = shelf.spec.volume_snapshot_class.as_deref() {
        let found = snapshot::classes_api(&ctx.client)
            .get_opt(class)
            .await
            .map_err(|e| format!("cannot look up volume snapshot class {class}: {e}"))?;
        if found.is_none() {
            return Err(format!("volume snapshot class {class} does not exist"));
        }
    }
    Ok(())
}

/// Syntax checks that need no lookups.
pub fn validate_parameters(params: &BeibootParameters) -> Result<(), String> {
    if params.nodes == Some(0) {
        return Err("parameters.nodes must be at least 1".into());
    }
    for (field, value) in [
        ("maxLifetime", &params.max_lifetime),
        ("maxSessionTimeout", &params.max_session_timeout),
    ] {
        if let Some(v) = value {
            parse_timedelta(v, false).map_err(|e| format!("parameters.{field}: {e}"))?;
        }
    }
    if let Some(t) = params.cluster_ready_timeout {
        check_ready_timeout(t).map_err(|e| format!("parameters.clusterReadyTimeout: {e}"))?;
    }
    let mut remotes = BTreeSet::new();
    for port in params.ports.iter().flatten() {
        let (_, remote) = parse_port_mapping(port).map_err(|e| format!("parameters.ports: {e}"))?;
        if !remotes.insert(remote) {
            return Err(format!("parameters.ports: remote port {remote} is forwarded twice"));
        }
    }
    if let Some(range) = params.gefyra.as_ref().and_then(|g| g.port_range.as_deref()) {
        parse_port_range(range).map_err(|e| format!("parameters.gefyra.portRange: {e}"))?;
    }
    Ok(())
}

pub fn check_namespace_name(ns: &str) -> Result<(), String> {
    if ns.len() > MAX_NAMESPACE_LEN {
        return Err(format!(
            "namespace {ns} is longer than {MAX_NAMESPACE_LEN} characters"
        ));
    }
    Ok(())
}

pub fn check_source_shelf(name: &str, shelf: Option<&Shelf>) -> Result<(), String> {
    match shelf {
        None => Err(format!("shelf {name} does not exist")),
        Some(s) if s.state() != ShelfState::Ready => {
            Err(format!("shelf {name} is {}, not READY", s.state()))
        }
        Some(_) => Ok(()),
    }
}

pub fn check_source_cluster(name: &str, cluster: Option<&Beiboot>) -> Result<(), String> {
    match cluster {
        None => Err(format!("cluster {name} does not exist")),
        Some(c) if c.state() != BeibootState::Ready => {
            Err(format!("cluster {name} is {}, not READY", c.state()))
        }
        Some(_) => Ok(()),
    }
}
