//! beiboot-operator: both controllers, the validating webhook and the
//! health probes run as concurrent tokio tasks in one binary, sharing a
//! common Context.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::info;
use warp::Filter;

use beiboot_operator::controller::{self, Context};
use beiboot_operator::provider::K3sProvider;
use beiboot_operator::webhook;

#[derive(Parser, Debug)]
#[command(
    name = "beiboot-operator",
    about = "Kubernetes operator for ephemeral nested k3s clusters"
)]
struct Args {
    /// Namespace where the operator is deployed (holds the configuration ConfigMap).
    #[arg(long, default_value = "getdeck", env = "OPERATOR_NAMESPACE")]
    operator_namespace: String,

    /// Name of the ConfigMap with the cluster defaults.
    #[arg(long, default_value = "beiboot-config", env = "CONFIG_MAP_NAME")]
    config_map_name: String,

    /// Seconds between periodic reconciles of every resource.
    #[arg(long, default_value = "60", env = "TIMER_INTERVAL")]
    timer_interval: u64,

    /// Seconds before retrying a temporary condition.
    #[arg(long, default_value = "5", env = "RETRY_DELAY")]
    retry_delay: u64,

    /// Upper bound of concurrent reconciles per controller.
    #[arg(long, default_value = "8", env = "MAX_CONCURRENT_RECONCILES")]
    max_concurrent_reconciles: u16,

    /// Port for the validating webhook HTTPS server.
    #[arg(long, default_value = "9443", env = "WEBHOOK_PORT")]
    webhook_port: u16,

    /// Path to the TLS certificate for the webhook server.
    #[arg(
        long,
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt",
        env = "WEBHOOK_TLS_CERT"
    )]
    webhook_tls_cert: String,

    /// Path to the TLS key for the webhook server.
    #[arg(
        long,
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key",
        env = "WEBHOOK_TLS_KEY"
    )]
    webhook_tls_key: String,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,

    /// Registry queried to verify a requested k3s image tag exists.
    #[arg(long, default_value = "https://hub.docker.com", env = "REGISTRY_URL")]
    registry_url: String,
}

/// Accepts ":8081" as well as "0.0.0.0:8081".
fn parse_bind_address(addr: &str) -> anyhow::Result<std::net::SocketAddr> {
    addr.strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| addr.to_string())
        .parse()
        .with_context(|| format!("invalid --health-probe-bind-address {addr:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let client = Client::try_default().await?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    info!(
        ns = %args.operator_namespace,
        config = %args.config_map_name,
        "starting beiboot-operator"
    );

    let ctx = Arc::new(Context {
        client: client.clone(),
        reporter: Reporter {
            controller: "beiboot-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        },
        operator_namespace: args.operator_namespace,
        config_map_name: args.config_map_name,
        k3s: Arc::new(K3sProvider::new(client, http, args.registry_url)),
        timer_interval: Duration::from_secs(args.timer_interval),
        retry_delay: Duration::from_secs(args.retry_delay),
        poll_interval: Duration::from_secs(2),
    });

    let webhook_addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.webhook_port));
    let health_addr = parse_bind_address(&args.health_probe_bind_address)?;

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    let concurrency = args.max_concurrent_reconciles;
    tokio::select! {
        _ = controller::beiboot::run(ctx.clone(), concurrency) => {},
        _ = controller::shelf::run(ctx.clone(), concurrency) => {},
        _ = webhook::run(webhook_addr, &args.webhook_tls_cert, &args.webhook_tls_key, ctx.clone()) => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
    }

    Ok(())
}
