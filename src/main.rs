//! ssp-operator: Kubernetes operator for the KubeVirt SSP resource.
//!
//! The controller, the validating webhook and the health probes run as
//! concurrent tokio tasks within a single binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

use ssp_operator::admission::SspValidator;
use ssp_operator::bundle::TemplateBundle;
use ssp_operator::cluster::kubernetes::KubeCluster;
use ssp_operator::cluster::ClusterClient;
use ssp_operator::controller;
use ssp_operator::controller::engine::Engine;
use ssp_operator::controller::operands::{
    common_templates::CommonTemplates, template_validator::TemplateValidator, Operand,
};
use ssp_operator::fingerprint::VersionCache;
use ssp_operator::helpers::{OperatorConfig, DEFAULT_VALIDATOR_IMAGE};
use ssp_operator::registry::Registry;
use ssp_operator::webhook;

#[derive(Parser, Debug)]
#[command(name = "ssp-operator", about = "Kubernetes operator for KubeVirt SSP")]
struct Args {
    /// Multi-document YAML file with the bundled common templates.
    #[arg(
        long,
        default_value = "/data/common-templates.yaml",
        env = "TEMPLATES_BUNDLE"
    )]
    templates_bundle: PathBuf,

    /// Version label stamped on deployed templates. Defaults to the version
    /// in a `common-templates-<version>.yaml` bundle file name.
    #[arg(long, env = "TEMPLATES_VERSION")]
    templates_version: Option<String>,

    /// Container image of the template validator.
    #[arg(long, default_value = DEFAULT_VALIDATOR_IMAGE, env = "VALIDATOR_IMAGE")]
    validator_image: String,

    /// Upper bound for a single reconciliation pass.
    #[arg(long, default_value = "120", env = "RECONCILE_TIMEOUT_SECS")]
    reconcile_timeout_secs: u64,

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

    let config = OperatorConfig {
        templates_bundle: args.templates_bundle,
        templates_version: args.templates_version,
        validator_image: args.validator_image,
        reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
    };

    let bundle = TemplateBundle::load(&config.templates_bundle, config.templates_version.as_deref())
        .with_context(|| format!("loading {}", config.templates_bundle.display()))?;
    info!(
        version = %bundle.version,
        templates = bundle.len(),
        image = %config.validator_image,
        "starting ssp-operator"
    );

    let client = Client::try_default().await?;
    let registry = Arc::new(Registry::new());
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(client.clone(), registry));
    let cancel = CancellationToken::new();

    // Fixed order: the golden-images namespace must exist before anything
    // is placed in it.
    let operands: Vec<Box<dyn Operand>> = vec![
        Box::new(CommonTemplates::new(Arc::new(bundle))),
        Box::new(TemplateValidator::new(config.validator_image.clone())),
    ];
    let engine = Engine::new(operands);

    let ctx = Arc::new(controller::ssp::Context {
        client: client.clone(),
        cluster: cluster.clone(),
        engine,
        versions: VersionCache::new(),
        config,
        reporter: Reporter {
            controller: "ssp-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        },
        cancel: cancel.clone(),
    });
    let validator = Arc::new(SspValidator::new(cluster));

    let webhook_addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.webhook_port));
    let tls_cert = args.webhook_tls_cert;
    let tls_key = args.webhook_tls_key;

    // Parse health probe bind address (e.g. ":8081" or "0.0.0.0:8081").
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or(args.health_probe_bind_address)
        .parse()
        .context("invalid --health-probe-bind-address")?;

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    tokio::select! {
        _ = controller::ssp::run(ctx.clone()) => {},
        _ = webhook::run(validator, webhook_addr, &tls_cert, &tls_key) => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
        _ = cancel.cancelled() => {},
    }

    Ok(())
}
