//! The secret-provisioning CSI driver binary. Serves the CSI identity,
//! controller and node services over a Unix socket in a single process.
use clap::Parser;
use kube::Client;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod backend;
mod crd;
mod csi;
mod duration;
mod format;
mod kerberos;
mod pod_info;
mod volume;

use backend::SharedLocks;
use csi::{ControllerService, DEFAULT_DRIVER_NAME, IdentityService, NodeService};

#[derive(Debug, Parser)]
#[command(name = "secret-csi-driver", version, about)]
struct Cli {
    /// CSI endpoint the kubelet and the sidecars connect to.
    #[arg(long, default_value = "unix:///tmp/csi.sock")]
    endpoint: String,

    /// Name of the Kubernetes node this driver instance runs on.
    #[arg(long = "nodeid", env = "NODE_NAME")]
    node_id: Option<String>,

    /// Driver name advertised to the kubelet.
    #[arg(long = "drivername", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Address the health probe endpoint binds to.
    #[arg(long = "health-probe-bind-address", default_value = ":8081")]
    health_probe_bind_address: String,

    /// Address the metric endpoint binds to; "0" disables it.
    #[arg(long = "metrics-bind-address", default_value = "0")]
    metrics_bind_address: String,

    /// Whether the metrics endpoint is served over HTTPS.
    #[arg(long = "metrics-secure", default_value_t = true)]
    metrics_secure: bool,

    /// Whether HTTP/2 is enabled for the metrics and webhook servers.
    #[arg(long = "enable-http2", default_value_t = false)]
    enable_http2: bool,

    /// Enable leader election for the controller manager.
    #[arg(long = "leader-elect", default_value_t = false)]
    leader_elect: bool,

    /// Log verbosity, either a level or a tracing filter directive.
    #[arg(long = "zap-log-level", default_value = "info")]
    zap_log_level: String,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("--nodeid is required"))]
    MissingNodeId,

    #[snafu(display("failed to serve CSI"))]
    Serve { source: csi::Error },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.zap_log_level)
                .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string())),
        )
        .init();

    if let Err(error) = run(cli).await {
        error!("{}", csi::error_full_message(&error));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    info!(
        endpoint = %cli.endpoint,
        driver_name = %cli.driver_name,
        metrics_bind_address = %cli.metrics_bind_address,
        metrics_secure = cli.metrics_secure,
        enable_http2 = cli.enable_http2,
        leader_elect = cli.leader_elect,
        version = env!("CARGO_PKG_VERSION"),
        "starting secret CSI driver"
    );

    let node_id = cli.node_id.context(MissingNodeIdSnafu)?;
    let client = Client::try_default().await.context(CreateClientSnafu)?;
    let locks = SharedLocks::default();

    tokio::spawn(serve_health_probe(cli.health_probe_bind_address));

    csi::serve(
        &cli.endpoint,
        IdentityService::new(cli.driver_name),
        ControllerService::new(client.clone(), locks.clone()),
        NodeService::new(client, node_id, locks),
    )
    .await
    .context(ServeSnafu)
}

/// Liveness/readiness endpoint for the deployment probes.
async fn serve_health_probe(address: String) {
    // Accept the controller-runtime style ":8081" shorthand.
    let address = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address,
    };

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%address, %error, "failed to bind health probe endpoint");
            return;
        }
    };

    let router = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(|| async { "ok" }));

    if let Err(error) = axum::serve(listener, router).await {
        warn!(%error, "health probe endpoint failed");
    }
}
