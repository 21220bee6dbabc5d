//! The CSI gRPC surface: identity, controller and node services served
//! over a Unix domain socket.
use std::path::Path;

use csi_grpc::v1::{
    controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tracing::info;

mod controller;
mod identity;
mod node;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use crate::backend::SecretBackendError;

/// The driver name advertised through the identity service, unless
/// overridden on the command line.
pub const DEFAULT_DRIVER_NAME: &str = "secrets.kubedoop.dev";

/// Topology segment key restricting which nodes may mount a volume.
pub const TOPOLOGY_NODE_KEY: &str = "secrets.kubedoop.dev/node";

const UNIX_ENDPOINT_PREFIX: &str = "unix://";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("endpoint {endpoint:?} is not a unix socket address"))]
    UnsupportedEndpoint { endpoint: String },

    #[snafu(display("failed to create socket directory {path:?}"))]
    CreateSocketDir { source: std::io::Error, path: String },

    #[snafu(display("failed to bind unix socket {path:?}"))]
    BindSocket { source: std::io::Error, path: String },

    #[snafu(display("gRPC server failed"))]
    Serve { source: tonic::transport::Error },
}

/// Runs the CSI services on `endpoint` (e.g. `unix:///tmp/csi.sock`) until
/// SIGINT/SIGTERM.
pub async fn serve(
    endpoint: &str,
    identity: IdentityService,
    controller: ControllerService,
    node: NodeService,
) -> Result<()> {
    let socket_path = endpoint
        .strip_prefix(UNIX_ENDPOINT_PREFIX)
        .filter(|path| !path.is_empty())
        .context(UnsupportedEndpointSnafu { endpoint })?;

    if let Some(parent) = Path::new(socket_path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context(CreateSocketDirSnafu {
                path: parent.display().to_string(),
            })?;
    }
    // A stale socket from a previous run would make bind fail.
    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path).context(BindSocketSnafu { path: socket_path })?;
    let incoming = UnixListenerStream::new(listener);

    info!(endpoint, "serving CSI");
    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(ControllerServer::new(controller))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(incoming, shutdown_signal())
        .await
        .context(ServeSnafu)
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler, shutting down on ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    info!("shutdown signal received");
}

/// Renders an error with its full source chain, the message surfaced to
/// the kubelet.
pub fn error_full_message(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Converts a backend failure into the gRPC status surfaced at the CSI
/// boundary.
pub(crate) fn backend_status<E: SecretBackendError>(error: &E) -> tonic::Status {
    tonic::Status::new(error.grpc_code(), error_full_message(error))
}

#[cfg(test)]
mod tests {
    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("outer failure"))]
    struct OuterError {
        source: std::io::Error,
    }

    #[test]
    fn error_messages_include_the_source_chain() {
        let error = OuterError {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "inner failure"),
        };

        assert_eq!(error_full_message(&error), "outer failure: inner failure");
    }
}
