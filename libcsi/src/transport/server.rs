//! Socket server hosting the CSI services.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use super::TransportError;
use crate::controller::ControllerService;
use crate::identity::IdentityService;
use crate::node::NodeService;
use crate::proto::controller_server::ControllerServer;
use crate::proto::identity_server::IdentityServer;
use crate::proto::node_server::NodeServer;

/// The service served next to identity.
pub enum Role {
    Controller(ControllerService),
    Node(NodeService),
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Self::Controller(_) => "controller",
            Self::Node(_) => "node",
        }
    }
}

/// Socket path of a `unix://<path>` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, TransportError> {
    match endpoint.strip_prefix("unix://") {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(TransportError::InvalidEndpoint(endpoint.to_owned())),
    }
}

fn socket_error(path: &Path) -> impl FnOnce(std::io::Error) -> TransportError + '_ {
    move |source| TransportError::Socket {
        path: path.to_path_buf(),
        source,
    }
}

/// Removes a socket file left behind by a previous run.
async fn remove_socket(path: &Path) -> Result<(), TransportError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(socket_error(path)(e)),
    }
}

/// Serves `identity` and `role` on the socket at `path` until `shutdown`
/// resolves.
///
/// `identity` reports ready once the socket is bound and not ready again
/// after shutdown.  The socket file is removed on the way out.
pub async fn serve<F>(
    path: &Path,
    identity: IdentityService,
    role: Role,
    shutdown: F,
) -> Result<(), TransportError>
where
    F: Future<Output = ()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(socket_error(path))?;
    }
    remove_socket(path).await?;
    let listener = UnixListener::bind(path).map_err(socket_error(path))?;

    let router = Server::builder().add_service(IdentityServer::new(identity.clone()));
    let role_name = role.name();
    let router = match role {
        Role::Controller(service) => router.add_service(ControllerServer::new(service)),
        Role::Node(service) => router.add_service(NodeServer::new(service)),
    };

    identity.set_ready(true);
    info!(path = %path.display(), role = role_name, "csi server listening");
    let result = router
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await;
    identity.set_ready(false);
    info!(role = role_name, "csi server stopped");

    if let Err(e) = remove_socket(path).await {
        warn!(error = %e, "unable to remove socket");
    }
    result.map_err(TransportError::Serve)
}
