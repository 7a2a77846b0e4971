//! gRPC transport over a unix domain socket.
//!
//! The container orchestrator reaches the driver through a socket path given
//! as `unix://<path>`.  [`server::serve`] exposes the identity service plus
//! either the controller or the node service on it; [`client::CsiClient`]
//! connects to such a socket, e.g. for the `probe` subcommand and in tests.

pub mod client;
pub mod server;

use std::path::PathBuf;

use thiserror::Error;

pub use client::CsiClient;
pub use server::{Role, parse_endpoint, serve};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint {0}: only unix://<path> is supported")]
    InvalidEndpoint(String),

    #[error("unable to set up socket {}", path.display())]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("grpc server failed")]
    Serve(#[source] tonic::transport::Error),

    #[error("unable to connect to {}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
}
