//! # libcsi — CSI driver for TrueNAS iSCSI volumes
//!
//! `libcsi` implements the [Container Storage Interface][csi] for block
//! volumes living on a TrueNAS appliance.  The controller provisions each
//! volume as a zvol exported through an iSCSI target; the node logs into that
//! target, mounts the LUN into the pod and tears it all down again.  It
//! follows the usual RK8s conventions (Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`proto`] | CSI v1 messages and gRPC stubs generated by `tonic-build`. |
//! | [`types`] | Driver constants, request keys, capacity and capability checks. |
//! | [`error`] | [`CsiError`] and its mapping onto gRPC status codes. |
//! | [`exec`] | [`Executor`] abstraction over local commands. |
//! | [`poll`] | Bounded poll-until-ready helper. |
//! | [`backend`] | [`Backend`] trait and the TrueNAS implementation. |
//! | [`iscsi`] | [`SessionManager`], session registries and device names. |
//! | [`mount`] | [`Mounter`] trait and the Linux implementation. |
//! | [`identity`] | CSI Identity service. |
//! | [`controller`] | CSI Controller service: create, delete, expand. |
//! | [`node`] | CSI Node service: publish, unpublish, expand, stats. |
//! | [`transport`] | Unix socket gRPC server and client. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod proto {
    tonic::include_proto!("csi.v1");
}

pub mod backend;
pub mod controller;
pub mod error;
pub mod exec;
pub mod identity;
pub mod iscsi;
pub mod mount;
pub mod node;
pub mod poll;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::{Backend, BackendFactory, IscsiSecrets};
pub use controller::ControllerService;
pub use error::CsiError;
pub use exec::{Executor, HostExecutor};
pub use identity::IdentityService;
pub use iscsi::{SessionManager, SysfsRegistry};
pub use mount::{LinuxMounter, Mounter};
pub use node::{NodeService, NodeSettings};
pub use transport::{CsiClient, Role};
pub use types::*;
