//! CSI error types.
//!
//! Every service handler returns a [`CsiError`].  Lower layers keep their own
//! error enums ([`BackendError`], [`IscsiError`], [`MountError`]); the
//! protocol layer wraps them together with the action that failed and maps the
//! result onto a gRPC [`Status`] code at the service boundary.

use std::error::Error as StdError;

use thiserror::Error;
use tonic::{Code, Response, Status};
use tracing::{debug, error};

use crate::backend::BackendError;
use crate::iscsi::IscsiError;
use crate::mount::MountError;
use crate::types::CapacityError;

/// Unified error type for CSI request handling.
#[derive(Debug, Error)]
pub enum CsiError {
    /// The caller supplied a missing or invalid field.
    #[error("{0}")]
    InvalidArgument(String),

    /// The volume or path named in the request does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The requested capacity range cannot be satisfied.
    #[error("invalid capacity range")]
    OutOfRange(#[from] CapacityError),

    /// The RPC is intentionally not offered by this driver.
    #[error("not supported: {0}")]
    Unimplemented(&'static str),

    /// The storage appliance rejected or failed an operation.
    #[error("unable to {action}")]
    Backend {
        action: &'static str,
        #[source]
        source: BackendError,
    },

    /// An iSCSI session operation failed.
    #[error("unable to {action}")]
    Iscsi {
        action: &'static str,
        #[source]
        source: IscsiError,
    },

    /// A filesystem operation failed.
    #[error("unable to {action}")]
    Mount {
        action: &'static str,
        #[source]
        source: MountError,
    },

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Returns a closure wrapping a [`BackendError`] with `action`, for use
    /// with `map_err`.
    pub fn backend(action: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::Backend { action, source }
    }

    pub fn iscsi(action: &'static str) -> impl FnOnce(IscsiError) -> Self {
        move |source| Self::Iscsi { action, source }
    }

    pub fn mount(action: &'static str) -> impl FnOnce(MountError) -> Self {
        move |source| Self::Mount { action, source }
    }

    /// gRPC status code reported to the caller.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::OutOfRange(_) => Code::OutOfRange,
            Self::Unimplemented(_) => Code::Unimplemented,
            // Secrets come from the request, so a bad one is the caller's fault.
            Self::Backend { source, .. } if source.is_secrets() => Code::InvalidArgument,
            Self::Backend { .. } | Self::Iscsi { .. } | Self::Mount { .. } | Self::Internal(_) => {
                Code::Internal
            }
        }
    }
}

/// Renders an error followed by all of its sources, separated by `": "`.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        Status::new(err.code(), error_chain(&err))
    }
}

/// Finishes an RPC: logs the outcome under `method` and converts the result
/// for tonic.
pub(crate) fn respond<T>(
    method: &'static str,
    result: Result<T, CsiError>,
) -> Result<Response<T>, Status> {
    match result {
        Ok(response) => {
            debug!(method, "handled request");
            Ok(Response::new(response))
        }
        Err(err) => {
            let status = Status::from(err);
            error!(
                method,
                code = ?status.code(),
                error = %status.message(),
                "handling request failed"
            );
            Err(status)
        }
    }
}
