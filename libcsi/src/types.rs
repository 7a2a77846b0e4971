//! Driver constants, request-field keys, and the request validation shared by
//! the controller and node services.

use thiserror::Error;

use crate::proto::volume_capability::access_mode::Mode;
use crate::proto::volume_capability::AccessType;
use crate::proto::{CapacityRange, VolumeCapability};

// ---------------------------------------------------------------------------
// Plugin identity
// ---------------------------------------------------------------------------

/// Name reported by `GetPluginInfo`; storage classes refer to it as their
/// provisioner.
pub const PLUGIN_NAME: &str = "truenas.csi.choffmeister.de";

pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Volume sizing
// ---------------------------------------------------------------------------

/// Size used when the request carries no capacity range (1 GiB).
pub const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// Smallest volume the driver provisions (1 MiB).
pub const MIN_VOLUME_SIZE: i64 = 1024 * 1024;

/// Filesystem created on fresh iSCSI volumes unless configured otherwise.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Filesystems the node knows how to create and grow.
pub const SUPPORTED_FS_TYPES: &[&str] = &["ext4", "ext3", "xfs"];

// ---------------------------------------------------------------------------
// Request keys
// ---------------------------------------------------------------------------

/// Keys of the per-call `secrets` map.
pub mod secret_keys {
    pub const TRUENAS_URL: &str = "truenas-url";
    pub const TRUENAS_API_KEY: &str = "truenas-api-key";
    pub const TRUENAS_TLS_SKIP_VERIFY: &str = "truenas-tls-skip-verify";
    pub const TRUENAS_PARENT_DATASET: &str = "truenas-parent-dataset";
    pub const TRUENAS_DELETE_ISCSI_OBJECTS: &str = "truenas-delete-iscsi-objects";

    pub const ISCSI_BASE_IQN: &str = "iscsi-base-iqn";
    pub const ISCSI_PORTAL_IP: &str = "iscsi-portal-ip";
    pub const ISCSI_PORTAL_PORT: &str = "iscsi-portal-port";
    pub const ISCSI_PORTAL_ID: &str = "iscsi-portal-id";
    pub const ISCSI_INITIATOR_ID: &str = "iscsi-initiator-id";

    pub const CIFS_IP: &str = "cifs-ip";
    pub const CIFS_USERNAME: &str = "cifs-username";
    pub const CIFS_PASSWORD: &str = "cifs-password";
}

/// Keys of the `volume_context` map, either set by this driver on create or
/// injected by the kubelet on publish.
pub mod context_keys {
    pub const ISCSI_IQN: &str = "iscsi-iqn";

    pub const EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";
    pub const POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
    pub const POD_NAME: &str = "csi.storage.k8s.io/pod.name";

    pub const CIFS_SHARE: &str = "cifs-share";
    pub const CIFS_UID: &str = "cifs-uid";
    pub const CIFS_GID: &str = "cifs-gid";
}

// ---------------------------------------------------------------------------
// Capacity range
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("required bytes must not be negative, got {0}")]
    NegativeRequired(i64),

    #[error("limit bytes must not be negative, got {0}")]
    NegativeLimit(i64),

    #[error("required bytes {required} exceed limit bytes {limit}")]
    RequiredExceedsLimit { required: i64, limit: i64 },
}

/// Resolves the size to provision from an optional capacity range.
///
/// Returns `(size, limit)` where a `limit` of `0` means unbounded.
///
/// - no range, or `required_bytes == 0` → [`DEFAULT_VOLUME_SIZE`]
/// - `required_bytes` below [`MIN_VOLUME_SIZE`] → clamped up to the minimum
/// - negative bounds, or a size above a nonzero limit → [`CapacityError`]
pub fn volume_size_from_capacity_range(
    range: Option<&CapacityRange>,
) -> Result<(i64, i64), CapacityError> {
    let Some(range) = range else {
        return Ok((DEFAULT_VOLUME_SIZE, 0));
    };

    let size = match range.required_bytes {
        0 => DEFAULT_VOLUME_SIZE,
        r if r < 0 => return Err(CapacityError::NegativeRequired(r)),
        r => r.max(MIN_VOLUME_SIZE),
    };

    let limit = range.limit_bytes;
    if limit < 0 {
        return Err(CapacityError::NegativeLimit(limit));
    }
    if limit != 0 && size > limit {
        return Err(CapacityError::RequiredExceedsLimit {
            required: size,
            limit,
        });
    }

    Ok((size, limit))
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Only single-node-writer filesystem volumes are served; block access and
/// shared access modes are rejected.
pub fn is_capability_supported(capability: &VolumeCapability) -> bool {
    let Some(access_mode) = capability.access_mode.as_ref() else {
        return false;
    };
    if access_mode.mode() != Mode::SingleNodeWriter {
        return false;
    }
    !matches!(capability.access_type, Some(AccessType::Block(_)))
}
