//! Canonical iSCSI device names.
//!
//! udev links every iSCSI LUN as
//! `/dev/disk/by-path/ip-<ip>:<port>-iscsi-<iqn>-lun-<lun>`.  That link is the
//! only record tying a mounted filesystem back to its session, so the node
//! derives the portal and target from it on unpublish and expand.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::IscsiError;

/// Directory udev populates with stable per-path device links.
pub const BY_PATH_DIR: &str = "/dev/disk/by-path";

/// LUN of every volume; each target exports exactly one extent.
pub const DEFAULT_LUN: u32 = 0;

static DEVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/dev/disk/by-path/ip-([^:]+):(\d+)-iscsi-(.+)-lun-(\d+)$")
        .unwrap_or_else(|e| panic!("device name pattern: {e}"))
});

/// Network address of an iSCSI portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Portal {
    pub ip: String,
    pub port: u16,
}

impl Portal {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decoded form of a by-path device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceName {
    pub portal: Portal,
    pub target: String,
    pub lun: u32,
}

/// Device path of LUN 0 of `target` reached through `portal`.
pub fn generate_device_name(portal: &Portal, target: &str) -> String {
    format!("{BY_PATH_DIR}/ip-{portal}-iscsi-{target}-lun-{DEFAULT_LUN}")
}

pub fn parse_device_name(device: &str) -> Result<DeviceName, IscsiError> {
    let invalid = || IscsiError::InvalidDevicePath(device.to_owned());
    let caps = DEVICE_NAME.captures(device).ok_or_else(invalid)?;

    let port = caps[2].parse().map_err(|_| invalid())?;
    let lun = caps[4].parse().map_err(|_| invalid())?;
    Ok(DeviceName {
        portal: Portal::new(&caps[1], port),
        target: caps[3].to_owned(),
        lun,
    })
}

/// Finds the iSCSI by-path link in `by_path_dir` that resolves to the same
/// block device as `device`, e.g. `/dev/sdc` as recorded in the mount table.
///
/// Returns the link in its canonical `/dev/disk/by-path/...` spelling so the
/// result always parses with [`parse_device_name`].
pub async fn find_by_path_link(
    by_path_dir: &Path,
    device: &Path,
) -> std::io::Result<Option<String>> {
    let wanted = tokio::fs::canonicalize(device).await?;

    let mut entries = match tokio::fs::read_dir(by_path_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let candidate = format!("{BY_PATH_DIR}/{file_name}");
        if !DEVICE_NAME.is_match(&candidate) {
            continue;
        }
        // Dangling links belong to sessions that are gone.
        let Ok(resolved) = tokio::fs::canonicalize(entry.path()).await else {
            continue;
        };
        if resolved == wanted {
            debug!(device = %device.display(), link = %candidate, "resolved by-path link");
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Whether `device` already is a by-path iSCSI name.
pub fn is_device_name(device: &str) -> bool {
    DEVICE_NAME.is_match(device)
}
