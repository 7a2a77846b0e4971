//! iSCSI session management.
//!
//! [`SessionManager`] drives `iscsiadm` to log in and out of targets and to
//! rescan them, resolves the SCSI host of a fresh session through a
//! [`SessionRegistry`], and triggers the LUN scan that makes the block device
//! appear.  Sessions, hosts and scan files are shared kernel state, so every
//! mutating call holds one manager-wide lock.

mod device;
mod registry;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub use self::device::{
    BY_PATH_DIR, DEFAULT_LUN, DeviceName, Portal, find_by_path_link, generate_device_name,
    is_device_name, parse_device_name,
};
pub use self::registry::{
    BoxedRegistry, MemoryRegistry, RegistryError, SessionRegistry, SysfsRegistry,
};
use crate::exec::{BoxedExecutor, ExecutionError};
use crate::poll::{PollPolicy, poll_until};

const ISCSIADM: &str = "iscsiadm";

/// `iscsiadm` exit status for "session already exists".
pub const EXIT_SESSION_EXISTS: i32 = 15;

/// `iscsiadm` exit status for "no matching session".
pub const EXIT_NO_SESSION: i32 = 21;

/// Host lookup after login: three retries, one second apart.
pub const HOST_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(3));

#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("iscsi discovery on portal {portal} failed")]
    Discovery {
        portal: Portal,
        #[source]
        source: ExecutionError,
    },

    #[error("iscsi login to {target} on portal {portal} failed")]
    Login {
        portal: Portal,
        target: String,
        #[source]
        source: ExecutionError,
    },

    #[error("iscsi logout from {target} on portal {portal} failed")]
    Logout {
        portal: Portal,
        target: String,
        #[source]
        source: ExecutionError,
    },

    #[error("iscsi rescan of {target} failed")]
    Rescan {
        target: String,
        #[source]
        source: ExecutionError,
    },

    #[error("no scsi host found for {target} on portal {portal} after logging in")]
    HostNotFound { portal: Portal, target: String },

    #[error("unable to read iscsi session registry")]
    Registry(#[from] RegistryError),

    #[error("unable to scan lun {lun} on scsi host {host}")]
    Scan {
        host: u32,
        lun: u32,
        #[source]
        source: RegistryError,
    },

    #[error("device name {0} is not a valid iscsi by-path device")]
    InvalidDevicePath(String),
}

/// Serialised access to local iSCSI sessions.
pub struct SessionManager {
    executor: BoxedExecutor,
    registry: BoxedRegistry,
    lock: Mutex<()>,
    host_poll: PollPolicy,
}

impl SessionManager {
    pub fn new(executor: BoxedExecutor, registry: BoxedRegistry) -> Self {
        Self {
            executor,
            registry,
            lock: Mutex::new(()),
            host_poll: HOST_POLL,
        }
    }

    /// Overrides how long to wait for the SCSI host of a new session.
    pub fn with_host_poll(mut self, policy: PollPolicy) -> Self {
        self.host_poll = policy;
        self
    }

    async fn iscsiadm(&self, args: &[&str]) -> Result<(), ExecutionError> {
        self.executor.execute(ISCSIADM, args).await.map(drop)
    }

    /// Logs into `target` on `portal` and scans LUN 0 on the resulting SCSI
    /// host, which is returned.  An existing session is reused.
    #[instrument(skip(self, portal), fields(portal = %portal))]
    pub async fn login(&self, portal: &Portal, target: &str) -> Result<u32, IscsiError> {
        let _guard = self.lock.lock().await;
        let address = portal.to_string();
        info!(target, "starting iscsi session");

        let discovery = ["-m", "discovery", "-t", "sendtargets", "-p", &address];
        if let Err(source) = self.iscsiadm(&discovery).await {
            let cleanup = [&discovery[..], &["-o", "delete"]].concat();
            if let Err(e) = self.iscsiadm(&cleanup).await {
                debug!(error = %e, "discovery record cleanup failed");
            }
            return Err(IscsiError::Discovery {
                portal: portal.clone(),
                source,
            });
        }

        let node = ["-m", "node", "-T", target, "-p", &address];
        match self.iscsiadm(&[&node[..], &["--login"]].concat()).await {
            Ok(()) => {}
            Err(e) if e.exit_code() == Some(EXIT_SESSION_EXISTS) => {
                warn!(target, "iscsi session already exists");
            }
            Err(source) => {
                let cleanup = [&node[..], &["-o", "delete"]].concat();
                if let Err(e) = self.iscsiadm(&cleanup).await {
                    debug!(error = %e, "node record cleanup failed");
                }
                return Err(IscsiError::Login {
                    portal: portal.clone(),
                    target: target.to_owned(),
                    source,
                });
            }
        }

        let host = self.host_number(portal, target).await?;
        self.registry
            .scan_lun(host, DEFAULT_LUN)
            .await
            .map_err(|source| IscsiError::Scan {
                host,
                lun: DEFAULT_LUN,
                source,
            })?;
        Ok(host)
    }

    /// Logs out of `target` on `portal`; a missing session is not an error.
    #[instrument(skip(self, portal), fields(portal = %portal))]
    pub async fn logout(&self, portal: &Portal, target: &str) -> Result<(), IscsiError> {
        let _guard = self.lock.lock().await;
        let address = portal.to_string();
        info!(target, "stopping iscsi session");

        match self
            .iscsiadm(&["-m", "node", "-T", target, "-p", &address, "--logout"])
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.exit_code() == Some(EXIT_NO_SESSION) => {
                warn!(target, "no iscsi session exists");
                Ok(())
            }
            Err(source) => Err(IscsiError::Logout {
                portal: portal.clone(),
                target: target.to_owned(),
                source,
            }),
        }
    }

    /// Rescans the existing session of `target`, picking up resized LUNs.
    #[instrument(skip(self))]
    pub async fn rescan(&self, target: &str) -> Result<(), IscsiError> {
        let _guard = self.lock.lock().await;
        info!(target, "rescanning iscsi session");

        self.iscsiadm(&["-m", "node", "--targetname", target, "-R"])
            .await
            .map_err(|source| IscsiError::Rescan {
                target: target.to_owned(),
                source,
            })
    }

    /// SCSI host of the session for `target` on `portal`, waiting for the
    /// kernel to publish it.
    pub async fn host_number(&self, portal: &Portal, target: &str) -> Result<u32, IscsiError> {
        let address = portal.to_string();
        let found = poll_until(self.host_poll, |attempt| {
            let address = &address;
            async move {
                let map = self.registry.portal_host_map(target).await?;
                debug!(attempt, target, portal = %address, "looking up scsi host");
                Ok::<_, RegistryError>(map.get(address).copied())
            }
        })
        .await?;

        found.ok_or_else(|| IscsiError::HostNotFound {
            portal: portal.clone(),
            target: target.to_owned(),
        })
    }
}
