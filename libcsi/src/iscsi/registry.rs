//! Readers of the kernel's iSCSI session table.
//!
//! After a login the kernel assigns the session a SCSI host.  The driver finds
//! that host by walking sysfs:
//!
//! ```text
//! class/iscsi_host/host<H>/device/session<S>/
//!     iscsi_session/session<S>/targetname
//!     connection<S>:<C>/iscsi_connection/connection<S>:<C>/
//!         address  port  persistent_address  persistent_port
//! ```
//!
//! and then asks the host to scan for the LUN through
//! `class/scsi_host/host<H>/scan`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unable to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no data written to {}", path.display())]
    ShortWrite { path: PathBuf },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read access to live iSCSI sessions plus the LUN scan trigger.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Maps every portal (`ip:port`) logged into `target` to its SCSI host
    /// number.  Both the live and the persistent portal of each connection are
    /// listed.  No sessions at all is an empty map, not an error.
    async fn portal_host_map(&self, target: &str) -> Result<HashMap<String, u32>, RegistryError>;

    /// Asks SCSI host `host` to probe channel 0, target 0, `lun`.
    async fn scan_lun(&self, host: u32, lun: u32) -> Result<(), RegistryError>;
}

pub type BoxedRegistry = Arc<dyn SessionRegistry>;

/// [`SessionRegistry`] backed by a sysfs mount.
#[derive(Debug, Clone)]
pub struct SysfsRegistry {
    root: PathBuf,
}

impl SysfsRegistry {
    /// `root` is usually `/sys`; containers often see the host's sysfs
    /// elsewhere.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_trimmed(path: &Path) -> std::io::Result<String> {
        Ok(tokio::fs::read_to_string(path).await?.trim().to_owned())
    }

    /// Entry names in `dir` starting with `prefix`, sorted.
    async fn children(dir: &Path, prefix: &str) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Live and persistent portal of one connection directory.
    async fn connection_portals(connection: &Path) -> std::io::Result<[String; 2]> {
        let address = Self::read_trimmed(&connection.join("address")).await?;
        let port = Self::read_trimmed(&connection.join("port")).await?;
        let persistent_address = Self::read_trimmed(&connection.join("persistent_address")).await?;
        let persistent_port = Self::read_trimmed(&connection.join("persistent_port")).await?;
        Ok([
            format!("{address}:{port}"),
            format!("{persistent_address}:{persistent_port}"),
        ])
    }

    async fn collect_session(
        session_path: &Path,
        session: &str,
        target: &str,
        host: u32,
        map: &mut HashMap<String, u32>,
    ) {
        let targetname = session_path
            .join("iscsi_session")
            .join(session)
            .join("targetname");
        match Self::read_trimmed(&targetname).await {
            Ok(name) if name == target => {}
            Ok(_) => return,
            Err(e) => {
                info!(session, error = %e, "skipping unavailable iscsi session");
                return;
            }
        }

        let connections = match Self::children(session_path, "connection").await {
            Ok(connections) => connections,
            Err(e) => {
                info!(session, error = %e, "skipping unavailable iscsi session");
                return;
            }
        };
        for connection in connections {
            let dir = session_path
                .join(&connection)
                .join("iscsi_connection")
                .join(&connection);
            match Self::connection_portals(&dir).await {
                Ok(portals) => {
                    for portal in portals {
                        map.insert(portal, host);
                    }
                }
                Err(e) => info!(%connection, error = %e, "skipping unavailable iscsi connection"),
            }
        }
    }
}

#[async_trait]
impl SessionRegistry for SysfsRegistry {
    async fn portal_host_map(&self, target: &str) -> Result<HashMap<String, u32>, RegistryError> {
        let mut map = HashMap::new();

        let hosts_dir = self.root.join("class").join("iscsi_host");
        let hosts = match Self::children(&hosts_dir, "host").await {
            Ok(hosts) => hosts,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(map),
            Err(e) => return Err(io_error(&hosts_dir)(e)),
        };

        for host_name in hosts {
            let Ok(host) = host_name.trim_start_matches("host").parse::<u32>() else {
                error!(host = %host_name, "could not get number from iscsi host");
                continue;
            };

            let device_dir = hosts_dir.join(&host_name).join("device");
            let sessions = Self::children(&device_dir, "session")
                .await
                .map_err(io_error(&device_dir))?;
            for session in sessions {
                let session_path = device_dir.join(&session);
                Self::collect_session(&session_path, &session, target, host, &mut map).await;
            }
        }

        debug!(target, portals = ?map, "iscsi portal host map");
        Ok(map)
    }

    async fn scan_lun(&self, host: u32, lun: u32) -> Result<(), RegistryError> {
        let path = self
            .root
            .join("class")
            .join("scsi_host")
            .join(format!("host{host}"))
            .join("scan");
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(io_error(&path))?;

        // Channel and target id are always 0 for iSCSI.
        let directive = format!("0 0 {lun}");
        let written = file
            .write(directive.as_bytes())
            .await
            .map_err(io_error(&path))?;
        if written == 0 {
            return Err(RegistryError::ShortWrite { path });
        }
        file.flush().await.map_err(io_error(&path))?;

        info!(host, lun, "scanned scsi host");
        Ok(())
    }
}

/// In-memory [`SessionRegistry`] for tests.
///
/// Sessions are registered explicitly (typically from a fake `iscsiadm
/// --login` handler) and can be kept invisible for a number of lookups to
/// mimic the kernel populating sysfs after the login returned.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    sessions: Mutex<HashMap<String, HashMap<String, u32>>>,
    hidden_lookups: AtomicU32,
    lookups: AtomicU32,
    scans: Mutex<Vec<(u32, u32)>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a session of `target` on `portal` owned by SCSI host `host`.
    pub fn add_session(&self, target: &str, portal: &str, host: u32) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(target.to_owned())
            .or_default()
            .insert(portal.to_owned(), host);
    }

    pub fn remove_sessions(&self, target: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target);
    }

    /// The next `count` lookups see no sessions at all.
    pub fn hide_for(&self, count: u32) {
        self.hidden_lookups.store(count, Ordering::SeqCst);
    }

    /// Number of `portal_host_map` calls so far.
    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// `(host, lun)` of every scan requested so far.
    pub fn scans(&self) -> Vec<(u32, u32)> {
        self.scans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn as_registry(self: Arc<Self>) -> BoxedRegistry {
        self
    }
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn portal_host_map(&self, target: &str) -> Result<HashMap<String, u32>, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let hidden = self
            .hidden_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(HashMap::new());
        }
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    async fn scan_lun(&self, host: u32, lun: u32) -> Result<(), RegistryError> {
        self.scans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((host, lun));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "iqn.2005-10.org.freenas.ctl:pvc-1";

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// Lays out one host/session/connection in a fake sysfs tree.
    fn add_session(
        root: &Path,
        host: u32,
        session: u32,
        target: &str,
        live: (&str, &str),
        persistent: (&str, &str),
    ) {
        let session_dir = root
            .join("class/iscsi_host")
            .join(format!("host{host}"))
            .join("device")
            .join(format!("session{session}"));
        write(
            &session_dir
                .join("iscsi_session")
                .join(format!("session{session}"))
                .join("targetname"),
            &format!("{target}\n"),
        );
        let connection = format!("connection{session}:0");
        let conn_dir = session_dir
            .join(&connection)
            .join("iscsi_connection")
            .join(&connection);
        write(&conn_dir.join("address"), &format!("{}\n", live.0));
        write(&conn_dir.join("port"), &format!("{}\n", live.1));
        write(&conn_dir.join("persistent_address"), &format!("{}\n", persistent.0));
        write(&conn_dir.join("persistent_port"), &format!("{}\n", persistent.1));
    }

    #[tokio::test]
    async fn maps_live_and_persistent_portals() {
        let root = tempfile::tempdir().unwrap();
        add_session(
            root.path(),
            3,
            1,
            TARGET,
            ("192.168.30.8", "3260"),
            ("192.168.30.7", "3260"),
        );
        add_session(
            root.path(),
            4,
            2,
            "iqn.2005-10.org.freenas.ctl:other",
            ("192.168.30.9", "3260"),
            ("192.168.30.9", "3260"),
        );

        let registry = SysfsRegistry::new(root.path());
        let map = registry.portal_host_map(TARGET).await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("192.168.30.8:3260"), Some(&3));
        assert_eq!(map.get("192.168.30.7:3260"), Some(&3));
    }

    #[tokio::test]
    async fn missing_registry_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let registry = SysfsRegistry::new(root.path());
        assert!(registry.portal_host_map(TARGET).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incomplete_sessions_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        add_session(root.path(), 2, 1, TARGET, ("10.0.0.5", "3260"), ("10.0.0.5", "3260"));
        // session without a target name, and a host dir that is not numbered
        let orphan = root.path().join("class/iscsi_host/host5/device/session9");
        std::fs::create_dir_all(orphan).unwrap();
        std::fs::create_dir_all(root.path().join("class/iscsi_host/hostX/device")).unwrap();

        let registry = SysfsRegistry::new(root.path());
        let map = registry.portal_host_map(TARGET).await.unwrap();
        assert_eq!(map, HashMap::from([("10.0.0.5:3260".to_owned(), 2)]));
    }

    #[tokio::test]
    async fn scan_writes_directive() {
        let root = tempfile::tempdir().unwrap();
        let scan = root.path().join("class/scsi_host/host3/scan");
        write(&scan, "");

        let registry = SysfsRegistry::new(root.path());
        registry.scan_lun(3, 0).await.unwrap();
        assert_eq!(std::fs::read_to_string(&scan).unwrap(), "0 0 0");

        let err = registry.scan_lun(7, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }

    #[tokio::test]
    async fn memory_registry_hides_sessions() {
        let registry = MemoryRegistry::new();
        registry.add_session(TARGET, "10.0.0.5:3260", 6);
        registry.hide_for(2);

        assert!(registry.portal_host_map(TARGET).await.unwrap().is_empty());
        assert!(registry.portal_host_map(TARGET).await.unwrap().is_empty());
        let map = registry.portal_host_map(TARGET).await.unwrap();
        assert_eq!(map.get("10.0.0.5:3260"), Some(&6));
        assert_eq!(registry.lookups(), 3);
    }
}
