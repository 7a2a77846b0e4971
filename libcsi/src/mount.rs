//! Filesystem service used by the node.
//!
//! [`Mounter`] is the contract the node service needs: format-and-mount a
//! block device, mount a network share, unmount, map a mount point back to
//! its device, grow a mounted filesystem and report usage.  [`LinuxMounter`]
//! implements it with the usual userland tools driven through an
//! [`Executor`](crate::exec::Executor).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::exec::{BoxedExecutor, ExecutionError};

/// Mount table of the calling process.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// `blkid -p` exit status when the device carries no recognised signature.
const BLKID_NOTHING_FOUND: i32 = 2;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("unable to create mount target {}", path.display())]
    CreateTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read mount table {}", path.display())]
    MountTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to inspect filesystem on {device}")]
    Inspect {
        device: String,
        #[source]
        source: ExecutionError,
    },

    #[error("refusing to format {device}: it carries a {pttype} partition table")]
    Partitioned { device: String, pttype: String },

    #[error("unsupported filesystem type {0}")]
    UnsupportedFs(String),

    #[error("unable to format {device} as {fs_type}")]
    Format {
        device: String,
        fs_type: String,
        #[source]
        source: ExecutionError,
    },

    #[error("unable to mount {device} at {}", target.display())]
    Mount {
        device: String,
        target: PathBuf,
        #[source]
        source: ExecutionError,
    },

    #[error("unable to unmount {}", target.display())]
    Unmount {
        target: PathBuf,
        #[source]
        source: ExecutionError,
    },

    #[error("unable to resize {fs_type} filesystem on {device}")]
    Resize {
        device: String,
        fs_type: String,
        #[source]
        source: ExecutionError,
    },

    #[error("unable to stat filesystem at {}", path.display())]
    Stats {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// Byte and inode usage of a mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStats {
    pub bytes_total: u64,
    pub bytes_used: u64,
    pub bytes_available: u64,
    pub inodes_total: u64,
    pub inodes_used: u64,
    pub inodes_free: u64,
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mounts `device` at `target`, creating a `fs_type` filesystem first if
    /// the device is blank.  An existing filesystem is never reformatted.
    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
    ) -> Result<(), MountError>;

    /// Mounts `source` (a device or a network share) at `target` as is.
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmounts `target`; a path that is not mounted is left alone.
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Source recorded in the mount table for `target`, if mounted.
    async fn device_for_mount(&self, target: &Path) -> Result<Option<String>, MountError>;

    /// Grows the filesystem on `device`, mounted at `target`, to fill the device.
    async fn resize(&self, device: &str, target: &Path) -> Result<(), MountError>;

    /// Whether `device` exists yet.
    async fn device_ready(&self, device: &str) -> bool;

    async fn usage(&self, path: &Path) -> Result<VolumeStats, MountError>;
}

pub type BoxedMounter = Arc<dyn Mounter>;

/// One parsed line of a mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
}

/// Parses `/proc/self/mounts` content.
///
/// Fields are octal-escaped by the kernel (`\040` for a space).
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: unescape(fields.next()?),
                fs_type: unescape(fields.next()?),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let value = field
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Filesystem tools supported for creation and online growth.
fn mkfs_args(fs_type: &str) -> Option<&'static [&'static str]> {
    match fs_type {
        "ext4" | "ext3" => Some(&["-F", "-m0"][..]),
        "xfs" => Some(&[][..]),
        _ => None,
    }
}

/// [`Mounter`] for Linux hosts.
pub struct LinuxMounter {
    executor: BoxedExecutor,
    mounts_file: PathBuf,
}

impl LinuxMounter {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self {
            executor,
            mounts_file: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Reads mounts from `path` instead of [`PROC_MOUNTS`].
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    async fn mount_table(&self) -> Result<Vec<MountEntry>, MountError> {
        let contents = tokio::fs::read_to_string(&self.mounts_file)
            .await
            .map_err(|source| MountError::MountTable {
                path: self.mounts_file.clone(),
                source,
            })?;
        Ok(parse_mount_table(&contents))
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(self.device_for_mount(target).await?.is_some())
    }

    async fn create_target(target: &Path) -> Result<(), MountError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true).mode(0o775);
        builder
            .create(target)
            .await
            .map_err(|source| MountError::CreateTarget {
                path: target.to_path_buf(),
                source,
            })
    }

    /// Filesystem and partition-table signatures found on `device`.
    async fn inspect(&self, device: &str) -> Result<(Option<String>, Option<String>), MountError> {
        let output = match self
            .executor
            .execute(
                "blkid",
                &["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device],
            )
            .await
        {
            Ok(output) => output.output,
            Err(e) if e.exit_code() == Some(BLKID_NOTHING_FOUND) => return Ok((None, None)),
            Err(source) => {
                return Err(MountError::Inspect {
                    device: device.to_owned(),
                    source,
                });
            }
        };

        let mut fs_type = None;
        let mut pttype = None;
        for line in output.lines() {
            if let Some(value) = line.strip_prefix("TYPE=") {
                fs_type = Some(value.trim().to_owned());
            } else if let Some(value) = line.strip_prefix("PTTYPE=") {
                pttype = Some(value.trim().to_owned());
            }
        }
        Ok((fs_type, pttype))
    }

    async fn run_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let target_str = target.to_string_lossy();
        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, &*target_str]);

        self.executor
            .execute("mount", &args)
            .await
            .map_err(|e| MountError::Mount {
                device: source.to_owned(),
                target: target.to_path_buf(),
                source: e,
            })?;
        Ok(())
    }
}

#[async_trait]
impl Mounter for LinuxMounter {
    #[instrument(skip(self, target), fields(target = %target.display()))]
    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
    ) -> Result<(), MountError> {
        Self::create_target(target).await?;
        if self.is_mounted(target).await? {
            info!("target already mounted");
            return Ok(());
        }

        let mount_type = match self.inspect(device).await? {
            (Some(existing), _) => {
                if existing != fs_type {
                    warn!(%existing, requested = fs_type, "keeping existing filesystem");
                }
                existing
            }
            (None, Some(pttype)) => {
                return Err(MountError::Partitioned {
                    device: device.to_owned(),
                    pttype,
                });
            }
            (None, None) => {
                let args = mkfs_args(fs_type)
                    .ok_or_else(|| MountError::UnsupportedFs(fs_type.to_owned()))?;
                let mut argv = args.to_vec();
                argv.push(device);
                info!(fs_type, "formatting device");
                self.executor
                    .execute(&format!("mkfs.{fs_type}"), &argv)
                    .await
                    .map_err(|source| MountError::Format {
                        device: device.to_owned(),
                        fs_type: fs_type.to_owned(),
                        source,
                    })?;
                fs_type.to_owned()
            }
        };

        self.run_mount(device, target, &mount_type, &["defaults".to_owned()])
            .await?;
        info!(fs_type = %mount_type, "mounted device");
        Ok(())
    }

    #[instrument(skip(self, target, options), fields(target = %target.display()))]
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        Self::create_target(target).await?;
        if self.is_mounted(target).await? {
            info!("target already mounted");
            return Ok(());
        }
        self.run_mount(source, target, fs_type, options).await?;
        info!("mounted");
        Ok(())
    }

    #[instrument(skip(self, target), fields(target = %target.display()))]
    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if !self.is_mounted(target).await? {
            debug!("target not mounted");
            return Ok(());
        }
        let target_str = target.to_string_lossy();
        self.executor
            .execute("umount", &[&*target_str])
            .await
            .map_err(|source| MountError::Unmount {
                target: target.to_path_buf(),
                source,
            })?;
        info!("unmounted");
        Ok(())
    }

    async fn device_for_mount(&self, target: &Path) -> Result<Option<String>, MountError> {
        let target = target.to_string_lossy();
        let target = target.trim_end_matches('/');
        // The last entry wins when mounts are stacked on the same path.
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .rev()
            .find(|entry| entry.target.trim_end_matches('/') == target)
            .map(|entry| entry.source))
    }

    #[instrument(skip(self, target), fields(target = %target.display()))]
    async fn resize(&self, device: &str, target: &Path) -> Result<(), MountError> {
        let fs_type = match self.inspect(device).await? {
            (Some(fs_type), _) => fs_type,
            _ => return Err(MountError::UnsupportedFs("none".to_owned())),
        };
        let target_str = target.to_string_lossy();
        let (program, arg) = match fs_type.as_str() {
            "ext4" | "ext3" | "ext2" => ("resize2fs", device),
            "xfs" => ("xfs_growfs", &*target_str),
            other => return Err(MountError::UnsupportedFs(other.to_owned())),
        };

        self.executor
            .execute(program, &[arg])
            .await
            .map_err(|source| MountError::Resize {
                device: device.to_owned(),
                fs_type: fs_type.clone(),
                source,
            })?;
        info!(%fs_type, "resized filesystem");
        Ok(())
    }

    async fn device_ready(&self, device: &str) -> bool {
        tokio::fs::metadata(device).await.is_ok()
    }

    async fn usage(&self, path: &Path) -> Result<VolumeStats, MountError> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|source| MountError::Stats {
            path: path.to_path_buf(),
            source,
        })?;

        let fragment = stat.fragment_size() as u64;
        let blocks = stat.blocks() as u64;
        let files = stat.files() as u64;
        let files_free = stat.files_free() as u64;
        Ok(VolumeStats {
            bytes_total: blocks * fragment,
            bytes_used: blocks.saturating_sub(stat.blocks_free() as u64) * fragment,
            bytes_available: stat.blocks_available() as u64 * fragment,
            inodes_total: files,
            inodes_used: files.saturating_sub(files_free),
            inodes_free: files_free,
        })
    }
}

/// In-memory [`Mounter`] for tests.
///
/// Keeps its own mount table and set of present devices, and records every
/// mutating call as a single line in [`FakeMounter::operations`].
#[derive(Debug, Default)]
pub struct FakeMounter {
    mounts: Mutex<HashMap<PathBuf, MountEntry>>,
    devices: Mutex<HashSet<String>>,
    operations: Mutex<Vec<String>>,
    stats: Mutex<VolumeStats>,
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `device` visible to [`Mounter::device_ready`].
    pub fn add_device(&self, device: &str) {
        lock(&self.devices).insert(device.to_owned());
    }

    /// Records `source` as mounted at `target` without logging an operation.
    pub fn insert_mount(&self, source: &str, target: &Path, fs_type: &str) {
        lock(&self.mounts).insert(
            target.to_path_buf(),
            MountEntry {
                source: source.to_owned(),
                target: target.to_string_lossy().into_owned(),
                fs_type: fs_type.to_owned(),
            },
        );
    }

    pub fn set_stats(&self, stats: VolumeStats) {
        *lock(&self.stats) = stats;
    }

    pub fn mounted(&self, target: &Path) -> Option<MountEntry> {
        lock(&self.mounts).get(target).cloned()
    }

    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    pub fn as_mounter(self: Arc<Self>) -> BoxedMounter {
        self
    }

    fn record(&self, operation: String) {
        lock(&self.operations).push(operation);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
    ) -> Result<(), MountError> {
        if mkfs_args(fs_type).is_none() {
            return Err(MountError::UnsupportedFs(fs_type.to_owned()));
        }
        self.record(format!("format_and_mount {device} {} {fs_type}", target.display()));
        self.insert_mount(device, target, fs_type);
        Ok(())
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        self.record(format!(
            "mount {source} {} {fs_type} {}",
            target.display(),
            options.join(",")
        ));
        self.insert_mount(source, target, fs_type);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if lock(&self.mounts).remove(target).is_some() {
            self.record(format!("unmount {}", target.display()));
        }
        Ok(())
    }

    async fn device_for_mount(&self, target: &Path) -> Result<Option<String>, MountError> {
        Ok(self.mounted(target).map(|entry| entry.source))
    }

    async fn resize(&self, device: &str, target: &Path) -> Result<(), MountError> {
        self.record(format!("resize {device} {}", target.display()));
        Ok(())
    }

    async fn device_ready(&self, device: &str) -> bool {
        lock(&self.devices).contains(device)
    }

    async fn usage(&self, _path: &Path) -> Result<VolumeStats, MountError> {
        Ok(*lock(&self.stats))
    }
}
