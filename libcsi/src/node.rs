//! CSI Node service.
//!
//! Runs on every worker and makes volumes usable by pods:
//!
//! 1. **Publish** logs into the volume's iSCSI target, waits for the LUN to
//!    show up, then formats it if blank and mounts it at the pod's target
//!    path.  Ephemeral inline volumes mount a CIFS share instead.
//! 2. **Unpublish** unmounts and logs out of the session derived from the
//!    mounted device's by-path name.
//! 3. **Expand** rescans the session and grows the mounted filesystem.
//!
//! Staging is not used; every publish attaches the device directly.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use crate::backend::{BackendFactory, IscsiSecrets, required};
use crate::error::{CsiError, respond};
use crate::iscsi::{
    BY_PATH_DIR, DeviceName, IscsiError, SessionManager, find_by_path_link, generate_device_name,
    is_device_name, parse_device_name,
};
use crate::mount::{BoxedMounter, VolumeStats};
use crate::poll::{PollPolicy, poll_until};
use crate::proto::node_server::Node;
use crate::proto::node_service_capability::{self, rpc};
use crate::proto::volume_capability::AccessType;
use crate::proto::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, VolumeCapability, VolumeUsage,
    volume_usage,
};
use crate::types::{
    DEFAULT_FS_TYPE, SUPPORTED_FS_TYPES, context_keys, is_capability_supported, secret_keys,
    volume_size_from_capacity_range,
};

/// Wait for the by-path device after login: up to 10 s, checking every 200 ms.
pub const DEVICE_WAIT: PollPolicy =
    PollPolicy::new(Duration::from_millis(200), Duration::from_secs(10));

/// Node-local knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Filesystem created on blank volumes whose capability names none.
    pub fs_type: String,
    pub device_wait: PollPolicy,
    /// Where udev keeps by-path links, consulted when the mount table
    /// records a resolved `/dev/sdX` instead.
    pub by_path_dir: PathBuf,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            fs_type: DEFAULT_FS_TYPE.to_owned(),
            device_wait: DEVICE_WAIT,
            by_path_dir: PathBuf::from(BY_PATH_DIR),
        }
    }
}

#[derive(Clone)]
pub struct NodeService {
    node_id: String,
    backends: Arc<dyn BackendFactory>,
    sessions: Arc<SessionManager>,
    mounter: BoxedMounter,
    settings: NodeSettings,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        backends: Arc<dyn BackendFactory>,
        sessions: Arc<SessionManager>,
        mounter: BoxedMounter,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            backends,
            sessions,
            mounter,
            settings: NodeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("missing volume id"));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::invalid_argument("missing target path"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::invalid_argument("missing volume capability"))?;
        if !is_capability_supported(capability) {
            return Err(CsiError::invalid_argument("volume capability is not supported"));
        }

        let target = Path::new(&req.target_path);
        if context_value(&req.volume_context, context_keys::EPHEMERAL) == Some("true") {
            self.publish_share(&req, target).await?;
        } else {
            self.publish_iscsi(&req, capability, target).await?;
        }
        info!("volume published");
        Ok(NodePublishVolumeResponse {})
    }

    /// Mounts the CIFS share named by the request; no appliance or session
    /// involvement.
    async fn publish_share(
        &self,
        req: &NodePublishVolumeRequest,
        target: &Path,
    ) -> Result<(), CsiError> {
        let secret = |key: &'static str| {
            required(&req.secrets, key).map_err(|e| CsiError::invalid_argument(e.to_string()))
        };
        let ip = secret(secret_keys::CIFS_IP)?;
        let username = secret(secret_keys::CIFS_USERNAME)?;
        let password = secret(secret_keys::CIFS_PASSWORD)?;
        let share = context_value(&req.volume_context, context_keys::CIFS_SHARE).ok_or_else(|| {
            CsiError::invalid_argument(format!(
                "missing volume context {}",
                context_keys::CIFS_SHARE
            ))
        })?;

        let mut options = vec![format!("username={username}"), format!("password={password}")];
        if let Some(uid) = context_value(&req.volume_context, context_keys::CIFS_UID) {
            options.push(format!("uid={uid}"));
        }
        if let Some(gid) = context_value(&req.volume_context, context_keys::CIFS_GID) {
            options.push(format!("gid={gid}"));
        }

        let source = format!("//{ip}/{share}");
        info!(%source, "mounting cifs share");
        self.mounter
            .mount(&source, target, "cifs", &options)
            .await
            .map_err(CsiError::mount("mount cifs share"))
    }

    async fn publish_iscsi(
        &self,
        req: &NodePublishVolumeRequest,
        capability: &VolumeCapability,
        target: &Path,
    ) -> Result<(), CsiError> {
        let iqn = context_value(&req.volume_context, context_keys::ISCSI_IQN).ok_or_else(|| {
            CsiError::invalid_argument(format!(
                "missing volume context {}",
                context_keys::ISCSI_IQN
            ))
        })?;
        let fs_type = self.fs_type(capability)?;
        let iscsi = IscsiSecrets::from_secrets(&req.secrets)
            .map_err(|e| CsiError::backend("load iscsi secrets")(e.into()))?;

        let namespace = context_value(&req.volume_context, context_keys::POD_NAMESPACE);
        let pod = context_value(&req.volume_context, context_keys::POD_NAME);
        if let (Some(namespace), Some(pod)) = (namespace, pod) {
            let backend = self
                .backends
                .from_secrets(&req.secrets)
                .map_err(CsiError::backend("load backend"))?;
            backend
                .comment_volume(&req.volume_id, &format!("{namespace}/{pod}"))
                .await
                .map_err(CsiError::backend("set volume comment"))?;
        }

        let portal = iscsi.portal();
        self.sessions
            .login(&portal, iqn)
            .await
            .map_err(CsiError::iscsi("log into iscsi session"))?;

        let device = generate_device_name(&portal, iqn);
        self.wait_for_device(&device).await?;

        self.mounter
            .format_and_mount(&device, target, fs_type)
            .await
            .map_err(CsiError::mount("mount device"))
    }

    /// Filesystem requested by the capability, or the node default.
    fn fs_type<'a>(&'a self, capability: &'a VolumeCapability) -> Result<&'a str, CsiError> {
        let requested = match &capability.access_type {
            Some(AccessType::Mount(mount)) if !mount.fs_type.is_empty() => mount.fs_type.as_str(),
            _ => self.settings.fs_type.as_str(),
        };
        if !SUPPORTED_FS_TYPES.contains(&requested) {
            return Err(CsiError::invalid_argument(format!(
                "unsupported filesystem type {requested}"
            )));
        }
        Ok(requested)
    }

    async fn wait_for_device(&self, device: &str) -> Result<(), CsiError> {
        let policy = self.settings.device_wait;
        let ready = poll_until(policy, |_| async move {
            Ok::<_, Infallible>(self.mounter.device_ready(device).await.then_some(()))
        })
        .await;
        match ready {
            Ok(Some(())) => Ok(()),
            Ok(None) | Err(_) => Err(CsiError::Internal(format!(
                "device {device} did not appear within {:?}",
                policy.timeout
            ))),
        }
    }

    /// Maps a mount source back to the iSCSI session behind it.
    async fn resolve_device(&self, device: &str) -> Result<DeviceName, CsiError> {
        let canonical = if is_device_name(device) {
            device.to_owned()
        } else {
            find_by_path_link(&self.settings.by_path_dir, Path::new(device))
                .await
                .map_err(|e| CsiError::Internal(format!("unable to resolve device {device}: {e}")))?
                .ok_or_else(|| {
                    CsiError::iscsi("detect iscsi device")(IscsiError::InvalidDevicePath(
                        device.to_owned(),
                    ))
                })?
        };
        parse_device_name(&canonical).map_err(CsiError::iscsi("detect iscsi device"))
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn unpublish(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("missing volume id"));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::invalid_argument("missing target path"));
        }
        let target = Path::new(&req.target_path);

        let Some(device) = self
            .mounter
            .device_for_mount(target)
            .await
            .map_err(CsiError::mount("detect device of mount point"))?
        else {
            info!("target path not mounted, nothing to unpublish");
            return Ok(NodeUnpublishVolumeResponse {});
        };

        // Resolve the session while the mount still records the device, so a
        // failed lookup can be retried.
        let session = if device.starts_with("//") {
            None
        } else {
            Some(self.resolve_device(&device).await?)
        };

        self.mounter
            .unmount(target)
            .await
            .map_err(CsiError::mount("unmount device"))?;
        let Some(name) = session else {
            info!(share = %device, "cifs share unmounted");
            return Ok(NodeUnpublishVolumeResponse {});
        };

        self.sessions
            .logout(&name.portal, &name.target)
            .await
            .map_err(CsiError::iscsi("log out of iscsi session"))?;
        info!("volume unpublished");
        Ok(NodeUnpublishVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, path = %req.volume_path))]
    async fn expand(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        if req.volume_path.is_empty() {
            return Err(CsiError::invalid_argument("missing volume path"));
        }
        let (size, _) = volume_size_from_capacity_range(req.capacity_range.as_ref())?;
        let path = Path::new(&req.volume_path);

        let device = self
            .mounter
            .device_for_mount(path)
            .await
            .map_err(CsiError::mount("detect device of mount point"))?
            .ok_or_else(|| CsiError::NotFound(format!("{} is not mounted", req.volume_path)))?;
        let name = self.resolve_device(&device).await?;

        self.sessions
            .rescan(&name.target)
            .await
            .map_err(CsiError::iscsi("rescan iscsi target"))?;
        self.mounter
            .resize(&device, path)
            .await
            .map_err(CsiError::mount("resize device file system"))?;
        info!(size, "volume expanded");
        Ok(NodeExpandVolumeResponse { capacity_bytes: size })
    }

    async fn stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, CsiError> {
        if req.volume_path.is_empty() {
            return Err(CsiError::invalid_argument("missing volume path"));
        }
        let path = Path::new(&req.volume_path);
        if matches!(tokio::fs::try_exists(path).await, Ok(false)) {
            return Err(CsiError::NotFound(format!("{} does not exist", req.volume_path)));
        }
        let stats = self
            .mounter
            .usage(path)
            .await
            .map_err(CsiError::mount("get volume stats"))?;
        Ok(NodeGetVolumeStatsResponse {
            usage: usage(&stats)?,
            volume_condition: None,
        })
    }

    fn capabilities() -> Vec<NodeServiceCapability> {
        [rpc::Type::ExpandVolume, rpc::Type::GetVolumeStats]
            .into_iter()
            .map(|kind| NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(node_service_capability::Rpc {
                    r#type: kind as i32,
                })),
            })
            .collect()
    }
}

fn context_value<'a>(context: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    context
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn usage(stats: &VolumeStats) -> Result<Vec<VolumeUsage>, CsiError> {
    let int = |value: u64| {
        i64::try_from(value)
            .map_err(|_| CsiError::Internal(format!("usage value {value} overflows")))
    };
    Ok(vec![
        VolumeUsage {
            available: int(stats.bytes_available)?,
            total: int(stats.bytes_total)?,
            used: int(stats.bytes_used)?,
            unit: volume_usage::Unit::Bytes as i32,
        },
        VolumeUsage {
            available: int(stats.inodes_free)?,
            total: int(stats.inodes_total)?,
            used: int(stats.inodes_used)?,
            unit: volume_usage::Unit::Inodes as i32,
        },
    ])
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        respond("NodeStageVolume", Err(CsiError::Unimplemented("NodeStageVolume")))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        respond("NodeUnstageVolume", Err(CsiError::Unimplemented("NodeUnstageVolume")))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        respond("NodePublishVolume", self.publish(request.into_inner()).await)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        respond("NodeUnpublishVolume", self.unpublish(request.into_inner()).await)
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        respond("NodeGetVolumeStats", self.stats(request.into_inner()).await)
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        respond("NodeExpandVolume", self.expand(request.into_inner()).await)
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        respond(
            "NodeGetCapabilities",
            Ok(NodeGetCapabilitiesResponse {
                capabilities: Self::capabilities(),
            }),
        )
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        respond(
            "NodeGetInfo",
            Ok(NodeGetInfoResponse {
                node_id: self.node_id.clone(),
                ..Default::default()
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;
    use crate::backend::truenas::TruenasBackendFactory;
    use crate::exec::FakeExecutor;
    use crate::iscsi::{MemoryRegistry, Portal};
    use crate::mount::FakeMounter;
    use crate::proto::volume_capability::access_mode::Mode;
    use crate::proto::volume_capability::{AccessMode, MountVolume};

    const IQN: &str = "iqn.2005-10.org.freenas.ctl:pvc-1";

    struct Fixture {
        exec: Arc<FakeExecutor>,
        mounter: Arc<FakeMounter>,
        node: NodeService,
    }

    fn fixture() -> Fixture {
        let exec = FakeExecutor::new();
        let mounter = FakeMounter::new();
        let sessions = SessionManager::new(
            Arc::clone(&exec).as_executor(),
            MemoryRegistry::new().as_registry(),
        );
        let node = NodeService::new(
            "worker-1",
            Arc::new(TruenasBackendFactory),
            Arc::new(sessions),
            Arc::clone(&mounter).as_mounter(),
        )
        .with_settings(NodeSettings {
            device_wait: PollPolicy::new(Duration::from_millis(1), Duration::from_millis(3)),
            ..NodeSettings::default()
        });
        Fixture { exec, mounter, node }
    }

    fn capability(fs_type: &str) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.to_owned(),
                ..Default::default()
            })),
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn share_request() -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "csi-inline-1".to_owned(),
            target_path: "/var/lib/kubelet/pods/p/volumes/share".to_owned(),
            volume_capability: Some(capability("")),
            secrets: map(&[
                ("cifs-ip", "10.0.0.9"),
                ("cifs-username", "alice"),
                ("cifs-password", "s3cret"),
            ]),
            volume_context: map(&[
                ("csi.storage.k8s.io/ephemeral", "true"),
                ("cifs-share", "media"),
                ("cifs-uid", "1000"),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ephemeral_volume_mounts_cifs_share() {
        let f = fixture();
        f.node
            .node_publish_volume(Request::new(share_request()))
            .await
            .unwrap();

        assert_eq!(
            f.mounter.operations(),
            vec![
                "mount //10.0.0.9/media /var/lib/kubelet/pods/p/volumes/share cifs \
                 username=alice,password=s3cret,uid=1000"
            ]
        );
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn ephemeral_volume_requires_share_secrets() {
        let f = fixture();
        let mut req = share_request();
        req.secrets.remove("cifs-password");
        let status = f.node.node_publish_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "missing secret cifs-password");
    }

    #[tokio::test]
    async fn publish_validates_request() {
        let f = fixture();
        let mut req = share_request();
        req.volume_context.clear();
        req.volume_capability = Some(capability("btrfs"));
        req.volume_context.insert("iscsi-iqn".to_owned(), IQN.to_owned());
        let status = f.node.node_publish_volume(Request::new(req.clone())).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "unsupported filesystem type btrfs");

        req.volume_context.clear();
        req.volume_capability = Some(capability(""));
        let status = f.node.node_publish_volume(Request::new(req.clone())).await.unwrap_err();
        assert_eq!(status.message(), "missing volume context iscsi-iqn");

        req.volume_capability = None;
        let status = f.node.node_publish_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(status.message(), "missing volume capability");
        assert!(f.mounter.operations().is_empty());
    }

    #[tokio::test]
    async fn unpublish_of_unmounted_path_succeeds() {
        let f = fixture();
        f.node
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "tank/k8s/pvc-1".to_owned(),
                target_path: "/mnt/nothing".to_owned(),
            }))
            .await
            .unwrap();
        assert!(f.exec.calls().is_empty());
        assert!(f.mounter.operations().is_empty());
    }

    #[tokio::test]
    async fn unpublish_of_share_skips_logout() {
        let f = fixture();
        let target = Path::new("/mnt/share");
        f.mounter.insert_mount("//10.0.0.9/media", target, "cifs");
        f.node
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "csi-inline-1".to_owned(),
                target_path: "/mnt/share".to_owned(),
            }))
            .await
            .unwrap();
        assert_eq!(f.mounter.operations(), vec!["unmount /mnt/share"]);
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn unpublish_logs_out_of_mounted_session() {
        let f = fixture();
        let device = generate_device_name(&Portal::new("10.0.0.5", 3260), IQN);
        f.mounter.insert_mount(&device, Path::new("/mnt/vol"), "ext4");
        f.node
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "tank/k8s/pvc-1".to_owned(),
                target_path: "/mnt/vol".to_owned(),
            }))
            .await
            .unwrap();
        assert_eq!(
            f.exec.command_lines(),
            vec![format!("iscsiadm -m node -T {IQN} -p 10.0.0.5:3260 --logout")]
        );
    }

    #[tokio::test]
    async fn unresolvable_device_stays_mounted() {
        let f = fixture();
        let target = Path::new("/mnt/vol");
        f.mounter.insert_mount("/dev/sdzz-missing", target, "ext4");
        let request = || {
            Request::new(NodeUnpublishVolumeRequest {
                volume_id: "tank/k8s/pvc-1".to_owned(),
                target_path: "/mnt/vol".to_owned(),
            })
        };

        for _ in 0..2 {
            let status = f.node.node_unpublish_volume(request()).await.unwrap_err();
            assert_eq!(status.code(), Code::Internal);
            assert_eq!(f.mounter.mounted(target).unwrap().source, "/dev/sdzz-missing");
        }
        assert!(f.mounter.operations().is_empty());
        assert!(f.exec.command_lines().is_empty());
    }

    #[tokio::test]
    async fn expand_of_unmounted_path_is_not_found() {
        let f = fixture();
        let status = f
            .node
            .node_expand_volume(Request::new(NodeExpandVolumeRequest {
                volume_id: "tank/k8s/pvc-1".to_owned(),
                volume_path: "/mnt/vol".to_owned(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn stats_report_bytes_and_inodes() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        f.mounter.set_stats(VolumeStats {
            bytes_total: 100,
            bytes_used: 40,
            bytes_available: 60,
            inodes_total: 10,
            inodes_used: 3,
            inodes_free: 7,
        });

        let usage = f
            .node
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
                volume_id: "tank/k8s/pvc-1".to_owned(),
                volume_path: dir.path().to_string_lossy().into_owned(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap()
            .into_inner()
            .usage;
        assert_eq!(
            usage,
            vec![
                VolumeUsage {
                    available: 60,
                    total: 100,
                    used: 40,
                    unit: volume_usage::Unit::Bytes as i32,
                },
                VolumeUsage {
                    available: 7,
                    total: 10,
                    used: 3,
                    unit: volume_usage::Unit::Inodes as i32,
                },
            ]
        );

        let status = f
            .node
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
                volume_id: "tank/k8s/pvc-1".to_owned(),
                volume_path: dir.path().join("missing").to_string_lossy().into_owned(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn reports_node_id_and_capabilities() {
        let f = fixture();
        let info = f
            .node
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "worker-1");

        let caps = f
            .node
            .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(caps.len(), 2);

        let status = f
            .node
            .node_stage_volume(Request::new(NodeStageVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
    }
}
