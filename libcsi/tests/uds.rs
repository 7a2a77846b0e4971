//! Controller role served over a unix socket.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{Appliance, MIB};
use libcsi::backend::truenas::TruenasBackendFactory;
use libcsi::proto::controller_service_capability::{self, rpc};
use libcsi::proto::volume_capability::access_mode::Mode;
use libcsi::proto::volume_capability::{AccessMode, AccessType, MountVolume};
use libcsi::proto::{
    CapacityRange, ControllerGetCapabilitiesRequest, CreateVolumeRequest, GetPluginInfoRequest,
    ListVolumesRequest, ProbeRequest, VolumeCapability,
};
use libcsi::transport::{CsiClient, Role, serve};
use libcsi::{ControllerService, IdentityService, PLUGIN_NAME};
use tokio::sync::oneshot;
use tonic::Code;

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never appeared", path.display());
}

#[tokio::test]
async fn serves_controller_over_unix_socket() {
    let appliance = Appliance::start().await;
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("plugin").join("csi.sock");

    let identity = IdentityService::new();
    let role = Role::Controller(ControllerService::new(Arc::new(TruenasBackendFactory)));
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn({
        let socket = socket.clone();
        let identity = identity.clone();
        async move {
            serve(&socket, identity, role, async move {
                let _ = stopped.await;
            })
            .await
        }
    });
    wait_for_socket(&socket).await;

    let client = CsiClient::connect(&socket).await.unwrap();
    let mut identity_client = client.identity();
    let ready = identity_client
        .probe(ProbeRequest {})
        .await
        .unwrap()
        .into_inner()
        .ready
        .unwrap();
    assert!(ready.value);
    let info = identity_client
        .get_plugin_info(GetPluginInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.name, PLUGIN_NAME);

    let mut controller = client.controller();
    let capabilities = controller
        .controller_get_capabilities(ControllerGetCapabilitiesRequest {})
        .await
        .unwrap()
        .into_inner()
        .capabilities;
    let kinds: Vec<_> = capabilities
        .iter()
        .filter_map(|c| match &c.r#type {
            Some(controller_service_capability::Type::Rpc(kind)) => Some(kind.r#type),
            None => None,
        })
        .collect();
    assert_eq!(
        kinds,
        [
            rpc::Type::CreateDeleteVolume as i32,
            rpc::Type::ExpandVolume as i32
        ]
    );

    let volume = controller
        .create_volume(CreateVolumeRequest {
            name: "v1".to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: 128 * MIB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability {
                access_type: Some(AccessType::Mount(MountVolume::default())),
                access_mode: Some(AccessMode {
                    mode: Mode::SingleNodeWriter as i32,
                }),
            }],
            secrets: appliance.secrets(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(volume.volume_id, "tank/k8s/v1");
    assert!(appliance.dataset("tank/k8s/v1").is_some());

    let status = controller
        .list_volumes(ListVolumesRequest::default())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
    assert!(!socket.exists());
    assert!(!identity.is_ready());
}
