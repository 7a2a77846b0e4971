//! CSI Controller service.
//!
//! Cluster-facing volume lifecycle: create, delete and expand.  Every call
//! carries its own `secrets`, so the service holds no backend of its own and
//! builds one per request through the [`BackendFactory`].

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use crate::backend::{BackendFactory, BoxedBackend};
use crate::error::{CsiError, respond};
use crate::proto::controller_server::Controller;
use crate::proto::controller_service_capability::{self, rpc};
use crate::proto::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest,
    ListVolumesResponse, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    Volume,
};
use crate::types::{context_keys, is_capability_supported, volume_size_from_capacity_range};

#[derive(Clone)]
pub struct ControllerService {
    backends: Arc<dyn BackendFactory>,
}

impl ControllerService {
    pub fn new(backends: Arc<dyn BackendFactory>) -> Self {
        Self { backends }
    }

    fn backend(&self, secrets: &HashMap<String, String>) -> Result<BoxedBackend, CsiError> {
        self.backends
            .from_secrets(secrets)
            .map_err(CsiError::backend("load backend"))
    }

    #[instrument(skip_all, fields(name = %req.name))]
    async fn create(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::invalid_argument("missing name"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid_argument("missing volume capabilities"));
        }
        let (size, _) = volume_size_from_capacity_range(req.capacity_range.as_ref())?;
        if let Some(index) = req
            .volume_capabilities
            .iter()
            .position(|capability| !is_capability_supported(capability))
        {
            return Err(CsiError::invalid_argument(format!(
                "capability at index {index} is not supported"
            )));
        }

        let backend = self.backend(&req.secrets)?;

        let volume_id = backend
            .create_volume(&req.name, size)
            .await
            .map_err(CsiError::backend("create volume"))?;
        let iqn = backend.iscsi_secrets().target_iqn(&req.name);
        info!(%volume_id, size, %iqn, "volume created");

        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: size,
                volume_id,
                volume_context: HashMap::from([(context_keys::ISCSI_IQN.to_owned(), iqn)]),
                ..Default::default()
            }),
        })
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn delete(&self, req: DeleteVolumeRequest) -> Result<DeleteVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("missing volume id"));
        }
        let backend = self.backend(&req.secrets)?;
        backend
            .delete_volume(&req.volume_id)
            .await
            .map_err(CsiError::backend("delete volume"))?;
        info!("volume deleted");
        Ok(DeleteVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn expand(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("missing volume id"));
        }
        let (size, _) = volume_size_from_capacity_range(req.capacity_range.as_ref())?;
        let backend = self.backend(&req.secrets)?;
        backend
            .expand_volume(&req.volume_id, size)
            .await
            .map_err(CsiError::backend("expand volume"))?;
        info!(size, "volume expanded");

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: size,
            node_expansion_required: true,
        })
    }

    fn capabilities() -> Vec<ControllerServiceCapability> {
        [rpc::Type::CreateDeleteVolume, rpc::Type::ExpandVolume]
            .into_iter()
            .map(|kind| ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: kind as i32,
                    },
                )),
            })
            .collect()
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        respond("CreateVolume", self.create(request.into_inner()).await)
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        respond("DeleteVolume", self.delete(request.into_inner()).await)
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        respond("ControllerExpandVolume", self.expand(request.into_inner()).await)
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        respond(
            "ControllerGetCapabilities",
            Ok(ControllerGetCapabilitiesResponse {
                capabilities: Self::capabilities(),
            }),
        )
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        respond(
            "ControllerPublishVolume",
            Err(CsiError::Unimplemented("ControllerPublishVolume")),
        )
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        respond(
            "ControllerUnpublishVolume",
            Err(CsiError::Unimplemented("ControllerUnpublishVolume")),
        )
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        respond(
            "ValidateVolumeCapabilities",
            Err(CsiError::Unimplemented("ValidateVolumeCapabilities")),
        )
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        respond("ListVolumes", Err(CsiError::Unimplemented("ListVolumes")))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        respond("GetCapacity", Err(CsiError::Unimplemented("GetCapacity")))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        respond("CreateSnapshot", Err(CsiError::Unimplemented("CreateSnapshot")))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        respond("DeleteSnapshot", Err(CsiError::Unimplemented("DeleteSnapshot")))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        respond("ListSnapshots", Err(CsiError::Unimplemented("ListSnapshots")))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        respond(
            "ControllerGetVolume",
            Err(CsiError::Unimplemented("ControllerGetVolume")),
        )
    }
}
