//! CSI Identity service.
//!
//! Reports the plugin name and version, advertises the controller service and
//! online expansion, and answers readiness probes.  Readiness starts out
//! `false` and is flipped by the server once the socket is accepting requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::{Request, Response, Status};

use crate::error::respond;
use crate::proto::identity_server::Identity;
use crate::proto::plugin_capability::{self, service, volume_expansion};
use crate::proto::{
    BoolValue, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use crate::types::{PLUGIN_NAME, PLUGIN_VERSION};

#[derive(Debug, Clone, Default)]
pub struct IdentityService {
    ready: Arc<AtomicBool>,
}

impl IdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the readiness reported by `Probe`.  All clones share the flag.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn capabilities() -> Vec<PluginCapability> {
        vec![
            PluginCapability {
                r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                    r#type: service::Type::ControllerService as i32,
                })),
            },
            PluginCapability {
                r#type: Some(plugin_capability::Type::VolumeExpansion(
                    plugin_capability::VolumeExpansion {
                        r#type: volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ]
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        respond(
            "GetPluginInfo",
            Ok(GetPluginInfoResponse {
                name: PLUGIN_NAME.to_owned(),
                vendor_version: PLUGIN_VERSION.to_owned(),
                manifest: Default::default(),
            }),
        )
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        respond(
            "GetPluginCapabilities",
            Ok(GetPluginCapabilitiesResponse {
                capabilities: Self::capabilities(),
            }),
        )
    }

    /// Not logged; orchestrators call this continuously.
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse {
            ready: Some(BoolValue {
                value: self.is_ready(),
            }),
        }))
    }
}
