use std::{
    collections::{BTreeMap, HashMap},
    sync::LazyLock,
};

use csi_grpc::v1::{
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse, ControllerServiceCapability,
    CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest, DeleteVolumeResponse,
    ListVolumesRequest, ListVolumesResponse, Topology, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability, controller_server::Controller,
    controller_service_capability, list_volumes_response, validate_volume_capabilities_response,
    volume_capability,
};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

use super::{TOPOLOGY_NODE_KEY, backend_status, error_full_message};
use crate::{
    backend::{SecretBackend, SharedLocks},
    crd::SecretClass,
    pod_info::PodInfo,
    volume::SecretVolumeContext,
};

const PVC_NAME_PARAMETER: &str = "csi.storage.k8s.io/pvc/name";
const PVC_NAMESPACE_PARAMETER: &str = "csi.storage.k8s.io/pvc/namespace";

/// Dynamically provisioned PVs carry a generated `pvc-<uuid>` name.
static DYNAMIC_PV_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^pvc-[0-9a-f]{8}(-[0-9a-f]{4}){3}-[0-9a-f]{12}$")
        .expect("static regex is always valid")
});

const SUPPORTED_ACCESS_MODES: [volume_capability::access_mode::Mode; 3] = [
    volume_capability::access_mode::Mode::SingleNodeWriter,
    volume_capability::access_mode::Mode::MultiNodeMultiWriter,
    volume_capability::access_mode::Mode::MultiNodeReaderOnly,
];

/// Serves volume lifecycle requests from the external provisioner. The
/// driver keeps no server-side volume state beyond an in-memory capacity
/// map, the real work happens at NodePublishVolume time.
pub struct ControllerService {
    client: Client,
    locks: SharedLocks,
    volumes: Mutex<HashMap<String, i64>>,
}

impl ControllerService {
    pub fn new(client: Client, locks: SharedLocks) -> Self {
        Self {
            client,
            locks,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the PVC backing this volume. Requires the provisioner sidecar
    /// to run with `--extra-create-metadata` so the PVC coordinates appear
    /// in the request parameters.
    async fn pvc_for_request(
        &self,
        parameters: &HashMap<String, String>,
    ) -> Result<PersistentVolumeClaim, Status> {
        let (Some(pvc_name), Some(pvc_namespace)) = (
            parameters.get(PVC_NAME_PARAMETER),
            parameters.get(PVC_NAMESPACE_PARAMETER),
        ) else {
            return Err(Status::invalid_argument(
                "PVC name or namespace missing in request parameters, \
                 ensure '--extra-create-metadata' is set on the csi-provisioner sidecar",
            ));
        };

        let pvcs = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), pvc_namespace);
        pvcs.get(pvc_name)
            .await
            .map_err(|error| Status::not_found(error_full_message(&error)))
    }

    /// Restricts scheduling to the nodes already holding a matching secret
    /// when the selector is node scoped. Everything else may run anywhere.
    async fn accessible_topology(
        &self,
        pvc: &PersistentVolumeClaim,
        context: &SecretVolumeContext,
    ) -> Result<Vec<Topology>, Status> {
        // Ephemeral volume claims are owned by their pod.
        let Some(owner) = pvc
            .owner_references()
            .iter()
            .find(|reference| reference.kind == "Pod")
        else {
            debug!(pvc = %pvc.name_any(), "PVC has no pod owner, skipping topology");
            return Ok(Vec::new());
        };

        let pods = Api::<Pod>::namespaced(
            self.client.clone(),
            &pvc.namespace().unwrap_or_default(),
        );
        let pod = pods
            .get(&owner.name)
            .await
            .map_err(|error| Status::not_found(error_full_message(&error)))?;

        let secret_classes = Api::<SecretClass>::all(self.client.clone());
        let secret_class = secret_classes
            .get(&context.class)
            .await
            .map_err(|error| Status::not_found(error_full_message(&error)))?;

        let pod_info = PodInfo::new(self.client.clone(), pod, context.scope.clone());
        let backend = SecretBackend::new(self.client.clone(), &secret_class, self.locks.clone())
            .await
            .map_err(|error| backend_status(&error))?;

        let node_names = backend
            .qualified_node_names(&pod_info, context)
            .await
            .map_err(|error| backend_status(&error))?;

        Ok(node_names
            .into_iter()
            .map(|node_name| Topology {
                segments: HashMap::from([(TOPOLOGY_NODE_KEY.to_string(), node_name)]),
            })
            .collect())
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(skip_all, fields(volume = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        validate_create_volume_request(&request)?;

        let required_bytes = request
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or_default();

        {
            let mut volumes = self.volumes.lock().await;
            if let Some(existing) = volumes.get(&request.name) {
                if *existing < required_bytes {
                    return Err(Status::already_exists(format!(
                        "volume {:?} exists with smaller capacity {existing}",
                        request.name
                    )));
                }
            }
            volumes.insert(request.name.clone(), required_bytes);
        }

        let pvc = self.pvc_for_request(&request.parameters).await?;

        let context = SecretVolumeContext::from_map(pvc.annotations())
            .map_err(|error| Status::invalid_argument(error_full_message(&error)))?;
        if context.class.is_empty() {
            return Err(Status::invalid_argument(format!(
                "annotation {:?} missing on PVC {}/{}",
                crate::volume::ANNOTATION_CLASS,
                pvc.namespace().unwrap_or_default(),
                pvc.name_any(),
            )));
        }

        let accessible_topology = self.accessible_topology(&pvc, &context).await?;
        info!(
            volume = %request.name,
            topology_count = accessible_topology.len(),
            "created volume"
        );

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                volume_id: request.name,
                capacity_bytes: required_bytes,
                volume_context: btree_to_hash(context.to_map()),
                accessible_topology,
            }),
        }))
    }

    #[instrument(skip_all, fields(volume = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }

        // There is no server-side state to clean up; statically provisioned
        // volumes are not ours to delete either.
        if !DYNAMIC_PV_NAME.is_match(&request.volume_id) {
            debug!("volume is not dynamically provisioned, nothing to delete");
        }

        self.volumes.lock().await.remove(&request.volume_id);
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume capabilities missing in request",
            ));
        }

        let confirmed = supports_volume_capabilities(&request.volume_capabilities).then(|| {
            validate_volume_capabilities_response::Confirmed {
                volume_context: request.volume_context,
                volume_capabilities: request.volume_capabilities,
                parameters: request.parameters,
            }
        });

        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed,
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self.volumes.lock().await;
        let entries = volumes
            .iter()
            .map(|(volume_id, capacity_bytes)| list_volumes_response::Entry {
                volume: Some(Volume {
                    volume_id: volume_id.clone(),
                    capacity_bytes: *capacity_bytes,
                    volume_context: HashMap::new(),
                    accessible_topology: Vec::new(),
                }),
            })
            .collect();

        Ok(Response::new(ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: controller_service_capability::rpc::Type::CreateDeleteVolume as i32,
                    },
                )),
            }],
        }))
    }
}

fn validate_create_volume_request(request: &CreateVolumeRequest) -> Result<(), Status> {
    if request.name.is_empty() {
        return Err(Status::invalid_argument("volume name missing in request"));
    }
    if request.capacity_range.is_none() {
        return Err(Status::invalid_argument("capacity range missing in request"));
    }
    if request.volume_capabilities.is_empty() {
        return Err(Status::invalid_argument(
            "volume capabilities missing in request",
        ));
    }
    if !supports_volume_capabilities(&request.volume_capabilities) {
        return Err(Status::invalid_argument(
            "volume capabilities not supported, only filesystem mounts with \
             SINGLE_NODE_WRITER, MULTI_NODE_MULTI_WRITER or MULTI_NODE_READER_ONLY are served",
        ));
    }
    Ok(())
}

/// Only filesystem-mode mounts with the supported access modes are served;
/// block volumes are rejected.
fn supports_volume_capabilities(capabilities: &[VolumeCapability]) -> bool {
    capabilities.iter().all(|capability| {
        let mount = matches!(
            capability.access_type,
            Some(volume_capability::AccessType::Mount(_))
        );
        let mode = capability
            .access_mode
            .as_ref()
            .and_then(|access_mode| {
                volume_capability::access_mode::Mode::try_from(access_mode.mode).ok()
            })
            .map(|mode| SUPPORTED_ACCESS_MODES.contains(&mode))
            .unwrap_or(false);

        mount && mode
    })
}

fn btree_to_hash(map: BTreeMap<String, String>) -> HashMap<String, String> {
    map.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_capability(mode: volume_capability::access_mode::Mode) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(volume_capability::AccessType::Mount(
                volume_capability::MountVolume::default(),
            )),
            access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn dynamic_pv_names_match() {
        assert!(DYNAMIC_PV_NAME.is_match("pvc-12345678-1234-abcd-ef01-123456789abc"));
        assert!(!DYNAMIC_PV_NAME.is_match("my-static-volume"));
        assert!(!DYNAMIC_PV_NAME.is_match("pvc-1234"));
    }

    #[test]
    fn filesystem_mounts_are_supported() {
        assert!(supports_volume_capabilities(&[mount_capability(
            volume_capability::access_mode::Mode::SingleNodeWriter
        )]));
        assert!(supports_volume_capabilities(&[
            mount_capability(volume_capability::access_mode::Mode::MultiNodeMultiWriter),
            mount_capability(volume_capability::access_mode::Mode::MultiNodeReaderOnly),
        ]));
    }

    #[test]
    fn block_volumes_are_rejected() {
        let block = VolumeCapability {
            access_type: Some(volume_capability::AccessType::Block(
                volume_capability::BlockVolume::default(),
            )),
            access_mode: Some(volume_capability::AccessMode {
                mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        };
        assert!(!supports_volume_capabilities(&[block]));
    }

    #[test]
    fn unsupported_access_modes_are_rejected() {
        assert!(!supports_volume_capabilities(&[mount_capability(
            volume_capability::access_mode::Mode::MultiNodeSingleWriter
        )]));
    }
}
