use std::{
    os::unix::fs::PermissionsExt,
    path::Path,
    time::SystemTime,
};

use chrono::{DateTime, SecondsFormat, Utc};
use csi_grpc::v1::{
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeServiceCapability, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, node_server::Node, node_service_capability,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use nix::mount::{MsFlags, mount, umount};
use sha2::{Digest, Sha256};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::{backend_status, error_full_message};
use crate::{
    backend::{SecretBackend, SecretContents, SharedLocks},
    crd::SecretClass,
    pod_info::PodInfo,
    volume::SecretVolumeContext,
};

/// Prefix of the pod annotation carrying the volume expiry, completed by
/// the hex-encoded volume tag.
const RESTARTER_EXPIRES_AT_PREFIX: &str = "secrets.kubedoop.dev/restarter-expires-at:";

/// Domain-separation prefix hashed together with the volume ID to build
/// the annotation tag.
const VOLUME_TAG_PREFIX: &str = "secrets.kubedoop.dev/volume:";

const TARGET_DIR_MODE: u32 = 0o750;
const SECRET_FILE_MODE: u32 = 0o644;

/// Serves the node side of the driver: materialises secrets into tmpfs
/// volumes on pod startup and tears them down again.
pub struct NodeService {
    client: Client,
    node_id: String,
    locks: SharedLocks,
}

impl NodeService {
    pub fn new(client: Client, node_id: impl Into<String>, locks: SharedLocks) -> Self {
        Self {
            client,
            node_id: node_id.into(),
            locks,
        }
    }

    async fn provision(&self, request: &NodePublishVolumeRequest) -> Result<(), Status> {
        let context = SecretVolumeContext::from_map(&request.volume_context)
            .map_err(|error| Status::invalid_argument(error_full_message(&error)))?;
        if context.class.is_empty() {
            return Err(Status::invalid_argument(
                "secret class name missing in volume context",
            ));
        }

        // SecretClass is cluster scoped.
        let secret_classes = Api::<SecretClass>::all(self.client.clone());
        let secret_class = secret_classes
            .get(&context.class)
            .await
            .map_err(|error| Status::not_found(error_full_message(&error)))?;

        let pods = Api::<Pod>::namespaced(self.client.clone(), &context.pod_namespace);
        let pod = pods
            .get(&context.pod)
            .await
            .map_err(|error| Status::not_found(error_full_message(&error)))?;

        let pod_info = PodInfo::new(self.client.clone(), pod, context.scope.clone());
        let backend = SecretBackend::new(self.client.clone(), &secret_class, self.locks.clone())
            .await
            .map_err(|error| backend_status(&error))?;
        let contents = backend
            .secret_data(&pod_info, &context)
            .await
            .map_err(|error| backend_status(&error))?;

        let target_path = Path::new(&request.target_path);
        mount_tmpfs(target_path)?;

        // Mandatory order from here: file writes, then the annotation
        // patch. Neither a failure nor a cancelled CSI call may leave the
        // mount behind.
        let mut rollback = MountRollback {
            target_path,
            armed: true,
        };
        self.finish_publish(&context, &request.volume_id, target_path, &contents)
            .await?;
        rollback.armed = false;

        Ok(())
    }

    async fn finish_publish(
        &self,
        context: &SecretVolumeContext,
        volume_id: &str,
        target_path: &Path,
        contents: &SecretContents,
    ) -> Result<(), Status> {
        write_secret_files(target_path, contents).await?;

        if let Some(expires_at) = contents.expires_at {
            self.patch_pod_expiry(context, volume_id, expires_at).await?;
        }

        Ok(())
    }

    /// Stamps the expiry on the pod so the restart controller can recycle
    /// it before the credential expires.
    async fn patch_pod_expiry(
        &self,
        context: &SecretVolumeContext,
        volume_id: &str,
        expires_at: SystemTime,
    ) -> Result<(), Status> {
        let annotation = expiry_annotation_key(volume_id);
        let expires_at = DateTime::<Utc>::from(expires_at).to_rfc3339_opts(SecondsFormat::Secs, true);
        debug!(
            pod = %context.pod,
            key = %annotation,
            value = %expires_at,
            "patching pod expiry annotation"
        );

        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    annotation: expires_at,
                }
            }
        });

        let pods = Api::<Pod>::namespaced(self.client.clone(), &context.pod_namespace);
        pods.patch(
            &context.pod,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|error| Status::internal(error_full_message(&error)))?;

        Ok(())
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    #[instrument(skip_all, fields(volume = %request.get_ref().volume_id))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        validate_publish_request(&request)?;

        self.provision(&request).await?;

        info!(target = %request.target_path, "published volume");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume = %request.get_ref().volume_id))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        if request.target_path.is_empty() {
            return Err(Status::invalid_argument("target path missing in request"));
        }

        let target_path = Path::new(&request.target_path);
        if let Err(error) = umount(target_path) {
            // Not mounted (any more) is fine, the kubelet retries unpublish.
            warn!(target = %request.target_path, %error, "unmount failed, continuing with removal");
        }

        match tokio::fs::remove_dir_all(target_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(Status::internal(error_full_message(&error))),
        }

        info!(target = %request.target_path, "unpublished volume");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let request = request.get_ref();
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        if request.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "staging target path missing in request",
            ));
        }
        if request.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "volume capability missing in request",
            ));
        }

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let request = request.get_ref();
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        if request.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "staging target path missing in request",
            ));
        }

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc {
                        r#type: node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

fn validate_publish_request(request: &NodePublishVolumeRequest) -> Result<(), Status> {
    if request.volume_id.is_empty() {
        return Err(Status::invalid_argument("volume ID missing in request"));
    }
    if request.target_path.is_empty() {
        return Err(Status::invalid_argument("target path missing in request"));
    }
    if request.volume_capability.is_none() {
        return Err(Status::invalid_argument(
            "volume capability missing in request",
        ));
    }
    if request.volume_context.is_empty() {
        return Err(Status::invalid_argument("volume context missing in request"));
    }
    Ok(())
}

/// Creates the target directory (failing when it already exists, which
/// would mean a concurrent mount) and mounts a tmpfs with
/// `noexec,nosuid,nodev` so secret material never touches disk.
fn mount_tmpfs(target_path: &Path) -> Result<(), Status> {
    if target_path.exists() {
        return Err(Status::internal(format!(
            "target path {} already exists",
            target_path.display()
        )));
    }

    std::fs::create_dir_all(target_path)
        .and_then(|()| {
            std::fs::set_permissions(target_path, std::fs::Permissions::from_mode(TARGET_DIR_MODE))
        })
        .map_err(|error| Status::internal(error_full_message(&error)))?;

    mount(
        Some("tmpfs"),
        target_path,
        Some("tmpfs"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|error| Status::internal(format!("failed to mount tmpfs: {error}")))?;

    debug!(target = %target_path.display(), "mounted tmpfs");
    Ok(())
}

/// Tears the fresh mount down again when publishing fails or the call is
/// cancelled between mount and annotation patch; the kubelet will retry
/// the whole call.
struct MountRollback<'a> {
    target_path: &'a Path,
    armed: bool,
}

impl Drop for MountRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Err(error) = umount(self.target_path) {
            warn!(target = %self.target_path.display(), %error, "rollback unmount failed");
        }
        if let Err(error) = std::fs::remove_dir_all(self.target_path) {
            warn!(target = %self.target_path.display(), %error, "rollback removal failed");
        }
    }
}

async fn write_secret_files(target_path: &Path, contents: &SecretContents) -> Result<(), Status> {
    for (file_name, data) in &contents.data {
        let path = target_path.join(file_name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|error| Status::internal(error_full_message(&error)))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(SECRET_FILE_MODE))
            .await
            .map_err(|error| Status::internal(error_full_message(&error)))?;
        debug!(file = %path.display(), "wrote secret file");
    }
    Ok(())
}

/// The annotation key scoping an expiry to one volume: the prefix plus the
/// hex of the first 16 bytes of `SHA-256("secrets.kubedoop.dev/volume:" ||
/// volumeId)`, which keeps the key within the 63-character limit.
fn expiry_annotation_key(volume_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(VOLUME_TAG_PREFIX.as_bytes());
    hasher.update(volume_id.as_bytes());
    let digest = hasher.finalize();

    format!("{RESTARTER_EXPIRES_AT_PREFIX}{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_key_is_stable_and_short() {
        let key = expiry_annotation_key("pvc-12345678-1234-abcd-ef01-123456789abc");

        assert!(key.starts_with(RESTARTER_EXPIRES_AT_PREFIX));
        // 16 bytes hex encoded.
        assert_eq!(key.len(), RESTARTER_EXPIRES_AT_PREFIX.len() + 32);
        assert_eq!(key, expiry_annotation_key("pvc-12345678-1234-abcd-ef01-123456789abc"));
        assert_ne!(key, expiry_annotation_key("another-volume"));

        // The name part after the prefix must fit the 63 character
        // annotation name limit.
        let name = key.rsplit(':').next().unwrap();
        assert!(name.len() <= 63);
    }

    #[test]
    fn expiry_is_rendered_as_rfc3339() {
        let expires = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let rendered =
            DateTime::<Utc>::from(expires).to_rfc3339_opts(SecondsFormat::Secs, true);
        assert_eq!(rendered, "2023-11-14T22:13:20Z");
    }
}
