//! The k8sSearch backend: returns the data of an existing Secret matched
//! by scope-derived labels, and seeds the controller's accessible topology
//! from the node labels of matching Secrets.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt, api::ListParams};
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use super::{SecretBackendError, SecretContents, kube_error_code};
use crate::{
    crd::K8sSearchSpec,
    pod_info::{self, PodInfo},
    volume::SecretVolumeContext,
};

pub const LABEL_CLASS: &str = "secrets.kubedoop.dev/class";
pub const LABEL_POD: &str = "secrets.kubedoop.dev/pod";
pub const LABEL_NODE: &str = "secrets.kubedoop.dev/node";
pub const LABEL_SERVICE: &str = "secrets.kubedoop.dev/service";
const LABEL_LISTENER_PREFIX: &str = "secrets.kubedoop.dev/listener.";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve scoped listeners"))]
    PodInfo { source: pod_info::Error },

    #[snafu(display("failed to list secrets in namespace {namespace:?}"))]
    ListSecrets {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("no secret in namespace {namespace:?} matches {selector:?}"))]
    NoMatchingSecret {
        namespace: String,
        selector: String,
    },
}

impl SecretBackendError for Error {
    fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::PodInfo { source } => source.grpc_code(),
            Error::ListSecrets { source, .. } => kube_error_code(source),
            Error::NoMatchingSecret { .. } => tonic::Code::NotFound,
        }
    }
}

pub struct K8sSearchBackend {
    client: Client,
    spec: K8sSearchSpec,
}

impl K8sSearchBackend {
    pub fn new(client: Client, spec: K8sSearchSpec) -> Self {
        Self { client, spec }
    }

    /// The namespace to search: either the configured name, or the pod's
    /// own namespace for the `pod` variant.
    fn search_namespace(&self, pod_info: &PodInfo) -> String {
        match &self.spec.search_namespace.name {
            Some(name) => name.clone(),
            None => pod_info.pod_namespace(),
        }
    }

    #[instrument(skip_all, fields(pod = %pod_info.pod_name()))]
    pub async fn secret_data(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<SecretContents> {
        let namespace = self.search_namespace(pod_info);
        let labels = self.search_labels(pod_info, context).await?;
        let selector = label_selector(&labels);

        let secrets = Api::<Secret>::namespaced(self.client.clone(), &namespace);
        let matching = secrets
            .list(&ListParams::default().labels(&selector))
            .await
            .context(ListSecretsSnafu {
                namespace: namespace.clone(),
            })?;

        let secret = matching.items.into_iter().next().ok_or_else(|| {
            Error::NoMatchingSecret {
                namespace: namespace.clone(),
                selector: selector.clone(),
            }
        })?;
        debug!(secret = %secret.name_any(), %selector, "found matching secret");

        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect();

        Ok(SecretContents::new(data))
    }

    /// Nodes already holding a matching secret. Only meaningful when a
    /// scoped listener pins pods to their node; all other volumes may
    /// schedule anywhere.
    #[instrument(skip_all, fields(pod = %pod_info.pod_name()))]
    pub async fn qualified_node_names(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<Vec<String>> {
        if !pod_info
            .has_listener_node_scope()
            .await
            .context(PodInfoSnafu)?
        {
            return Ok(Vec::new());
        }

        let namespace = self.search_namespace(pod_info);
        let mut labels = self.search_labels(pod_info, context).await?;
        // The node is what we are solving for here.
        labels.remove(LABEL_NODE);
        let selector = label_selector(&labels);

        let secrets = Api::<Secret>::namespaced(self.client.clone(), &namespace);
        let matching = secrets
            .list(&ListParams::default().labels(&selector))
            .await
            .context(ListSecretsSnafu {
                namespace: namespace.clone(),
            })?;

        let node_names: BTreeSet<String> = matching
            .items
            .iter()
            .filter_map(|secret| secret.labels().get(LABEL_NODE).cloned())
            .collect();

        debug!(?node_names, %selector, "collected qualified nodes");
        Ok(node_names.into_iter().collect())
    }

    /// The label set a matching secret must carry for this selector.
    async fn search_labels(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<BTreeMap<String, String>> {
        let scope = pod_info.scope();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLASS.to_string(), context.class.clone());

        if scope.pod {
            labels.insert(LABEL_POD.to_string(), pod_info.pod_name());
        }

        let node_scoped = scope.node
            || pod_info
                .has_listener_node_scope()
                .await
                .context(PodInfoSnafu)?;
        if node_scoped && !pod_info.node_name().is_empty() {
            labels.insert(LABEL_NODE.to_string(), pod_info.node_name());
        }

        if !scope.services.is_empty() {
            labels.insert(LABEL_SERVICE.to_string(), scope.services.join(","));
        }

        let listener_names = pod_info
            .listener_volume_names_to_listener_names()
            .await
            .context(PodInfoSnafu)?;
        for (index, listener_volume) in scope.listener_volumes.iter().enumerate() {
            if let Some(listener_name) = listener_names.get(listener_volume) {
                labels.insert(
                    format!("{LABEL_LISTENER_PREFIX}{}", index + 1),
                    listener_name.clone(),
                );
            }
        }

        Ok(labels)
    }
}

/// Renders a deterministic `key=value,…` selector; BTreeMap iteration
/// keeps it byte-stable.
fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_deterministic() {
        let labels = BTreeMap::from([
            (LABEL_POD.to_string(), "my-pod".to_string()),
            (LABEL_CLASS.to_string(), "tls".to_string()),
        ]);

        assert_eq!(
            label_selector(&labels),
            "secrets.kubedoop.dev/class=tls,secrets.kubedoop.dev/pod=my-pod"
        );
    }

    #[test]
    fn listener_labels_are_one_indexed() {
        assert_eq!(format!("{LABEL_LISTENER_PREFIX}{}", 1), "secrets.kubedoop.dev/listener.1");
    }
}
