//! Resolves the network identities a secret is scoped to: node and pod
//! addresses, service FQDNs and listener ingress addresses. The resolved
//! [`Address`] list feeds both the SAN extension of TLS leaf certificates
//! and the hostname part of Kerberos principals.
use std::{collections::HashMap, net::IpAddr};

use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::{Api, Client, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::{
    crd::{Listener, ListenerClass},
    volume::SecretScope,
};

/// The assumed cluster DNS domain, overridable through the
/// `KUBERNETES_CLUSTER_DOMAIN` env var.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const CLUSTER_DOMAIN_ENV: &str = "KUBERNETES_CLUSTER_DOMAIN";

/// PVC annotation carrying the bound listener name. Falls back to the PVC
/// name itself.
pub const LISTENER_NAME_ANNOTATION: &str = "listeners.kubedoop.dev/listener-name";

const NODE_ADDRESS_INTERNAL_IP: &str = "InternalIP";
const NODE_ADDRESS_EXTERNAL_IP: &str = "ExternalIP";
const SERVICE_TYPE_NODE_PORT: &str = "NodePort";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid node ip {address:?}"))]
    InvalidNodeIp { address: String },

    #[snafu(display("invalid pod ip {ip:?} from pod {pod:?}"))]
    InvalidPodIp { ip: String, pod: String },

    #[snafu(display("failed to get PVC {pvc:?}"))]
    GetPvc { source: kube::Error, pvc: String },

    #[snafu(display("failed to get listener {listener:?}"))]
    GetListener {
        source: kube::Error,
        listener: String,
    },

    #[snafu(display("failed to get listener class {class:?}"))]
    GetListenerClass { source: kube::Error, class: String },

    #[snafu(display("listener {namespace}/{listener} has no class name"))]
    ListenerClassMissing { namespace: String, listener: String },

    #[snafu(display("listener {namespace}/{listener} status not ready"))]
    ListenerNotReady { namespace: String, listener: String },

    #[snafu(display("invalid listener ip {address:?} from listener {listener:?}"))]
    InvalidListenerIp { address: String, listener: String },
}

/// A single network identity. At least one of `ip` / `hostname` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    ip: Option<IpAddr>,
    hostname: Option<String>,
}

impl Address {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            hostname: None,
        }
    }

    pub fn from_hostname(hostname: impl Into<String>) -> Self {
        Self {
            ip: None,
            hostname: Some(hostname.into()),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }
}

/// Resolves scope entries against a concrete pod. Holds a read-only
/// Kubernetes client and memoises the listener-volume to listener-name
/// mapping for the lifetime of one CSI call.
pub struct PodInfo {
    client: Client,
    pod: Pod,
    scope: SecretScope,
    cluster_domain: String,

    listener_name_cache: RwLock<Option<HashMap<String, String>>>,
}

impl PodInfo {
    pub fn new(client: Client, pod: Pod, scope: SecretScope) -> Self {
        let cluster_domain = std::env::var(CLUSTER_DOMAIN_ENV)
            .unwrap_or_else(|_| DEFAULT_CLUSTER_DOMAIN.to_string());
        Self::new_with_cluster_domain(client, pod, scope, cluster_domain)
    }

    pub fn new_with_cluster_domain(
        client: Client,
        pod: Pod,
        scope: SecretScope,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            client,
            pod,
            scope,
            cluster_domain: cluster_domain.into(),
            listener_name_cache: RwLock::new(None),
        }
    }

    pub fn pod_name(&self) -> String {
        self.pod.name_any()
    }

    pub fn pod_namespace(&self) -> String {
        self.pod.namespace().unwrap_or_default()
    }

    pub fn node_name(&self) -> String {
        self.pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default()
    }

    pub fn scope(&self) -> &SecretScope {
        &self.scope
    }

    /// Resolves all addresses the secret is scoped to, in scope order:
    /// node, pod, services, listener volumes. Duplicates are not removed,
    /// they are harmless in a SAN.
    #[instrument(skip(self), fields(pod = %self.pod_name()))]
    pub async fn scoped_addresses(&self) -> Result<Vec<Address>> {
        let mut addresses = Vec::new();

        if self.scope.node {
            addresses.extend(self.node_addresses().await?);
        }

        if self.scope.pod {
            addresses.extend(pod_addresses(
                &self.pod,
                &self.pod_namespace(),
                &self.cluster_domain,
            )?);
        }

        for service in &self.scope.services {
            addresses.push(Address::from_hostname(service_fqdn(
                service,
                &self.pod_namespace(),
                &self.cluster_domain,
            )));
        }

        if !self.scope.listener_volumes.is_empty() {
            addresses.extend(self.listener_addresses().await?);
        }

        debug!(count = addresses.len(), "resolved scoped addresses");
        Ok(addresses)
    }

    /// Node addresses: the node name plus every InternalIP/ExternalIP
    /// status address. An unreachable node resolves to no addresses.
    async fn node_addresses(&self) -> Result<Vec<Address>> {
        let nodes = Api::<Node>::all(self.client.clone());
        let node = match nodes.get(&self.node_name()).await {
            Ok(node) => node,
            Err(error) => {
                warn!(node = %self.node_name(), %error, "failed to get node, skipping node addresses");
                return Ok(Vec::new());
            }
        };

        node_addresses(&node)
    }

    /// Returns true iff any scoped listener references a ListenerClass
    /// backed by a NodePort service. Such secrets pin the pod to specific
    /// nodes.
    pub async fn has_listener_node_scope(&self) -> Result<bool> {
        let listener_names = self.listener_volume_names_to_listener_names().await?;

        let listeners = Api::<Listener>::namespaced(self.client.clone(), &self.pod_namespace());
        let listener_classes = Api::<ListenerClass>::all(self.client.clone());

        for listener_name in listener_names.values() {
            let listener = listeners.get(listener_name).await.context(GetListenerSnafu {
                listener: listener_name.clone(),
            })?;

            let class_name =
                listener
                    .spec
                    .class_name
                    .as_deref()
                    .context(ListenerClassMissingSnafu {
                        namespace: self.pod_namespace(),
                        listener: listener_name.clone(),
                    })?;

            let listener_class =
                listener_classes
                    .get(class_name)
                    .await
                    .context(GetListenerClassSnafu {
                        class: class_name.to_string(),
                    })?;

            if listener_class.spec.service_type.as_deref() == Some(SERVICE_TYPE_NODE_PORT) {
                debug!(listener = %listener_name, "listener has node scope");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// The scoped listener-volume name to listener name mapping, memoised
    /// per instance: read-lock fast path, then upgrade and double-check
    /// before populating.
    pub async fn listener_volume_names_to_listener_names(
        &self,
    ) -> Result<HashMap<String, String>> {
        {
            let cache = self.listener_name_cache.read().await;
            if let Some(names) = cache.as_ref() {
                return Ok(names.clone());
            }
        }

        let mut cache = self.listener_name_cache.write().await;
        if let Some(names) = cache.as_ref() {
            return Ok(names.clone());
        }

        let names = self.fetch_listener_names().await?;
        *cache = Some(names.clone());
        Ok(names)
    }

    /// Maps each scoped listener volume to its listener: pod volume →
    /// claim name (ephemeral volumes use the synthetic `<pod>-<volume>`
    /// claim name), then the PVC's listener-name annotation, defaulting to
    /// the PVC name.
    async fn fetch_listener_names(&self) -> Result<HashMap<String, String>> {
        let volume_to_pvc = volume_names_to_pvc_names(&self.pod);
        let pvcs =
            Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &self.pod_namespace());

        let mut listener_names = HashMap::new();
        for listener_volume in &self.scope.listener_volumes {
            let Some(pvc_name) = volume_to_pvc.get(listener_volume) else {
                warn!(
                    listener_volume = %listener_volume,
                    "listener volume not found in pod volumes, skipping it"
                );
                continue;
            };

            let pvc = pvcs
                .get(pvc_name)
                .await
                .context(GetPvcSnafu { pvc: pvc_name.clone() })?;

            let listener_name = pvc
                .annotations()
                .get(LISTENER_NAME_ANNOTATION)
                .cloned()
                .unwrap_or_else(|| pvc_name.clone());

            listener_names.insert(listener_volume.clone(), listener_name);
        }

        Ok(listener_names)
    }

    /// Ingress addresses of every scoped listener. A listener without
    /// ingress addresses is not ready yet.
    async fn listener_addresses(&self) -> Result<Vec<Address>> {
        let listener_names = self.listener_volume_names_to_listener_names().await?;
        let listeners = Api::<Listener>::namespaced(self.client.clone(), &self.pod_namespace());

        let mut addresses = Vec::new();
        for listener_name in listener_names.values() {
            let listener = listeners.get(listener_name).await.context(GetListenerSnafu {
                listener: listener_name.clone(),
            })?;

            addresses.extend(listener_ingress_addresses(&listener, listener_name)?);
        }

        Ok(addresses)
    }
}

/// Renders `<name>.<namespace>.svc.<cluster domain>`.
pub fn service_fqdn(name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{name}.{namespace}.svc.{cluster_domain}")
}

pub(crate) fn node_addresses(node: &Node) -> Result<Vec<Address>> {
    let mut addresses = vec![Address::from_hostname(node.name_any())];

    for address in node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .into_iter()
        .flatten()
    {
        if address.type_ == NODE_ADDRESS_INTERNAL_IP || address.type_ == NODE_ADDRESS_EXTERNAL_IP {
            let ip = address
                .address
                .parse::<IpAddr>()
                .ok()
                .context(InvalidNodeIpSnafu {
                    address: address.address.clone(),
                })?;
            addresses.push(Address::from_ip(ip));
        }
    }

    Ok(addresses)
}

/// Pod-scoped addresses. StatefulSet pods carry `spec.subdomain` (their
/// governing service), which yields the service and pod FQDNs; deployments
/// only get their pod IPs unless a subdomain is configured explicitly.
pub(crate) fn pod_addresses(
    pod: &Pod,
    namespace: &str,
    cluster_domain: &str,
) -> Result<Vec<Address>> {
    let mut addresses = Vec::new();

    let subdomain = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.subdomain.as_deref())
        .unwrap_or_default();
    if !subdomain.is_empty() {
        let pod_name = pod.name_any();
        addresses.push(Address::from_hostname(service_fqdn(
            subdomain,
            namespace,
            cluster_domain,
        )));
        addresses.push(Address::from_hostname(service_fqdn(
            &format!("{pod_name}.{subdomain}"),
            namespace,
            cluster_domain,
        )));
    }

    for pod_ip in pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ips.as_ref())
        .into_iter()
        .flatten()
    {
        let ip = pod_ip
            .ip
            .as_deref()
            .unwrap_or_default()
            .parse::<IpAddr>()
            .ok()
            .context(InvalidPodIpSnafu {
                ip: pod_ip.ip.clone().unwrap_or_default(),
                pod: pod.name_any(),
            })?;
        addresses.push(Address::from_ip(ip));
    }

    Ok(addresses)
}

/// Maps pod volume names to claim names. Ephemeral volumes are named after
/// the pod and the volume name, persistent volume claims after the claim.
pub(crate) fn volume_names_to_pvc_names(pod: &Pod) -> HashMap<String, String> {
    let pod_name = pod.name_any();
    let mut mapping = HashMap::new();

    for volume in pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .into_iter()
        .flatten()
    {
        if volume.ephemeral.is_some() {
            mapping.insert(volume.name.clone(), format!("{pod_name}-{}", volume.name));
        } else if let Some(pvc) = &volume.persistent_volume_claim {
            mapping.insert(volume.name.clone(), pvc.claim_name.clone());
        }
    }

    mapping
}

pub(crate) fn listener_ingress_addresses(
    listener: &Listener,
    listener_name: &str,
) -> Result<Vec<Address>> {
    use crate::crd::AddressType;

    let namespace = listener.namespace().unwrap_or_default();
    let ingress_addresses = listener
        .status
        .as_ref()
        .and_then(|status| status.ingress_addresses.as_ref())
        .filter(|addresses| !addresses.is_empty())
        .context(ListenerNotReadySnafu {
            namespace: namespace.clone(),
            listener: listener_name.to_string(),
        })?;

    let mut addresses = Vec::new();
    for ingress in ingress_addresses {
        match ingress.address_type {
            AddressType::Hostname => addresses.push(Address::from_hostname(&ingress.address)),
            AddressType::Ip => {
                let ip = ingress
                    .address
                    .parse::<IpAddr>()
                    .ok()
                    .context(InvalidListenerIpSnafu {
                        address: ingress.address.clone(),
                        listener: listener_name.to_string(),
                    })?;
                addresses.push(Address::from_ip(ip));
            }
        }
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AddressType, ListenerIngress, ListenerStatus};

    fn pod_fixture() -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "airflow-0", "namespace": "default" },
            "spec": {
                "nodeName": "node-1",
                "subdomain": "airflow",
                "volumes": [
                    { "name": "tls", "ephemeral": { "volumeClaimTemplate": { "spec": {} } } },
                    { "name": "listener", "persistentVolumeClaim": { "claimName": "airflow-listener" } },
                    { "name": "config", "configMap": { "name": "airflow-config" } }
                ]
            },
            "status": {
                "podIPs": [ { "ip": "10.244.0.13" } ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn pod_addresses_with_subdomain() {
        let addresses = pod_addresses(&pod_fixture(), "default", "cluster.local").unwrap();

        assert_eq!(
            addresses,
            vec![
                Address::from_hostname("airflow.default.svc.cluster.local"),
                Address::from_hostname("airflow-0.airflow.default.svc.cluster.local"),
                Address::from_ip("10.244.0.13".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn pod_addresses_use_the_configured_cluster_domain() {
        let addresses = pod_addresses(&pod_fixture(), "default", "mycluster.example").unwrap();

        assert_eq!(
            addresses[0],
            Address::from_hostname("airflow.default.svc.mycluster.example")
        );
    }

    #[test]
    fn pod_addresses_invalid_ip_fails() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "broken", "namespace": "default" },
            "status": { "podIPs": [ { "ip": "not-an-ip" } ] }
        }))
        .unwrap();

        assert!(pod_addresses(&pod, "default", "cluster.local").is_err());
    }

    #[test]
    fn node_addresses_filter_by_type() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "node-1" },
            "status": {
                "addresses": [
                    { "type": "InternalIP", "address": "192.168.1.10" },
                    { "type": "ExternalIP", "address": "203.0.113.7" },
                    { "type": "Hostname", "address": "node-1.example" }
                ]
            }
        }))
        .unwrap();

        let addresses = node_addresses(&node).unwrap();
        assert_eq!(
            addresses,
            vec![
                Address::from_hostname("node-1"),
                Address::from_ip("192.168.1.10".parse().unwrap()),
                Address::from_ip("203.0.113.7".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn node_addresses_invalid_ip_fails() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "node-1" },
            "status": {
                "addresses": [ { "type": "InternalIP", "address": "not-an-ip" } ]
            }
        }))
        .unwrap();

        assert!(node_addresses(&node).is_err());
    }

    #[test]
    fn volume_mapping_handles_ephemeral_and_pvc() {
        let mapping = volume_names_to_pvc_names(&pod_fixture());

        assert_eq!(mapping["tls"], "airflow-0-tls");
        assert_eq!(mapping["listener"], "airflow-listener");
        assert!(!mapping.contains_key("config"));
    }

    #[test]
    fn listener_without_ingress_is_not_ready() {
        let listener = Listener {
            metadata: Default::default(),
            spec: Default::default(),
            status: Some(ListenerStatus::default()),
        };

        assert!(matches!(
            listener_ingress_addresses(&listener, "l0"),
            Err(Error::ListenerNotReady { .. })
        ));
    }

    #[test]
    fn listener_ingress_addresses_resolve() {
        let listener = Listener {
            metadata: Default::default(),
            spec: Default::default(),
            status: Some(ListenerStatus {
                ingress_addresses: Some(vec![
                    ListenerIngress {
                        address: "host-a.example.com".to_string(),
                        address_type: AddressType::Hostname,
                        ports: Default::default(),
                    },
                    ListenerIngress {
                        address: "203.0.113.20".to_string(),
                        address_type: AddressType::Ip,
                        ports: Default::default(),
                    },
                ]),
                ..Default::default()
            }),
        };

        let addresses = listener_ingress_addresses(&listener, "l0").unwrap();
        assert_eq!(
            addresses,
            vec![
                Address::from_hostname("host-a.example.com"),
                Address::from_ip("203.0.113.20".parse().unwrap()),
            ]
        );
    }
}
