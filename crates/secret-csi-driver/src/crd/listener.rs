//! Read-only views of the listener-operator resources. Only the fields the
//! scope resolver consumes are modelled.
use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Exposes a set of pods, either internally to the cluster or to the
/// outside world. The mechanism for how it is exposed is managed by the
/// [`ListenerClass`].
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "listeners.kubedoop.dev",
    version = "v1alpha1",
    kind = "Listener",
    plural = "listeners",
    status = "ListenerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    /// The name of the ListenerClass.
    pub class_name: Option<String>,

    /// Ports that should be exposed.
    pub ports: Option<Vec<ListenerPort>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerPort {
    pub name: String,
    pub port: i32,
    pub protocol: Option<String>,
}

/// Informs users about how to reach the Listener.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    /// The backing Kubernetes Service.
    pub service_name: Option<String>,

    /// All addresses that the Listener is currently reachable from.
    pub ingress_addresses: Option<Vec<ListenerIngress>>,

    /// Port mappings for accessing the Listener on each Node.
    pub node_ports: Option<BTreeMap<String, i32>>,
}

/// One address that a Listener is accessible from.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerIngress {
    /// The hostname or IP address to the Listener.
    pub address: String,

    /// The type of address (`Hostname` or `IP`).
    pub address_type: AddressType,

    /// Port mapping table.
    #[serde(default)]
    pub ports: BTreeMap<String, i32>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum AddressType {
    Hostname,
    #[serde(rename = "IP")]
    Ip,
}

/// Defines how listeners referencing this class are exposed; listeners of a
/// `NodePort` class pin their pods to the nodes the secret was issued for.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "listeners.kubedoop.dev",
    version = "v1alpha1",
    kind = "ListenerClass",
    plural = "listenerclasses"
)]
#[serde(rename_all = "camelCase")]
pub struct ListenerClassSpec {
    /// The Kubernetes Service type backing the listeners, e.g. `NodePort`
    /// or `LoadBalancer`.
    pub service_type: Option<String>,
}
