//! Custom resources consumed by the driver.
//!
//! [`SecretClass`] is the cluster-scoped configuration object selecting a
//! secret backend; the listener resources are consumed read-only to resolve
//! listener-volume scopes.
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::duration::Duration;

mod listener;
pub use listener::*;

/// A SecretClass configures the provisioning backend for the secret volumes
/// referencing it.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "secrets.kubedoop.dev",
    version = "v1alpha1",
    kind = "SecretClass",
    plural = "secretclasses"
)]
#[serde(rename_all = "camelCase")]
pub struct SecretClassSpec {
    pub backend: BackendSpec,
}

/// Exactly one backend variant must be set.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_tls: Option<AutoTlsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_search: Option<K8sSearchSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kerberos_keytab: Option<KerberosKeytabSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoTlsSpec {
    /// Configures the certificate authority used to issue pod certificates.
    pub ca: CaSpec,

    /// Maximum lifetime of a leaf certificate; requested lifetimes are
    /// clamped to this value.
    #[serde(default = "AutoTlsSpec::default_max_certificate_lifetime")]
    pub max_certificate_life_time: Duration,

    /// Additional trust roots added to the `ca.crt` / truststore next to
    /// the operator-managed CAs. Keys with suffix `.crt` are parsed as PEM,
    /// keys with suffix `.der` as raw DER.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_trust_roots: Vec<AdditionalTrustRootSpec>,
}

impl AutoTlsSpec {
    fn default_max_certificate_lifetime() -> Duration {
        Duration::from_hours(360)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaSpec {
    /// Reference to the Secret where the CA key pairs are stored.
    pub secret: SecretReference,

    /// Whether the operator may create and rotate CAs on its own. When
    /// false, the CA Secret must be maintained manually and the operator
    /// never writes to it.
    #[serde(default)]
    pub auto_generate: bool,

    /// Lifetime of newly generated CA certificates.
    #[serde(default = "CaSpec::default_ca_certificate_lifetime")]
    pub ca_certificate_life_time: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_generation: Option<KeyGenerationSpec>,
}

impl CaSpec {
    fn default_ca_certificate_lifetime() -> Duration {
        Duration::from_hours(8760)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyGenerationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa: Option<RsaKeyGenerationSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RsaKeyGenerationSpec {
    /// Key length in bits, one of 2048, 3072 or 4096.
    pub length: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalTrustRootSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretReference>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sSearchSpec {
    pub search_namespace: SearchNamespaceSpec,
}

/// Either a fixed namespace name, or the namespace of the pod mounting the
/// volume.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchNamespaceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodNamespaceSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PodNamespaceSpec {}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KerberosKeytabSpec {
    /// Hostname (and optional port) of the key distribution center.
    pub kdc: String,

    /// The Kerberos realm, uppercased when rendered into `krb5.conf`.
    pub realm_name: String,

    /// Principal used to administer the KDC, e.g. `admin/admin`. It must
    /// carry the `xe` permissions in `kadm5.acl`.
    pub admin_principal: String,

    /// Secret containing the admin keytab under the `keytab` key.
    pub admin_keytab_secret: SecretReference,

    pub admin: AdminServerSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminServerSpec {
    /// MIT Kerberos admin server.
    pub mit: MitAdminSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MitAdminSpec {
    /// The hostname of the kadmin server.
    pub kadmin_server: String,
}
