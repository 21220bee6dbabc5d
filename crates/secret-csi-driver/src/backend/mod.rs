//! Secret provisioning backends and their dispatcher.
//!
//! A [`SecretBackend`] is resolved once per CSI call from the SecretClass
//! spec variant and produces the files to mount plus an optional expiry.
use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use kube::Client;
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

use crate::{
    crd::SecretClass,
    pod_info::PodInfo,
    volume::SecretVolumeContext,
};

pub mod autotls;
pub mod ca;
pub mod k8s_search;
pub mod kerberos;

pub use autotls::AutoTlsBackend;
pub use k8s_search::K8sSearchBackend;
pub use kerberos::KerberosBackend;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps backend failures onto the gRPC status codes surfaced at the CSI
/// boundary.
pub trait SecretBackendError: std::error::Error {
    fn grpc_code(&self) -> tonic::Code;
}

/// Maps a Kubernetes API error: a missing object surfaces as NotFound,
/// everything else is internal.
pub(crate) fn kube_error_code(error: &kube::Error) -> tonic::Code {
    match error {
        kube::Error::Api(response) if response.code == 404 => tonic::Code::NotFound,
        _ => tonic::Code::Internal,
    }
}

impl SecretBackendError for crate::pod_info::Error {
    fn grpc_code(&self) -> tonic::Code {
        use crate::pod_info::Error;

        match self {
            Error::ListenerNotReady { .. } => tonic::Code::Unavailable,
            Error::InvalidNodeIp { .. }
            | Error::InvalidPodIp { .. }
            | Error::InvalidListenerIp { .. } => tonic::Code::InvalidArgument,
            Error::GetPvc { source, .. }
            | Error::GetListener { source, .. }
            | Error::GetListenerClass { source, .. } => kube_error_code(source),
            Error::ListenerClassMissing { .. } => tonic::Code::Internal,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("secret class {class:?} configures no backend"))]
    NoBackendVariant { class: String },

    #[snafu(display("failed to provision auto-TLS secret"))]
    AutoTls { source: autotls::Error },

    #[snafu(display("failed to provision Kerberos keytab"))]
    Kerberos { source: kerberos::Error },

    #[snafu(display("failed to search matching secret"))]
    K8sSearch { source: k8s_search::Error },
}

impl SecretBackendError for Error {
    fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::NoBackendVariant { .. } => tonic::Code::InvalidArgument,
            Error::AutoTls { source } => source.grpc_code(),
            Error::Kerberos { source } => source.grpc_code(),
            Error::K8sSearch { source } => source.grpc_code(),
        }
    }
}

/// The files produced by a backend, plus the instant after which the pod
/// should be restarted to refresh them.
#[derive(Debug, Default)]
pub struct SecretContents {
    pub data: BTreeMap<String, Vec<u8>>,
    pub expires_at: Option<SystemTime>,
}

impl SecretContents {
    pub fn new(data: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Process-wide locks shared by all CSI calls, injected at construction
/// time so tests can instantiate their own.
///
/// `ca_write` guards every CA-Secret mutation from this driver instance;
/// `kadmin` serialises principal creation because the remote kadmin is not
/// robust against concurrent `addprinc` for the same principal.
#[derive(Clone, Debug, Default)]
pub struct SharedLocks {
    pub ca_write: Arc<Mutex<()>>,
    pub kadmin: Arc<Mutex<()>>,
}

/// The closed set of provisioning backends.
pub enum SecretBackend {
    AutoTls(AutoTlsBackend),
    KerberosKeytab(KerberosBackend),
    K8sSearch(K8sSearchBackend),
}

impl SecretBackend {
    /// Resolves the backend from the SecretClass spec variant. The first
    /// configured variant wins, in the order autoTls, kerberosKeytab,
    /// k8sSearch.
    pub async fn new(
        client: Client,
        secret_class: &SecretClass,
        locks: SharedLocks,
    ) -> Result<Self> {
        let backend = &secret_class.spec.backend;

        if let Some(auto_tls) = &backend.auto_tls {
            let backend = AutoTlsBackend::new(client, auto_tls.clone(), locks)
                .await
                .context(AutoTlsSnafu)?;
            return Ok(SecretBackend::AutoTls(backend));
        }

        if let Some(kerberos_keytab) = &backend.kerberos_keytab {
            let backend = KerberosBackend::new(client, kerberos_keytab.clone(), locks)
                .await
                .context(KerberosSnafu)?;
            return Ok(SecretBackend::KerberosKeytab(backend));
        }

        if let Some(k8s_search) = &backend.k8s_search {
            return Ok(SecretBackend::K8sSearch(K8sSearchBackend::new(
                client,
                k8s_search.clone(),
            )));
        }

        NoBackendVariantSnafu {
            class: kube::ResourceExt::name_any(secret_class),
        }
        .fail()
    }

    /// Produces the secret files for one volume.
    pub async fn secret_data(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<SecretContents> {
        match self {
            SecretBackend::AutoTls(backend) => backend
                .secret_data(pod_info, context)
                .await
                .context(AutoTlsSnafu),
            SecretBackend::KerberosKeytab(backend) => backend
                .secret_data(pod_info, context)
                .await
                .context(KerberosSnafu),
            SecretBackend::K8sSearch(backend) => backend
                .secret_data(pod_info, context)
                .await
                .context(K8sSearchSnafu),
        }
    }

    /// The nodes on which already provisioned secrets for this selector
    /// live. Only the k8sSearch backend pins pods to nodes; the generating
    /// backends can serve any node.
    pub async fn qualified_node_names(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<Vec<String>> {
        match self {
            SecretBackend::AutoTls(_) | SecretBackend::KerberosKeytab(_) => Ok(Vec::new()),
            SecretBackend::K8sSearch(backend) => backend
                .qualified_node_names(pod_info, context)
                .await
                .context(K8sSearchSnafu),
        }
    }
}
