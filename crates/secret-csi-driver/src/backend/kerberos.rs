//! The kerberosKeytab backend: provisions a keytab covering all scoped
//! principals, created idempotently against the class KDC.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, instrument};

use super::{SecretBackendError, SecretContents, SharedLocks, kube_error_code};
use crate::{
    crd::KerberosKeytabSpec,
    format::{KEYTAB_FILE, KRB5_CONF_FILE},
    kerberos::{Kadmin, Krb5Config},
    pod_info::{self, Address, PodInfo},
    volume::{SecretFormat, SecretVolumeContext},
};

/// Key of the admin keytab inside the referenced Secret.
const ADMIN_KEYTAB_KEY: &str = "keytab";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get admin keytab secret {secret:?}"))]
    GetAdminKeytabSecret { source: kube::Error, secret: String },

    #[snafu(display("admin keytab secret {secret:?} has no {ADMIN_KEYTAB_KEY:?} entry"))]
    MissingAdminKeytab { secret: String },

    #[snafu(display("failed to resolve scoped addresses"))]
    ScopedAddresses { source: pod_info::Error },

    #[snafu(display("scope produces no Kerberos principals, it must cover at least one hostname"))]
    NoPrincipals,

    #[snafu(display("format {format} cannot be served by the kerberosKeytab backend"))]
    FormatMismatch { format: String },

    #[snafu(display("kadmin failed"))]
    Kadmin { source: crate::kerberos::kadmin::Error },
}

impl SecretBackendError for Error {
    fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::GetAdminKeytabSecret { source, .. } => kube_error_code(source),
            Error::MissingAdminKeytab { .. } => tonic::Code::FailedPrecondition,
            Error::ScopedAddresses { source } => source.grpc_code(),
            Error::NoPrincipals | Error::FormatMismatch { .. } => tonic::Code::InvalidArgument,
            Error::Kadmin { .. } => tonic::Code::Internal,
        }
    }
}

pub struct KerberosBackend {
    krb5_config: Krb5Config,
    kadmin: Kadmin,
    locks: SharedLocks,
}

impl KerberosBackend {
    pub async fn new(client: Client, spec: KerberosKeytabSpec, locks: SharedLocks) -> Result<Self> {
        let secrets =
            Api::<Secret>::namespaced(client, &spec.admin_keytab_secret.namespace);
        let keytab_secret = secrets
            .get(&spec.admin_keytab_secret.name)
            .await
            .context(GetAdminKeytabSecretSnafu {
                secret: spec.admin_keytab_secret.name.clone(),
            })?;

        let admin_keytab = keytab_secret
            .data
            .as_ref()
            .and_then(|data| data.get(ADMIN_KEYTAB_KEY))
            .context(MissingAdminKeytabSnafu {
                secret: spec.admin_keytab_secret.name.clone(),
            })?
            .0
            .clone();

        let krb5_config = Krb5Config {
            realm: spec.realm_name,
            kdc: spec.kdc,
            admin_server: spec.admin.mit.kadmin_server,
        };
        let kadmin = Kadmin::new(krb5_config.clone(), spec.admin_principal, admin_keytab);

        Ok(Self {
            krb5_config,
            kadmin,
            locks,
        })
    }

    #[instrument(skip_all, fields(pod = %pod_info.pod_name()))]
    pub async fn secret_data(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<SecretContents> {
        if let Some(format) = context.format {
            ensure!(
                format == SecretFormat::Kerberos,
                FormatMismatchSnafu {
                    format: format.to_string(),
                }
            );
        }

        let addresses = pod_info
            .scoped_addresses()
            .await
            .context(ScopedAddressesSnafu)?;
        let principals = principals_for(
            &context.kerberos_service_names,
            &addresses,
            &self.krb5_config.realm(),
        );
        ensure!(!principals.is_empty(), NoPrincipalsSnafu);
        debug!(?principals, "synthesized principals");

        // addprinc is not safe to run concurrently for the same principal,
        // ktadd over distinct keytab files is.
        {
            let _kadmin_guard = self.locks.kadmin.lock().await;
            for principal in &principals {
                self.kadmin
                    .add_principal(principal)
                    .await
                    .context(KadminSnafu)?;
            }
        }

        let keytab = self.kadmin.ktadd(&principals).await.context(KadminSnafu)?;

        Ok(SecretContents::new(BTreeMap::from([
            (KEYTAB_FILE.to_string(), keytab),
            (
                KRB5_CONF_FILE.to_string(),
                self.krb5_config.content().into_bytes(),
            ),
        ])))
    }
}

/// The Cartesian product `service × hostname@REALM` over all scoped
/// addresses carrying a hostname. IP-only addresses cannot name a service
/// principal and are ignored.
fn principals_for(service_names: &[String], addresses: &[Address], realm: &str) -> Vec<String> {
    let mut principals = Vec::new();

    for service_name in service_names {
        for address in addresses {
            if let Some(hostname) = address.hostname() {
                principals.push(format!("{service_name}/{hostname}@{realm}"));
            }
        }
    }

    principals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principals_are_the_cartesian_product() {
        let services = vec!["HTTP".to_string(), "nn".to_string()];
        let addresses = vec![
            Address::from_hostname("host-a.example.com"),
            Address::from_ip("10.0.0.1".parse().unwrap()),
            Address::from_hostname("host-b.example.com"),
        ];

        let principals = principals_for(&services, &addresses, "EXAMPLE.COM");
        assert_eq!(
            principals,
            vec![
                "HTTP/host-a.example.com@EXAMPLE.COM",
                "HTTP/host-b.example.com@EXAMPLE.COM",
                "nn/host-a.example.com@EXAMPLE.COM",
                "nn/host-b.example.com@EXAMPLE.COM",
            ]
        );
    }

    #[test]
    fn ip_only_scope_produces_no_principals() {
        let services = vec!["HTTP".to_string()];
        let addresses = vec![Address::from_ip("10.0.0.1".parse().unwrap())];

        assert!(principals_for(&services, &addresses, "EXAMPLE.COM").is_empty());
    }
}
