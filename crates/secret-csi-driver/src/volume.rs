//! The typed view of the flat key-value volume context accompanying every
//! CSI call. The kubelet passes the standard `csi.storage.k8s.io/*` keys,
//! the controller forwards the `secrets.kubedoop.dev/*` PVC annotations.
use std::{collections::BTreeMap, num::ParseFloatError, str::FromStr};

use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};
use tracing::warn;

use crate::duration::{self, Duration};

// Kubernetes and SIG-defined volume context keys.
pub const CSI_STORAGE_POD_NAME: &str = "csi.storage.k8s.io/pod.name";
pub const CSI_STORAGE_POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
pub const CSI_STORAGE_POD_UID: &str = "csi.storage.k8s.io/pod.uid";
pub const CSI_STORAGE_SERVICE_ACCOUNT_NAME: &str = "csi.storage.k8s.io/serviceAccount.name";
pub const CSI_STORAGE_EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";
pub const STORAGE_CSI_PROVISIONER_IDENTITY: &str = "storage.kubernetes.io/csiProvisionerIdentity";

// Kubedoop annotations, seeded from the PVC and forwarded as volume context.
pub const ANNOTATION_CLASS: &str = "secrets.kubedoop.dev/class";
pub const ANNOTATION_SCOPE: &str = "secrets.kubedoop.dev/scope";
pub const ANNOTATION_FORMAT: &str = "secrets.kubedoop.dev/format";
pub const ANNOTATION_PKCS12_PASSWORD: &str = "secrets.kubedoop.dev/tlsPKCS12Password";
pub const ANNOTATION_KERBEROS_SERVICE_NAMES: &str = "secrets.kubedoop.dev/kerberosServiceNames";
pub const ANNOTATION_CERT_LIFETIME: &str = "secrets.kubedoop.dev/autoTlsCertLifetime";
pub const ANNOTATION_CERT_JITTER_FACTOR: &str = "secrets.kubedoop.dev/autoTlsCertJitterFactor";
pub const ANNOTATION_CERT_RESTART_BUFFER: &str = "secrets.kubedoop.dev/autoTlsCertRestartBuffer";

const SCOPE_POD: &str = "pod";
const SCOPE_NODE: &str = "node";
const SCOPE_SERVICE: &str = "service";
const SCOPE_LISTENER_VOLUME: &str = "listener-volume";

const LIST_SPLITTER: char = ',';

/// Jitter factors outside of (0, 1) fall back to this value.
pub const DEFAULT_CERT_JITTER_FACTOR: f64 = 0.2;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse duration in context key {key:?}"))]
    ParseDuration {
        source: duration::Error,
        key: String,
    },

    #[snafu(display("failed to parse jitter factor {value:?}"))]
    ParseJitterFactor {
        source: ParseFloatError,
        value: String,
    },

    #[snafu(display("unsupported secret format {value:?}"))]
    UnsupportedFormat { value: String },
}

/// The mounted layout of the provisioned secret.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
pub enum SecretFormat {
    /// `tls.crt`, `tls.key` and `ca.crt` PEM files.
    #[strum(serialize = "tls-pem")]
    TlsPem,

    /// `keystore.p12` and `truststore.p12` PKCS#12 archives.
    #[strum(serialize = "tls-p12")]
    TlsP12,

    /// `keytab` and `krb5.conf`.
    #[strum(serialize = "kerberos")]
    Kerberos,
}

/// The set of identities a secret is scoped to.
///
/// Encoded in the volume context as a comma-separated list: bare `pod` /
/// `node` tokens and tagged `service=<name>` / `listener-volume=<name>`
/// tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretScope {
    pub pod: bool,
    pub node: bool,
    pub services: Vec<String>,
    pub listener_volumes: Vec<String>,
}

impl SecretScope {
    fn decode(scope: &str) -> Self {
        let mut decoded = Self::default();

        for token in scope.split(LIST_SPLITTER) {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };

            match (key, value) {
                (SCOPE_POD, None) => decoded.pod = true,
                (SCOPE_NODE, None) => decoded.node = true,
                (SCOPE_SERVICE, Some(service)) => decoded.services.push(service.to_string()),
                (SCOPE_LISTENER_VOLUME, Some(listener_volume)) => {
                    decoded.listener_volumes.push(listener_volume.to_string())
                }
                _ => warn!(token, "unknown scope token, skipping it"),
            }
        }

        decoded
    }

    /// Byte-stable encoding: `pod`, `node`, `service=…`, `listener-volume=…`
    /// in this order.
    fn encode(&self) -> String {
        let mut tokens = Vec::new();

        if self.pod {
            tokens.push(SCOPE_POD.to_string());
        }
        if self.node {
            tokens.push(SCOPE_NODE.to_string());
        }
        for service in &self.services {
            tokens.push(format!("{SCOPE_SERVICE}={service}"));
        }
        for listener_volume in &self.listener_volumes {
            tokens.push(format!("{SCOPE_LISTENER_VOLUME}={listener_volume}"));
        }

        tokens.join(",")
    }

    pub fn is_empty(&self) -> bool {
        !self.pod && !self.node && self.services.is_empty() && self.listener_volumes.is_empty()
    }
}

/// Typed selector decoded from the CSI volume context. Encoding is lossless
/// for the recognised keys; unknown keys are skipped with a warning.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecretVolumeContext {
    pub pod: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub service_account_name: String,
    pub ephemeral: String,
    pub provisioner: String,

    pub class: String,
    pub scope: SecretScope,
    pub format: Option<SecretFormat>,

    pub tls_pkcs12_password: Option<String>,
    pub kerberos_service_names: Vec<String>,
    pub auto_tls_cert_lifetime: Option<Duration>,
    pub auto_tls_cert_jitter_factor: Option<f64>,
    pub auto_tls_cert_restart_buffer: Option<Duration>,
}

impl SecretVolumeContext {
    pub fn from_map<'a, I>(parameters: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut context = Self::default();

        for (key, value) in parameters {
            match key.as_str() {
                CSI_STORAGE_POD_NAME => context.pod = value.clone(),
                CSI_STORAGE_POD_NAMESPACE => context.pod_namespace = value.clone(),
                CSI_STORAGE_POD_UID => context.pod_uid = value.clone(),
                CSI_STORAGE_SERVICE_ACCOUNT_NAME => context.service_account_name = value.clone(),
                CSI_STORAGE_EPHEMERAL => context.ephemeral = value.clone(),
                STORAGE_CSI_PROVISIONER_IDENTITY => context.provisioner = value.clone(),
                ANNOTATION_CLASS => context.class = value.clone(),
                ANNOTATION_SCOPE => context.scope = SecretScope::decode(value),
                ANNOTATION_FORMAT => {
                    context.format = Some(SecretFormat::from_str(value).map_err(|_| {
                        UnsupportedFormatSnafu { value: value.clone() }.build()
                    })?)
                }
                ANNOTATION_PKCS12_PASSWORD => context.tls_pkcs12_password = Some(value.clone()),
                ANNOTATION_KERBEROS_SERVICE_NAMES => {
                    context.kerberos_service_names =
                        value.split(LIST_SPLITTER).map(str::to_string).collect()
                }
                ANNOTATION_CERT_LIFETIME => {
                    context.auto_tls_cert_lifetime =
                        Some(value.parse().context(ParseDurationSnafu { key })?)
                }
                ANNOTATION_CERT_JITTER_FACTOR => {
                    let factor: f64 = value
                        .parse()
                        .context(ParseJitterFactorSnafu { value: value.clone() })?;
                    if factor > 0.0 && factor < 1.0 {
                        context.auto_tls_cert_jitter_factor = Some(factor);
                    } else {
                        warn!(
                            factor,
                            default = DEFAULT_CERT_JITTER_FACTOR,
                            "jitter factor outside of (0, 1), falling back to the default"
                        );
                    }
                }
                ANNOTATION_CERT_RESTART_BUFFER => {
                    context.auto_tls_cert_restart_buffer =
                        Some(value.parse().context(ParseDurationSnafu { key })?)
                }
                _ => warn!(key = %key, value = %value, "unknown volume context key, skipping it"),
            }
        }

        Ok(context)
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();

        if !self.pod.is_empty() {
            out.insert(CSI_STORAGE_POD_NAME.to_string(), self.pod.clone());
        }
        if !self.pod_namespace.is_empty() {
            out.insert(
                CSI_STORAGE_POD_NAMESPACE.to_string(),
                self.pod_namespace.clone(),
            );
        }
        if !self.pod_uid.is_empty() {
            out.insert(CSI_STORAGE_POD_UID.to_string(), self.pod_uid.clone());
        }
        if !self.service_account_name.is_empty() {
            out.insert(
                CSI_STORAGE_SERVICE_ACCOUNT_NAME.to_string(),
                self.service_account_name.clone(),
            );
        }
        if !self.ephemeral.is_empty() {
            out.insert(CSI_STORAGE_EPHEMERAL.to_string(), self.ephemeral.clone());
        }
        if !self.provisioner.is_empty() {
            out.insert(
                STORAGE_CSI_PROVISIONER_IDENTITY.to_string(),
                self.provisioner.clone(),
            );
        }
        if !self.class.is_empty() {
            out.insert(ANNOTATION_CLASS.to_string(), self.class.clone());
        }
        if !self.scope.is_empty() {
            out.insert(ANNOTATION_SCOPE.to_string(), self.scope.encode());
        }
        if let Some(format) = self.format {
            out.insert(ANNOTATION_FORMAT.to_string(), format.to_string());
        }
        if let Some(password) = &self.tls_pkcs12_password {
            out.insert(ANNOTATION_PKCS12_PASSWORD.to_string(), password.clone());
        }
        if !self.kerberos_service_names.is_empty() {
            out.insert(
                ANNOTATION_KERBEROS_SERVICE_NAMES.to_string(),
                self.kerberos_service_names.join(","),
            );
        }
        if let Some(lifetime) = self.auto_tls_cert_lifetime {
            out.insert(ANNOTATION_CERT_LIFETIME.to_string(), lifetime.to_string());
        }
        if let Some(factor) = self.auto_tls_cert_jitter_factor {
            out.insert(ANNOTATION_CERT_JITTER_FACTOR.to_string(), factor.to_string());
        }
        if let Some(buffer) = self.auto_tls_cert_restart_buffer {
            out.insert(ANNOTATION_CERT_RESTART_BUFFER.to_string(), buffer.to_string());
        }

        out
    }

    /// The jitter factor to apply, falling back to
    /// [`DEFAULT_CERT_JITTER_FACTOR`].
    pub fn cert_jitter_factor(&self) -> f64 {
        self.auto_tls_cert_jitter_factor
            .unwrap_or(DEFAULT_CERT_JITTER_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_context() -> SecretVolumeContext {
        SecretVolumeContext {
            pod: "my-pod".to_string(),
            pod_namespace: "my-namespace".to_string(),
            pod_uid: "my-uid".to_string(),
            service_account_name: "my-service-account".to_string(),
            ephemeral: "true".to_string(),
            provisioner: "my-provisioner".to_string(),
            class: "my-class".to_string(),
            scope: SecretScope {
                pod: true,
                node: true,
                services: vec!["my-service".to_string()],
                listener_volumes: vec!["my-listener-volume".to_string()],
            },
            format: Some(SecretFormat::TlsPem),
            tls_pkcs12_password: Some("my-password".to_string()),
            kerberos_service_names: vec!["HTTP".to_string(), "nn".to_string()],
            auto_tls_cert_lifetime: Some(Duration::from_hours(24)),
            auto_tls_cert_jitter_factor: Some(0.1),
            auto_tls_cert_restart_buffer: Some(Duration::from_hours(5)),
        }
    }

    #[test]
    fn to_map_full() {
        let map = full_context().to_map();

        assert_eq!(map[CSI_STORAGE_POD_NAME], "my-pod");
        assert_eq!(
            map[ANNOTATION_SCOPE],
            "pod,node,service=my-service,listener-volume=my-listener-volume"
        );
        assert_eq!(map[ANNOTATION_FORMAT], "tls-pem");
        assert_eq!(map[ANNOTATION_KERBEROS_SERVICE_NAMES], "HTTP,nn");
        assert_eq!(map[ANNOTATION_CERT_LIFETIME], "24h");
        assert_eq!(map[ANNOTATION_CERT_JITTER_FACTOR], "0.1");
        assert_eq!(map[ANNOTATION_CERT_RESTART_BUFFER], "5h");
    }

    #[test]
    fn to_map_empty() {
        assert!(SecretVolumeContext::default().to_map().is_empty());
    }

    #[test]
    fn to_map_partial_scope() {
        let context = SecretVolumeContext {
            scope: SecretScope {
                node: true,
                listener_volumes: vec!["my-listener-volume".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            context.to_map()[ANNOTATION_SCOPE],
            "node,listener-volume=my-listener-volume"
        );
    }

    #[test]
    fn round_trip() {
        let context = full_context();
        let decoded = SecretVolumeContext::from_map(&context.to_map()).unwrap();

        assert_eq!(decoded, context);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let map = BTreeMap::from([
            ("secrets.kubedoop.dev/bogus".to_string(), "x".to_string()),
            (ANNOTATION_CLASS.to_string(), "tls".to_string()),
        ]);

        let decoded = SecretVolumeContext::from_map(&map).unwrap();
        assert_eq!(decoded.class, "tls");
        assert!(decoded.to_map().get("secrets.kubedoop.dev/bogus").is_none());
    }

    #[test]
    fn malformed_duration_fails() {
        let map = BTreeMap::from([(ANNOTATION_CERT_LIFETIME.to_string(), "soon".to_string())]);
        assert!(SecretVolumeContext::from_map(&map).is_err());
    }

    #[test]
    fn unsupported_format_fails() {
        let map = BTreeMap::from([(ANNOTATION_FORMAT.to_string(), "tls-jks".to_string())]);
        assert!(SecretVolumeContext::from_map(&map).is_err());
    }

    #[test]
    fn out_of_range_jitter_factor_falls_back() {
        let map = BTreeMap::from([(ANNOTATION_CERT_JITTER_FACTOR.to_string(), "1.5".to_string())]);

        let decoded = SecretVolumeContext::from_map(&map).unwrap();
        assert_eq!(decoded.auto_tls_cert_jitter_factor, None);
        assert_eq!(decoded.cert_jitter_factor(), DEFAULT_CERT_JITTER_FACTOR);
    }
}
