//! The autoTls backend: signs a leaf certificate for the scoped addresses
//! against the class CA and encodes it in the requested format.
use std::time::{Duration, SystemTime};

use kube::Client;
use kubedoop_certs::ca::SubjectAlternativeNames;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, instrument};

use super::{SecretBackendError, SecretContents, SharedLocks, ca::CertificateManager};
use crate::{
    crd::AutoTlsSpec,
    format,
    pod_info::{self, Address, PodInfo},
    volume::{SecretFormat, SecretVolumeContext},
};

/// Requested leaf lifetime when the volume context does not set one.
pub const DEFAULT_CERT_LIFETIME: Duration = Duration::from_secs(168 * 60 * 60);

/// Slack subtracted from the certificate lifetime so the restart controller
/// can recycle the pod before the certificate expires.
pub const DEFAULT_CERT_RESTART_BUFFER: Duration = Duration::from_secs(8 * 60 * 60);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to open certificate manager"))]
    CertificateManager { source: super::ca::Error },

    #[snafu(display("failed to resolve scoped addresses"))]
    ScopedAddresses { source: pod_info::Error },

    #[snafu(display(
        "effective certificate lifetime {effective:?} does not outlive the restart buffer {restart_buffer:?}"
    ))]
    LifetimeTooShort {
        effective: Duration,
        restart_buffer: Duration,
    },

    #[snafu(display("failed to sign certificate"))]
    SignCertificate { source: super::ca::Error },

    #[snafu(display("failed to collect trust anchors"))]
    TrustAnchors { source: super::ca::Error },

    #[snafu(display("format {format} cannot be served by the autoTls backend"))]
    FormatMismatch { format: String },

    #[snafu(display("PKCS#12 output requires a password in the volume context"))]
    MissingPkcs12Password,

    #[snafu(display("failed to encode secret files"))]
    EncodeFiles { source: format::Error },
}

impl SecretBackendError for Error {
    fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::LifetimeTooShort { .. } => tonic::Code::FailedPrecondition,
            Error::FormatMismatch { .. } | Error::MissingPkcs12Password => {
                tonic::Code::InvalidArgument
            }
            Error::ScopedAddresses { source } => source.grpc_code(),
            Error::CertificateManager { source }
            | Error::SignCertificate { source }
            | Error::TrustAnchors { source } => source.grpc_code(),
            Error::EncodeFiles { .. } => tonic::Code::Internal,
        }
    }
}

pub struct AutoTlsBackend {
    certificate_manager: CertificateManager,
}

impl AutoTlsBackend {
    pub async fn new(client: Client, spec: AutoTlsSpec, locks: SharedLocks) -> Result<Self> {
        let certificate_manager = CertificateManager::new(client, &spec, &locks)
            .await
            .context(CertificateManagerSnafu)?;

        Ok(Self {
            certificate_manager,
        })
    }

    #[instrument(skip_all, fields(pod = %pod_info.pod_name()))]
    pub async fn secret_data(
        &self,
        pod_info: &PodInfo,
        context: &SecretVolumeContext,
    ) -> Result<SecretContents> {
        let addresses = pod_info
            .scoped_addresses()
            .await
            .context(ScopedAddressesSnafu)?;
        let sans = addresses_to_sans(&addresses);

        let lifetime = LeafLifetime::compute(
            context
                .auto_tls_cert_lifetime
                .map(Into::into)
                .unwrap_or(DEFAULT_CERT_LIFETIME),
            self.certificate_manager.max_certificate_lifetime(),
            context.cert_jitter_factor(),
            context
                .auto_tls_cert_restart_buffer
                .map(Into::into)
                .unwrap_or(DEFAULT_CERT_RESTART_BUFFER),
            SystemTime::now(),
            rand::random::<f64>(),
        )?;
        debug!(
            effective = ?lifetime.effective,
            "computed effective certificate lifetime"
        );

        let leaf = self
            .certificate_manager
            .sign_server_certificate(&sans, lifetime.effective)
            .context(SignCertificateSnafu)?;
        let trust_anchors = self
            .certificate_manager
            .trust_anchors()
            .await
            .context(TrustAnchorsSnafu)?;

        let files = match context.format.unwrap_or(SecretFormat::TlsPem) {
            SecretFormat::TlsPem => {
                format::tls_pem_files(&leaf, &trust_anchors).context(EncodeFilesSnafu)?
            }
            SecretFormat::TlsP12 => {
                let password = context
                    .tls_pkcs12_password
                    .as_deref()
                    .context(MissingPkcs12PasswordSnafu)?;
                format::tls_p12_files(&leaf, &trust_anchors, password).context(EncodeFilesSnafu)?
            }
            format @ SecretFormat::Kerberos => {
                return FormatMismatchSnafu {
                    format: format.to_string(),
                }
                .fail();
            }
        };

        Ok(SecretContents::new(files).with_expiry(lifetime.pod_expires))
    }
}

/// The jittered certificate lifetime and the derived pod expiry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct LeafLifetime {
    pub effective: Duration,
    pub pod_expires: SystemTime,
}

impl LeafLifetime {
    /// Clamps the requested lifetime to the class maximum, subtracts a
    /// random jitter of up to `jitter_factor` of the lifetime, and places
    /// the pod expiry one restart buffer before the certificate expiry.
    pub fn compute(
        requested: Duration,
        max_certificate_lifetime: Duration,
        jitter_factor: f64,
        restart_buffer: Duration,
        now: SystemTime,
        jitter_random: f64,
    ) -> Result<Self> {
        let requested = requested.min(max_certificate_lifetime);
        let jitter = requested.mul_f64(jitter_factor * jitter_random);
        let effective = requested - jitter;

        let certificate_expires = now + effective;
        let pod_expires = certificate_expires
            .checked_sub(restart_buffer)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        ensure!(
            pod_expires > now,
            LifetimeTooShortSnafu {
                effective,
                restart_buffer,
            }
        );

        Ok(Self {
            effective,
            pod_expires,
        })
    }
}

fn addresses_to_sans(addresses: &[Address]) -> SubjectAlternativeNames {
    let mut sans = SubjectAlternativeNames::default();

    for address in addresses {
        if let Some(hostname) = address.hostname() {
            sans.dns_names.push(hostname.to_string());
        }
        if let Some(ip) = address.ip() {
            sans.ip_addresses.push(ip);
        }
    }

    sans
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn lifetime_is_clamped_to_the_class_maximum() {
        let now = SystemTime::now();
        let lifetime =
            LeafLifetime::compute(500 * HOUR, 360 * HOUR, 0.2, 8 * HOUR, now, 0.0).unwrap();

        assert_eq!(lifetime.effective, 360 * HOUR);
        assert_eq!(lifetime.pod_expires, now + 352 * HOUR);
    }

    #[test]
    fn jitter_shortens_the_lifetime() {
        let now = SystemTime::now();
        let lifetime = LeafLifetime::compute(100 * HOUR, 360 * HOUR, 0.5, HOUR, now, 0.5).unwrap();

        // 100h - (100h * 0.5 * 0.5) = 75h
        assert_eq!(lifetime.effective, 75 * HOUR);
        assert!(lifetime.pod_expires < now + 100 * HOUR);
    }

    #[test]
    fn too_short_lifetime_fails() {
        let now = SystemTime::now();
        let result = LeafLifetime::compute(6 * HOUR, 360 * HOUR, 0.2, 8 * HOUR, now, 0.0);

        assert!(matches!(result, Err(Error::LifetimeTooShort { .. })));
    }

    #[test]
    fn addresses_map_to_sans() {
        let addresses = vec![
            Address::from_hostname("pod.ns.svc.cluster.local"),
            Address::from_ip("10.0.0.1".parse().unwrap()),
        ];

        let sans = addresses_to_sans(&addresses);
        assert_eq!(sans.dns_names, vec!["pod.ns.svc.cluster.local"]);
        assert_eq!(sans.ip_addresses, vec!["10.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    }
}
