//! Manages the certificate authorities backing the autoTls backend.
//!
//! CAs are persisted in a cluster-wide Secret as PEM key pairs under the
//! keys `<n>.ca.crt` / `<n>.ca.key`, where `n` is the rank after sorting
//! ascending by `notAfter`. The whole load-modify-store sequence runs under
//! the process-wide CA write lock and restarts from the beginning on an
//! optimistic-concurrency conflict from the API server.
use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};

use k8s_openapi::{
    ByteString,
    api::core::v1::{ConfigMap, Secret},
};
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
use kubedoop_certs::{
    CertificatePair,
    ca::{CertificateAuthority, SubjectAlternativeNames},
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument, warn};
use x509_cert::{Certificate, der::Decode};

use super::{SecretBackendError, SharedLocks, kube_error_code};
use crate::crd::{AdditionalTrustRootSpec, AutoTlsSpec, ConfigMapReference, SecretReference};

const CA_CERT_SUFFIX: &str = ".crt";
const CA_KEY_SUFFIX: &str = ".key";
const TRUST_ANCHOR_PEM_SUFFIX: &str = ".crt";
const TRUST_ANCHOR_DER_SUFFIX: &str = ".der";

const MAX_CONFLICT_RETRIES: usize = 5;
const CONFLICT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Key length used when the SecretClass configures no `keyGeneration`.
const DEFAULT_KEY_LENGTH: usize = 2048;

/// Key lengths accepted from the SecretClass `keyGeneration.rsa.length`.
const PERMITTED_KEY_LENGTHS: [usize; 3] = [2048, 3072, 4096];

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get CA secret {secret:?}"))]
    GetCaSecret { source: kube::Error, secret: String },

    #[snafu(display("failed to decode certificate authority under key {key:?}"))]
    DecodeCertificateAuthority {
        source: kubedoop_certs::ca::Error,
        key: String,
    },

    #[snafu(display(
        "no live certificate authority found in secret {secret:?} and auto-generate is disabled, please create one manually"
    ))]
    NoCaAvailable { secret: String },

    #[snafu(display(
        "no certificate authority in secret {secret:?} outlives the maximum certificate lifetime"
    ))]
    NoUsableCa { secret: String },

    #[snafu(display("failed to create self-signed certificate authority"))]
    CreateCertificateAuthority { source: kubedoop_certs::ca::Error },

    #[snafu(display("failed to rotate certificate authority"))]
    RotateCertificateAuthority { source: kubedoop_certs::ca::Error },

    #[snafu(display(
        "cannot save certificate authorities to secret {secret:?} because auto-generate is disabled"
    ))]
    WriteForbidden { secret: String },

    #[snafu(display("failed to serialize certificate authority"))]
    SerializeCertificateAuthority { source: kubedoop_certs::Error },

    #[snafu(display("failed to save CA secret {secret:?}"))]
    SaveCaSecret { source: kube::Error, secret: String },

    #[snafu(display("conflict while saving CA secret {secret:?}"))]
    SaveConflict { secret: String },

    #[snafu(display("failed to get trust root config map {config_map:?}"))]
    GetTrustRootConfigMap {
        source: kube::Error,
        config_map: String,
    },

    #[snafu(display("failed to get trust root secret {secret:?}"))]
    GetTrustRootSecret { source: kube::Error, secret: String },

    #[snafu(display("failed to decode trust anchor under key {key:?}"))]
    DecodeTrustAnchor {
        source: x509_cert::der::Error,
        key: String,
    },

    #[snafu(display(
        "unsupported trust anchor format for key {key:?}, must end with .crt or .der"
    ))]
    UnsupportedTrustAnchor { key: String },

    #[snafu(display("failed to sign leaf certificate"))]
    SignCertificate { source: kubedoop_certs::ca::Error },

    #[snafu(display(
        "unsupported RSA key length {length}, must be one of {PERMITTED_KEY_LENGTHS:?}"
    ))]
    UnsupportedKeyLength { length: usize },
}

impl SecretBackendError for Error {
    fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::NoCaAvailable { .. }
            | Error::NoUsableCa { .. }
            | Error::WriteForbidden { .. }
            | Error::UnsupportedKeyLength { .. } => tonic::Code::FailedPrecondition,
            Error::UnsupportedTrustAnchor { .. } => tonic::Code::InvalidArgument,
            Error::GetCaSecret { source, .. }
            | Error::GetTrustRootConfigMap { source, .. }
            | Error::GetTrustRootSecret { source, .. } => kube_error_code(source),
            _ => tonic::Code::Internal,
        }
    }
}

/// Signs leaf certificates against the CA Secret referenced by one
/// SecretClass, seeding and rotating the stored CAs as needed.
pub struct CertificateManager {
    client: Client,
    secret_ref: SecretReference,
    auto_generate: bool,
    ca_certificate_lifetime: Duration,
    max_certificate_lifetime: Duration,
    additional_trust_roots: Vec<AdditionalTrustRootSpec>,
    rsa_key_length: usize,

    authorities: Vec<CertificateAuthority>,
    /// Index into `authorities`, frozen at construction time.
    selected: usize,
}

impl CertificateManager {
    /// Opens the CA store: loads the backing Secret, drops expired CAs,
    /// seeds or rotates when necessary and persists changes, all under the
    /// injected CA write lock with a bounded conflict-retry loop.
    #[instrument(skip_all, fields(secret = %spec.ca.secret.name))]
    pub async fn new(client: Client, spec: &AutoTlsSpec, locks: &SharedLocks) -> Result<Self> {
        let rsa_key_length = spec
            .ca
            .key_generation
            .as_ref()
            .and_then(|key_generation| key_generation.rsa.as_ref())
            .map(|rsa| rsa.length)
            .unwrap_or(DEFAULT_KEY_LENGTH);
        ensure!(
            PERMITTED_KEY_LENGTHS.contains(&rsa_key_length),
            UnsupportedKeyLengthSnafu {
                length: rsa_key_length,
            }
        );

        let mut manager = Self {
            client,
            secret_ref: spec.ca.secret.clone(),
            auto_generate: spec.ca.auto_generate,
            ca_certificate_lifetime: *spec.ca.ca_certificate_life_time,
            max_certificate_lifetime: *spec.max_certificate_life_time,
            additional_trust_roots: spec.additional_trust_roots.clone(),
            rsa_key_length,
            authorities: Vec::new(),
            selected: 0,
        };

        let _write_guard = locks.ca_write.lock().await;

        let mut attempt = 0;
        loop {
            match manager.load_and_reconcile().await {
                Ok(()) => break,
                Err(error @ Error::SaveConflict { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_CONFLICT_RETRIES {
                        return Err(error);
                    }
                    debug!(attempt, "CA secret conflict, restarting from load");
                    tokio::time::sleep(CONFLICT_RETRY_BACKOFF).await;
                }
                Err(error) => return Err(error),
            }
        }

        manager.selected = select_signing_ca(
            &manager.authorities,
            SystemTime::now(),
            manager.max_certificate_lifetime,
        )
        .context(NoUsableCaSnafu {
            secret: manager.secret_ref.name.clone(),
        })?;

        Ok(manager)
    }

    /// One pass of load → filter → seed → rotate → persist. Returns
    /// [`Error::SaveConflict`] when the API server rejected the write with
    /// an optimistic-concurrency error so the caller restarts the pass.
    async fn load_and_reconcile(&mut self) -> Result<()> {
        let stored = self.fetch_ca_secret().await?;
        let data = stored
            .as_ref()
            .and_then(|secret| secret.data.clone())
            .unwrap_or_default();

        let mut authorities = decode_authorities(&data)?;
        let mut dirty = false;

        if authorities.is_empty() {
            ensure!(
                self.auto_generate,
                NoCaAvailableSnafu {
                    secret: self.secret_ref.name.clone(),
                }
            );

            info!(
                secret = %self.secret_ref.name,
                "no live certificate authority found, creating a self-signed one"
            );
            authorities.push(
                CertificateAuthority::new_self_signed(
                    self.ca_certificate_lifetime,
                    self.rsa_key_length,
                )
                .context(CreateCertificateAuthoritySnafu)?,
            );
            dirty = true;
        }

        sort_authorities(&mut authorities);

        let newest = authorities.last().expect("authorities are never empty here");
        if needs_rotation(
            SystemTime::now(),
            newest.not_after(),
            self.ca_certificate_lifetime,
        ) {
            if self.auto_generate {
                info!(
                    secret = %self.secret_ref.name,
                    "rotating certificate authority, the newest one is about to expire"
                );
                let rotated = newest
                    .rotate(self.ca_certificate_lifetime, self.rsa_key_length)
                    .context(RotateCertificateAuthoritySnafu)?;
                authorities.push(rotated);
                sort_authorities(&mut authorities);
                dirty = true;
            } else {
                warn!(
                    secret = %self.secret_ref.name,
                    "certificate authority is about to expire but auto-generate is disabled, please rotate manually"
                );
            }
        }

        if dirty {
            self.save(stored, &authorities).await?;
        }

        self.authorities = authorities;
        Ok(())
    }

    async fn fetch_ca_secret(&self) -> Result<Option<Secret>> {
        let secrets = Api::<Secret>::namespaced(self.client.clone(), &self.secret_ref.namespace);
        match secrets.get(&self.secret_ref.name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(source) => Err(Error::GetCaSecret {
                source,
                secret: self.secret_ref.name.clone(),
            }),
        }
    }

    /// Writes the re-numbered key pairs back, creating the Secret when it
    /// does not exist yet. A 409 from the API server maps to
    /// [`Error::SaveConflict`].
    async fn save(&self, stored: Option<Secret>, authorities: &[CertificateAuthority]) -> Result<()> {
        ensure!(
            self.auto_generate,
            WriteForbiddenSnafu {
                secret: self.secret_ref.name.clone(),
            }
        );

        let data = authorities_to_secret_data(authorities)?;
        let secrets = Api::<Secret>::namespaced(self.client.clone(), &self.secret_ref.namespace);

        let result = match stored {
            Some(mut secret) => {
                secret.data = Some(data);
                secrets
                    .replace(&self.secret_ref.name, &PostParams::default(), &secret)
                    .await
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(self.secret_ref.name.clone()),
                        namespace: Some(self.secret_ref.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                secrets.create(&PostParams::default(), &secret).await
            }
        };

        match result {
            Ok(_) => {
                debug!(secret = %self.secret_ref.name, "saved certificate authorities");
                Ok(())
            }
            // 409 covers both a concurrent update and a concurrent create.
            Err(kube::Error::Api(response)) if response.code == 409 => SaveConflictSnafu {
                secret: self.secret_ref.name.clone(),
            }
            .fail(),
            Err(source) => Err(Error::SaveCaSecret {
                source,
                secret: self.secret_ref.name.clone(),
            }),
        }
    }

    /// All in-store CA certificates (no private keys) plus the configured
    /// additional trust roots.
    pub async fn trust_anchors(&self) -> Result<Vec<Certificate>> {
        let mut anchors: Vec<Certificate> = self
            .authorities
            .iter()
            .map(|authority| authority.ca_cert().clone())
            .collect();

        for trust_root in &self.additional_trust_roots {
            if let Some(config_map_ref) = &trust_root.config_map {
                anchors.extend(self.config_map_trust_anchors(config_map_ref).await?);
            }
            if let Some(secret_ref) = &trust_root.secret {
                anchors.extend(self.secret_trust_anchors(secret_ref).await?);
            }
        }

        Ok(anchors)
    }

    async fn config_map_trust_anchors(
        &self,
        reference: &ConfigMapReference,
    ) -> Result<Vec<Certificate>> {
        let config_maps = Api::<ConfigMap>::namespaced(self.client.clone(), &reference.namespace);
        let config_map =
            config_maps
                .get(&reference.name)
                .await
                .context(GetTrustRootConfigMapSnafu {
                    config_map: reference.name.clone(),
                })?;

        let mut anchors = Vec::new();
        for (key, value) in config_map.data.iter().flatten() {
            anchors.extend(decode_trust_anchor(key, value.as_bytes())?);
        }
        for (key, value) in config_map.binary_data.iter().flatten() {
            anchors.extend(decode_trust_anchor(key, &value.0)?);
        }

        debug!(config_map = %reference.name, count = anchors.len(), "loaded trust anchors");
        Ok(anchors)
    }

    async fn secret_trust_anchors(&self, reference: &SecretReference) -> Result<Vec<Certificate>> {
        let secrets = Api::<Secret>::namespaced(self.client.clone(), &reference.namespace);
        let secret = secrets
            .get(&reference.name)
            .await
            .context(GetTrustRootSecretSnafu {
                secret: reference.name.clone(),
            })?;

        let mut anchors = Vec::new();
        for (key, value) in secret.data.iter().flatten() {
            anchors.extend(decode_trust_anchor(key, &value.0)?);
        }

        debug!(secret = %reference.name, count = anchors.len(), "loaded trust anchors");
        Ok(anchors)
    }

    pub fn max_certificate_lifetime(&self) -> Duration {
        self.max_certificate_lifetime
    }

    fn selected_ca(&self) -> &CertificateAuthority {
        &self.authorities[self.selected]
    }

    /// Signs a server (and client) authentication certificate for the
    /// scoped addresses.
    pub fn sign_server_certificate(
        &self,
        sans: &SubjectAlternativeNames,
        lifetime: Duration,
    ) -> Result<CertificatePair> {
        self.selected_ca()
            .sign_server_certificate(sans, lifetime, self.rsa_key_length)
            .context(SignCertificateSnafu)
    }
}

/// Decodes the paired `<prefix>.crt` / `<prefix>.key` entries, ignoring
/// unpaired keys and dropping expired CAs.
fn decode_authorities(data: &BTreeMap<String, ByteString>) -> Result<Vec<CertificateAuthority>> {
    let now = SystemTime::now();
    let mut authorities = Vec::new();

    for (key, certificate) in data {
        let Some(prefix) = key.strip_suffix(CA_CERT_SUFFIX) else {
            continue;
        };
        let Some(private_key) = data.get(&format!("{prefix}{CA_KEY_SUFFIX}")) else {
            warn!(key = %key, "certificate has no matching private key, ignoring it");
            continue;
        };

        let authority = CertificateAuthority::from_pem(&certificate.0, &private_key.0)
            .context(DecodeCertificateAuthoritySnafu { key: key.clone() })?;

        if authority.not_after() < now {
            warn!(key = %key, "certificate authority is expired, skipping it");
            continue;
        }

        authorities.push(authority);
    }

    Ok(authorities)
}

/// Sorts ascending by `notAfter`, the order the store format is numbered
/// in.
fn sort_authorities(authorities: &mut [CertificateAuthority]) {
    authorities.sort_by_key(CertificateAuthority::not_after);
}

/// A CA is rotated once it has burned through more than half of the
/// configured CA lifetime.
fn needs_rotation(now: SystemTime, newest_not_after: SystemTime, ca_lifetime: Duration) -> bool {
    now + ca_lifetime / 2 > newest_not_after
}

/// Picks the oldest CA which still outlives any leaf certificate it will
/// sign, i.e. whose `notAfter` lies beyond `now + max_certificate_lifetime`.
fn select_signing_ca(
    authorities: &[CertificateAuthority],
    now: SystemTime,
    max_certificate_lifetime: Duration,
) -> Option<usize> {
    let cutoff = now + max_certificate_lifetime;
    authorities
        .iter()
        .position(|authority| authority.not_after() > cutoff)
}

/// Serializes sorted authorities back into the store layout, re-numbered
/// from zero.
fn authorities_to_secret_data(
    authorities: &[CertificateAuthority],
) -> Result<BTreeMap<String, ByteString>> {
    let mut data = BTreeMap::new();

    for (rank, authority) in authorities.iter().enumerate() {
        let pair = authority.certificate_pair();
        data.insert(
            format!("{rank}.ca{CA_CERT_SUFFIX}"),
            ByteString(
                pair.certificate_pem()
                    .context(SerializeCertificateAuthoritySnafu)?
                    .into_bytes(),
            ),
        );
        data.insert(
            format!("{rank}.ca{CA_KEY_SUFFIX}"),
            ByteString(
                pair.private_key_pem()
                    .context(SerializeCertificateAuthoritySnafu)?
                    .into_bytes(),
            ),
        );
    }

    Ok(data)
}

/// `.crt` keys hold PEM (possibly a concatenated chain), `.der` keys hold
/// a single raw DER certificate.
fn decode_trust_anchor(key: &str, data: &[u8]) -> Result<Vec<Certificate>> {
    if key.ends_with(TRUST_ANCHOR_PEM_SUFFIX) {
        Certificate::load_pem_chain(data).context(DecodeTrustAnchorSnafu { key })
    } else if key.ends_with(TRUST_ANCHOR_DER_SUFFIX) {
        Ok(vec![
            Certificate::from_der(data).context(DecodeTrustAnchorSnafu { key })?,
        ])
    } else {
        UnsupportedTrustAnchorSnafu { key }.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    // Generating full-size RSA keys dominates test runtime.
    const TEST_KEY_LENGTH: usize = 512;

    fn authority(validity: Duration) -> CertificateAuthority {
        CertificateAuthority::new_self_signed(validity, TEST_KEY_LENGTH).unwrap()
    }

    fn secret_data(authorities: &[CertificateAuthority]) -> BTreeMap<String, ByteString> {
        authorities_to_secret_data(authorities).unwrap()
    }

    #[test]
    fn round_trip_preserves_order() {
        let mut authorities = vec![authority(2 * HOUR), authority(HOUR)];
        sort_authorities(&mut authorities);
        assert!(authorities[0].not_after() <= authorities[1].not_after());

        let data = secret_data(&authorities);
        assert_eq!(
            data.keys().cloned().collect::<Vec<_>>(),
            vec!["0.ca.crt", "0.ca.key", "1.ca.crt", "1.ca.key"]
        );

        let decoded = decode_authorities(&data).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].ca_cert(), authorities[0].ca_cert());
        assert_eq!(decoded[1].ca_cert(), authorities[1].ca_cert());
    }

    #[test]
    fn unpaired_entries_are_ignored() {
        let mut data = secret_data(&[authority(HOUR)]);
        data.remove("0.ca.key");
        data.insert("orphan.key".to_string(), ByteString(b"junk".to_vec()));

        let decoded = decode_authorities(&data).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn expired_authorities_are_dropped() {
        let expired = authority(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(50));

        let data = secret_data(&[expired]);
        let decoded = decode_authorities(&data).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn rotation_predicate() {
        let now = SystemTime::now();
        let lifetime = 720 * HOUR;

        // Expiring in one hour, lifetime half is 360h: must rotate.
        assert!(needs_rotation(now, now + HOUR, lifetime));
        // Expiring well beyond the half-life: no rotation.
        assert!(!needs_rotation(now, now + 700 * HOUR, lifetime));
    }

    #[test]
    fn signing_ca_is_the_oldest_that_outlives_leaves() {
        let now = SystemTime::now();
        let mut authorities = vec![authority(10 * HOUR), authority(HOUR)];
        sort_authorities(&mut authorities);

        // Only the long-lived CA outlives a two-hour leaf.
        assert_eq!(select_signing_ca(&authorities, now, 2 * HOUR), Some(1));
        // Both qualify for very short leaves, the oldest wins.
        assert_eq!(
            select_signing_ca(&authorities, now, Duration::from_secs(60)),
            Some(0)
        );
        // Nothing outlives a 20-hour leaf.
        assert_eq!(select_signing_ca(&authorities, now, 20 * HOUR), None);
    }

    #[test]
    fn trust_anchor_suffix_dispatch() {
        let ca = authority(HOUR);
        let pem = ca.certificate_pair().certificate_pem().unwrap();
        let der = ca.certificate_pair().certificate_der().unwrap();

        assert_eq!(decode_trust_anchor("my.crt", pem.as_bytes()).unwrap().len(), 1);
        assert_eq!(decode_trust_anchor("my.der", &der).unwrap().len(), 1);
        assert!(matches!(
            decode_trust_anchor("my.pem", pem.as_bytes()),
            Err(Error::UnsupportedTrustAnchor { .. })
        ));
    }
}
