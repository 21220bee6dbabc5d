//! Contains types and functions to generate, rotate and sign with
//! certificate authorities (CAs).
use std::{net::IpAddr, str::FromStr, time::Duration};

use const_oid::{
    AssociatedOid, ObjectIdentifier,
    db::rfc5280::{ID_CE_BASIC_CONSTRAINTS, ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH},
};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{
        Decode, DecodePem, Encode, Length, Writer,
        asn1::{Ia5String, OctetString},
        pem::LineEnding,
    },
    ext::{
        AsExtension, Extension,
        pkix::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
            SubjectAltName, SubjectKeyIdentifier, name::GeneralName,
        },
    },
    name::Name,
    serial_number::SerialNumber,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::Validity,
};

use crate::{CertificatePair, keys::rsa::SigningKey};

mod consts;
pub use consts::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Defines all error variants which can occur when creating a CA and/or leaf
/// certificates.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate RSA signing key"))]
    GenerateRsaSigningKey { source: crate::keys::rsa::Error },

    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },

    #[snafu(display("failed to encode SubjectPublicKeyInfo as DER"))]
    EncodeSpki { source: x509_cert::der::Error },

    #[snafu(display("failed to encode key identifier"))]
    EncodeKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display(
        "failed to parse subject alternative DNS name \"{subject_alternative_dns_name}\" as a Ia5 string"
    ))]
    ParseSubjectAlternativeDnsName {
        subject_alternative_dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to read PEM-encoded certificate chain"))]
    ReadChain { source: x509_cert::der::Error },

    #[snafu(display("PEM-encoded certificate chain contains no certificate"))]
    EmptyChain,

    #[snafu(display("failed to deserialize private key from PEM-encoded PKCS#1"))]
    DeserializeKeyFromPem { source: crate::keys::rsa::Error },

    #[snafu(display("certificate is not a certificate authority"))]
    NotCertificateAuthority,
}

/// Whether a leaf certificate authenticates a server or a client. This
/// selects the extended key usage set of the signed certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateUsage {
    Server,
    Client,
}

impl CertificateUsage {
    fn extended_key_usage(&self) -> Vec<ObjectIdentifier> {
        match self {
            CertificateUsage::Server => vec![ID_KP_SERVER_AUTH, ID_KP_CLIENT_AUTH],
            CertificateUsage::Client => vec![ID_KP_CLIENT_AUTH],
        }
    }
}

/// The identities a leaf certificate authenticates, emitted as the subject
/// alternative name (SAN) extension.
#[derive(Clone, Debug, Default)]
pub struct SubjectAlternativeNames {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub email_addresses: Vec<String>,
    pub uris: Vec<String>,
}

impl SubjectAlternativeNames {
    fn general_names(&self) -> Result<Vec<GeneralName>> {
        let mut names = Vec::new();

        for dns_name in &self.dns_names {
            let ia5 = Ia5String::new(dns_name).context(ParseSubjectAlternativeDnsNameSnafu {
                subject_alternative_dns_name: dns_name.clone(),
            })?;
            names.push(GeneralName::DnsName(ia5));
        }

        for ip_address in &self.ip_addresses {
            // IPv4 addresses are encoded as 4 octets, IPv6 as 16.
            let octets = match ip_address {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            names.push(GeneralName::IpAddress(
                OctetString::new(octets).context(EncodeKeyIdentifierSnafu)?,
            ));
        }

        for email in &self.email_addresses {
            let ia5 = Ia5String::new(email).context(ParseSubjectAlternativeDnsNameSnafu {
                subject_alternative_dns_name: email.clone(),
            })?;
            names.push(GeneralName::Rfc822Name(ia5));
        }

        for uri in &self.uris {
            let ia5 = Ia5String::new(uri).context(ParseSubjectAlternativeDnsNameSnafu {
                subject_alternative_dns_name: uri.clone(),
            })?;
            names.push(GeneralName::UniformResourceIdentifier(ia5));
        }

        Ok(names)
    }
}

/// A [`SubjectAltName`] which is always marked critical.
///
/// RFC 5280, section 4.2.1.6 requires the SAN to be critical when the
/// subject carries no usable identity. The library heuristic only marks it
/// critical for an *empty* subject, but pod certificates use the non-empty
/// placeholder [`LEAF_CERTIFICATE_SUBJECT`], so the flag must be forced.
struct CriticalSubjectAltName(SubjectAltName);

impl AssociatedOid for CriticalSubjectAltName {
    const OID: ObjectIdentifier = SubjectAltName::OID;
}

impl Encode for CriticalSubjectAltName {
    fn encoded_len(&self) -> x509_cert::der::Result<Length> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl Writer) -> x509_cert::der::Result<()> {
        self.0.encode(writer)
    }
}

impl AsExtension for CriticalSubjectAltName {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        true
    }
}

/// A certificate authority (CA) which is used to sign the leaf certificates
/// mounted into pods, and to sign its own successor on rotation.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    certificate_pair: CertificatePair,
}

impl CertificateAuthority {
    /// Wraps an existing certificate/key pair, rejecting certificates which
    /// are not CAs.
    pub fn new(certificate_pair: CertificatePair) -> Result<Self> {
        ensure!(
            is_certificate_authority(certificate_pair.certificate()),
            NotCertificateAuthoritySnafu
        );

        Ok(Self { certificate_pair })
    }

    /// Creates a new self-signed CA certificate with subject
    /// [`ROOT_CA_SUBJECT`] and a fresh RSA key of `key_length` bits.
    #[instrument(name = "create_self_signed_certificate_authority")]
    pub fn new_self_signed(validity: Duration, key_length: usize) -> Result<Self> {
        let key_pair = SigningKey::new_with_length(key_length).context(GenerateRsaSigningKeySnafu)?;
        let certificate = build_ca_certificate(&key_pair, None, validity)?;

        debug!("created new self-signed CA certificate");
        Self::new(CertificatePair::new(certificate, key_pair))
    }

    /// Produces the successor of this CA: a new key pair whose certificate
    /// is signed by this CA, preserving the chain of trust across
    /// rotations.
    #[instrument(name = "rotate_certificate_authority", skip(self))]
    pub fn rotate(&self, validity: Duration, key_length: usize) -> Result<Self> {
        let key_pair = SigningKey::new_with_length(key_length).context(GenerateRsaSigningKeySnafu)?;
        let certificate = build_ca_certificate(&key_pair, Some(&self.certificate_pair), validity)?;

        debug!("rotated CA certificate");
        Self::new(CertificatePair::new(certificate, key_pair))
    }

    /// Deserializes a CA from the PEM blocks stored in the CA Secret:
    /// a `CERTIFICATE` block and a PKCS#1 `RSA PRIVATE KEY` block.
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<Self> {
        let mut chain =
            Certificate::load_pem_chain(certificate_pem).context(ReadChainSnafu)?;
        ensure!(!chain.is_empty(), EmptyChainSnafu);
        let certificate = chain.remove(0);

        let private_key_pem = String::from_utf8_lossy(private_key_pem);
        let key_pair =
            SigningKey::from_pkcs1_pem(&private_key_pem).context(DeserializeKeyFromPemSnafu)?;

        Self::new(CertificatePair::new(certificate, key_pair))
    }

    /// Returns the CA certificate, without key material.
    pub fn ca_cert(&self) -> &Certificate {
        self.certificate_pair.certificate()
    }

    pub fn certificate_pair(&self) -> &CertificatePair {
        &self.certificate_pair
    }

    /// The instant after which this CA is no longer valid.
    pub fn not_after(&self) -> std::time::SystemTime {
        self.certificate_pair.not_after()
    }

    /// Signs a leaf certificate usable for server and client
    /// authentication.
    #[instrument(skip(self, sans))]
    pub fn sign_server_certificate(
        &self,
        sans: &SubjectAlternativeNames,
        validity: Duration,
        key_length: usize,
    ) -> Result<CertificatePair> {
        self.sign_leaf_certificate(sans, CertificateUsage::Server, validity, key_length)
    }

    /// Signs a leaf certificate usable for client authentication only.
    #[instrument(skip(self, sans))]
    pub fn sign_client_certificate(
        &self,
        sans: &SubjectAlternativeNames,
        validity: Duration,
        key_length: usize,
    ) -> Result<CertificatePair> {
        self.sign_leaf_certificate(sans, CertificateUsage::Client, validity, key_length)
    }

    fn sign_leaf_certificate(
        &self,
        sans: &SubjectAlternativeNames,
        usage: CertificateUsage,
        validity: Duration,
        key_length: usize,
    ) -> Result<CertificatePair> {
        let key_pair = SigningKey::new_with_length(key_length).context(GenerateRsaSigningKeySnafu)?;

        let serial_number = SerialNumber::from(rand::random::<u64>());
        let validity = Validity::from_now(validity).context(ParseValiditySnafu)?;
        let subject = Name::from_str(LEAF_CERTIFICATE_SUBJECT).context(ParseSubjectSnafu {
            subject: LEAF_CERTIFICATE_SUBJECT,
        })?;

        let spki = subject_public_key_info(&key_pair)?;
        let subject_key_id = key_identifier(&spki)?;
        let authority_key_id = certificate_key_identifier(self.ca_cert())?;

        let issuer = self
            .ca_cert()
            .tbs_certificate
            .subject
            .clone();

        let signer = self.certificate_pair.key_pair().signing_key();
        let mut builder = CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(issuer),
            },
            serial_number,
            validity,
            subject,
            spki,
            signer,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: false,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(
                KeyUsages::KeyEncipherment | KeyUsages::DigitalSignature,
            ))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(usage.extended_key_usage()))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&SubjectKeyIdentifier(subject_key_id))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&AuthorityKeyIdentifier {
                key_identifier: Some(authority_key_id),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&CriticalSubjectAltName(SubjectAltName(
                sans.general_names()?,
            )))
            .context(AddCertificateExtensionSnafu)?;

        debug!("create and sign leaf certificate");
        let certificate = builder.build().context(BuildCertificateSnafu)?;

        Ok(CertificatePair::new(certificate, key_pair))
    }
}

/// Builds a CA certificate for `key_pair`. When `signer` is `None` the
/// certificate is self-signed, otherwise it is signed by the given pair
/// (rotation).
fn build_ca_certificate(
    key_pair: &SigningKey,
    signer: Option<&CertificatePair>,
    validity: Duration,
) -> Result<Certificate> {
    let serial_number = SerialNumber::from(rand::random::<u64>());
    let validity = Validity::from_now(validity).context(ParseValiditySnafu)?;

    // Every CA created by the operator carries the same subject. A rotated
    // CA therefore also keeps the issuer DN of its predecessor.
    let subject = Name::from_str(ROOT_CA_SUBJECT).context(ParseSubjectSnafu {
        subject: ROOT_CA_SUBJECT,
    })?;

    let spki = subject_public_key_info(key_pair)?;
    let subject_key_id = key_identifier(&spki)?;

    let authority_key_id = match signer {
        Some(parent) => certificate_key_identifier(parent.certificate())?,
        None => subject_key_id.clone(),
    };

    let issuer = match signer {
        Some(parent) => Some(parent.certificate().tbs_certificate.subject.clone()),
        None => None,
    };

    let signing_key = signer.map(|pair| pair.key_pair()).unwrap_or(key_pair);

    let mut builder = CertificateBuilder::new(
        Profile::Manual { issuer },
        serial_number,
        validity,
        subject,
        spki,
        signing_key.signing_key(),
    )
    .context(CreateCertificateBuilderSnafu)?;

    builder
        .add_extension(&BasicConstraints {
            ca: true,
            path_len_constraint: None,
        })
        .context(AddCertificateExtensionSnafu)?;
    builder
        .add_extension(&KeyUsage(
            KeyUsages::KeyEncipherment
                | KeyUsages::DigitalSignature
                | KeyUsages::KeyCertSign
                | KeyUsages::CRLSign,
        ))
        .context(AddCertificateExtensionSnafu)?;
    builder
        .add_extension(&SubjectKeyIdentifier(subject_key_id))
        .context(AddCertificateExtensionSnafu)?;
    builder
        .add_extension(&AuthorityKeyIdentifier {
            key_identifier: Some(authority_key_id),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        })
        .context(AddCertificateExtensionSnafu)?;

    builder.build().context(BuildCertificateSnafu)
}

fn subject_public_key_info(key_pair: &SigningKey) -> Result<SubjectPublicKeyInfoOwned> {
    let spki_pem = key_pair
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .context(SerializePublicKeySnafu)?;

    SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes()).context(DecodeSpkiFromPemSnafu)
}

/// The key identifier of a public key: the full SHA-256 digest of the
/// DER-encoded SubjectPublicKeyInfo.
fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Result<OctetString> {
    let spki_der = spki.to_der().context(EncodeSpkiSnafu)?;
    let digest = Sha256::digest(&spki_der);

    OctetString::new(digest.to_vec()).context(EncodeKeyIdentifierSnafu)
}

fn certificate_key_identifier(certificate: &Certificate) -> Result<OctetString> {
    key_identifier(&certificate.tbs_certificate.subject_public_key_info)
}

/// Checks the BasicConstraints extension for `cA = true`.
pub fn is_certificate_authority(certificate: &Certificate) -> bool {
    certificate
        .tbs_certificate
        .extensions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|extension| {
            extension.extn_id == ID_CE_BASIC_CONSTRAINTS
                && BasicConstraints::from_der(extension.extn_value.as_bytes())
                    .map(|constraints| constraints.ca)
                    .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::keys::rsa::KEY_SIZE;

    const TEST_CA_LIFETIME: Duration = Duration::from_secs(60 * 60);
    const TEST_CERT_LIFETIME: Duration = Duration::from_secs(30 * 60);
    const TEST_SAN: &str = "airflow-0.airflow.default.svc.cluster.local";

    const ID_CE_SUBJECT_ALT_NAME: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.5.29.17");

    fn test_sans() -> SubjectAlternativeNames {
        SubjectAlternativeNames {
            dns_names: vec![TEST_SAN.to_string()],
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 244, 0, 13))],
            ..Default::default()
        }
    }

    #[test]
    fn self_signed_ca_is_ca() {
        let ca = CertificateAuthority::new_self_signed(TEST_CA_LIFETIME, KEY_SIZE)
            .expect("CA generation failed");

        assert!(is_certificate_authority(ca.ca_cert()));
        assert_eq!(
            ca.ca_cert().tbs_certificate.subject,
            Name::from_str(ROOT_CA_SUBJECT).unwrap()
        );
    }

    #[test]
    fn leaf_san_is_critical() {
        let ca = CertificateAuthority::new_self_signed(TEST_CA_LIFETIME, KEY_SIZE)
            .unwrap();
        let cert = ca
            .sign_server_certificate(&test_sans(), TEST_CERT_LIFETIME, KEY_SIZE)
            .expect("leaf certificate generation failed");

        let extensions = cert
            .certificate()
            .tbs_certificate
            .extensions
            .as_ref()
            .expect("cert had no extensions");

        let san = extensions
            .iter()
            .find(|ext| ext.extn_id == ID_CE_SUBJECT_ALT_NAME)
            .expect("cert had no SAN extension");
        assert!(san.critical);
    }

    #[test]
    fn leaf_is_not_a_ca() {
        let ca = CertificateAuthority::new_self_signed(TEST_CA_LIFETIME, KEY_SIZE)
            .unwrap();
        let cert = ca
            .sign_client_certificate(&test_sans(), TEST_CERT_LIFETIME, KEY_SIZE)
            .unwrap();

        assert!(!is_certificate_authority(cert.certificate()));
        assert!(CertificateAuthority::new(cert).is_err());
    }

    #[test]
    fn leaf_lifetime_matches_request() {
        let ca = CertificateAuthority::new_self_signed(TEST_CA_LIFETIME, KEY_SIZE)
            .unwrap();
        let cert = ca
            .sign_server_certificate(&test_sans(), TEST_CERT_LIFETIME, KEY_SIZE)
            .unwrap();

        let not_before = cert
            .certificate()
            .tbs_certificate
            .validity
            .not_before
            .to_system_time();
        let not_after = cert.certificate().tbs_certificate.validity.not_after.to_system_time();
        assert_eq!(
            not_after
                .duration_since(not_before)
                .expect("notAfter must come after notBefore"),
            TEST_CERT_LIFETIME
        );
    }

    #[test]
    fn rotation_chains_to_predecessor() {
        let ca = CertificateAuthority::new_self_signed(TEST_CA_LIFETIME, KEY_SIZE)
            .unwrap();
        let rotated = ca.rotate(TEST_CA_LIFETIME, KEY_SIZE).unwrap();

        assert_eq!(
            rotated.ca_cert().tbs_certificate.issuer,
            ca.ca_cert().tbs_certificate.subject
        );
        assert!(is_certificate_authority(rotated.ca_cert()));
        // Rotation generates a fresh key pair.
        assert_ne!(
            rotated.ca_cert().tbs_certificate.subject_public_key_info,
            ca.ca_cert().tbs_certificate.subject_public_key_info
        );
    }

    #[test]
    fn pem_round_trip() {
        let ca = CertificateAuthority::new_self_signed(TEST_CA_LIFETIME, KEY_SIZE)
            .unwrap();
        let cert_pem = ca.certificate_pair().certificate_pem().unwrap();
        let key_pem = ca.certificate_pair().private_key_pem().unwrap();

        let restored =
            CertificateAuthority::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert_eq!(restored.ca_cert(), ca.ca_cert());
    }
}
