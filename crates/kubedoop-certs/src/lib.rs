//! This crate provides types and functions to work with the X.509 material
//! managed by the secret operator: certificate authorities (CAs) stored as
//! PEM key pairs, and the short-lived leaf certificates they sign for pods.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://cabforum.org/uploads/CA-Browser-Forum-TLS-BRs-v2.0.2.pdf>
use std::time::SystemTime;

use snafu::{ResultExt, Snafu};
use x509_cert::{
    Certificate,
    der::{Encode, EncodePem, pem::LineEnding},
};

use crate::keys::rsa::SigningKey;

pub mod ca;
pub mod keys;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error variants which can be encountered when serializing a
/// [`CertificatePair`].
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificatePem { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize certificate as DER"))]
    SerializeCertificateDer { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize private key as PKCS#1"))]
    SerializePrivateKey { source: rsa::pkcs1::Error },
}

/// A certificate and the RSA key pair bound to it.
///
/// [`ca::CertificateAuthority`] uses this internally to hold the signing key
/// pair which signs the CA itself and all child leaf certificates. Leaf
/// certificates use it to hold the generated pod key pair.
#[derive(Clone, Debug)]
pub struct CertificatePair {
    certificate: Certificate,
    key_pair: SigningKey,
}

impl CertificatePair {
    pub fn new(certificate: Certificate, key_pair: SigningKey) -> Self {
        Self {
            certificate,
            key_pair,
        }
    }

    /// Returns a reference to the [`Certificate`].
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a reference to the bound key pair.
    pub fn key_pair(&self) -> &SigningKey {
        &self.key_pair
    }

    /// The instant after which the certificate is no longer valid.
    pub fn not_after(&self) -> SystemTime {
        self.certificate
            .tbs_certificate
            .validity
            .not_after
            .to_system_time()
    }

    /// The certificate, PEM encoded.
    pub fn certificate_pem(&self) -> Result<String> {
        self.certificate
            .to_pem(LineEnding::LF)
            .context(SerializeCertificatePemSnafu)
    }

    /// The certificate, DER encoded.
    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        self.certificate.to_der().context(SerializeCertificateDerSnafu)
    }

    /// The private key as a PEM-encoded PKCS#1 `RSA PRIVATE KEY` block.
    pub fn private_key_pem(&self) -> Result<String> {
        self.key_pair.to_pkcs1_pem().context(SerializePrivateKeySnafu)
    }

    /// The private key as PKCS#1 DER.
    pub fn private_key_der(&self) -> Result<Vec<u8>> {
        self.key_pair.to_pkcs1_der().context(SerializePrivateKeySnafu)
    }
}

/// Serializes a certificate without key material, for trust anchor lists.
pub fn certificate_pem(certificate: &Certificate) -> Result<String> {
    certificate
        .to_pem(LineEnding::LF)
        .context(SerializeCertificatePemSnafu)
}

/// Serializes a certificate as DER, for PKCS#12 stores.
pub fn certificate_der(certificate: &Certificate) -> Result<Vec<u8>> {
    certificate.to_der().context(SerializeCertificateDerSnafu)
}
