//! Key material used for signing CAs and leaf certificates.
//!
//! The CA Secret format is fixed to PKCS#1 RSA key pairs, so RSA is the only
//! supported algorithm.
pub mod rsa;
