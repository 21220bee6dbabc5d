use std::time::Duration;

/// Subject of every CA certificate generated by the secret operator.
pub const ROOT_CA_SUBJECT: &str = "CN=secret-operator self-signed CA";

/// Subject of every leaf certificate. Intentionally a fixed placeholder:
/// the identity of the pod is carried by the critical SAN extension.
pub const LEAF_CERTIFICATE_SUBJECT: &str = "CN=generated certificate for pod";

/// Default CA validity of one year, used when the SecretClass does not
/// configure `caCertificateLifetime`.
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(8760 * 60 * 60);
