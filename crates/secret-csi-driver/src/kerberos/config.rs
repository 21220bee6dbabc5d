//! Builds the `krb5.conf` handed to `kadmin` and mounted into pods.
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tracing::debug;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create temporary file for krb5.conf"))]
    CreateTempFile { source: std::io::Error },

    #[snafu(display("failed to write krb5.conf"))]
    WriteConfig { source: std::io::Error },

    #[snafu(display("failed to move krb5.conf to {path:?}"))]
    PersistConfig {
        source: tempfile::PersistError,
        path: PathBuf,
    },
}

/// The client-side Kerberos configuration for one SecretClass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Krb5Config {
    pub realm: String,
    pub kdc: String,
    pub admin_server: String,
}

impl Krb5Config {
    /// The realm, uppercased as required by Kerberos conventions.
    pub fn realm(&self) -> String {
        self.realm.to_uppercase()
    }

    /// Renders the `krb5.conf` content: `default_realm` plus a single
    /// `[realms]` stanza pointing at the class KDC and admin server.
    pub fn content(&self) -> String {
        let realm = self.realm();
        format!(
            "[libdefaults]\n\
             default_realm = {realm}\n\
             \n\
             [realms]\n\
             {realm} = {{\n  \
             kdc = {kdc}\n  \
             admin_server = {admin_server}\n\
             }}\n",
            kdc = self.kdc,
            admin_server = self.admin_server,
        )
    }

    /// Materialises the config at a content-addressed path in the OS temp
    /// directory and reuses it on subsequent calls. Concurrent writers
    /// produce byte-identical files and the final rename is atomic.
    pub fn materialize(&self) -> Result<PathBuf> {
        let content = self.content();
        let digest = Sha256::digest(content.as_bytes());
        let path = std::env::temp_dir().join(format!("krb5-{}.conf", hex::encode(&digest[..12])));

        if path.exists() {
            return Ok(path);
        }

        let file = tempfile::NamedTempFile::new_in(std::env::temp_dir())
            .context(CreateTempFileSnafu)?;
        std::fs::write(file.path(), content.as_bytes()).context(WriteConfigSnafu)?;
        file.persist(&path).context(PersistConfigSnafu { path: path.clone() })?;

        debug!(path = %path.display(), "materialized krb5.conf");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Krb5Config {
        Krb5Config {
            realm: "example.com".to_string(),
            kdc: "kdc.example.com:88".to_string(),
            admin_server: "kadmin.example.com:749".to_string(),
        }
    }

    #[test]
    fn realm_is_uppercased() {
        assert_eq!(config().realm(), "EXAMPLE.COM");
    }

    #[test]
    fn content_has_default_realm_and_realms_stanza() {
        let content = config().content();

        assert!(content.contains("default_realm = EXAMPLE.COM"));
        assert!(content.contains("EXAMPLE.COM = {"));
        assert!(content.contains("kdc = kdc.example.com:88"));
        assert!(content.contains("admin_server = kadmin.example.com:749"));
    }

    #[test]
    fn materialized_path_is_content_addressed() {
        let first = config().materialize().unwrap();
        let second = config().materialize().unwrap();
        assert_eq!(first, second);

        let other = Krb5Config {
            realm: "other.com".to_string(),
            ..config()
        }
        .materialize()
        .unwrap();
        assert_ne!(first, other);

        assert_eq!(std::fs::read_to_string(&first).unwrap(), config().content());
    }
}
