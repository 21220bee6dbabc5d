//! Drives the MIT `kadmin` client against a remote KDC.
//!
//! The admin principal must carry the `xe` permissions in `kadm5.acl`:
//! `x` (or `admin`) for `addprinc`, `e` for `ktadd -norandkey`.
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu, ensure};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::Krb5Config;

const KRB5_CONFIG_ENV: &str = "KRB5_CONFIG";

/// `kadmin` reports an existing principal with this phrase; creation is
/// treated idempotently.
const ALREADY_EXISTS_MARKER: &str = "already exists";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to write krb5.conf"))]
    WriteKrb5Config { source: super::config::Error },

    #[snafu(display("failed to write admin keytab"))]
    WriteAdminKeytab { source: std::io::Error },

    #[snafu(display("failed to move admin keytab to {path:?}"))]
    PersistAdminKeytab {
        source: tempfile::PersistError,
        path: PathBuf,
    },

    #[snafu(display("failed to create temporary keytab file"))]
    CreateKeytabTempFile { source: std::io::Error },

    #[snafu(display("failed to spawn kadmin"))]
    SpawnKadmin { source: std::io::Error },

    #[snafu(display("kadmin query {query:?} failed with status {code:?}: {output}"))]
    KadminFailed {
        query: String,
        code: Option<i32>,
        output: String,
    },

    #[snafu(display("failed to read generated keytab"))]
    ReadKeytab { source: std::io::Error },
}

impl Error {
    /// Whether the failure only reports an already existing principal.
    fn is_already_exists(&self) -> bool {
        matches!(self, Error::KadminFailed { output, .. } if output.contains(ALREADY_EXISTS_MARKER))
    }
}

/// A `kadmin` invocation context: the realm configuration plus the admin
/// credentials read from the SecretClass-referenced Secret.
pub struct Kadmin {
    krb5_config: Krb5Config,
    admin_principal: String,
    admin_keytab: Vec<u8>,
}

impl Kadmin {
    pub fn new(krb5_config: Krb5Config, admin_principal: String, admin_keytab: Vec<u8>) -> Self {
        Self {
            krb5_config,
            admin_principal,
            admin_keytab,
        }
    }

    /// Writes the admin keytab to a content-addressed temp path, reusing
    /// an existing file.
    fn admin_keytab_path(&self) -> Result<PathBuf> {
        let digest = Sha256::digest(&self.admin_keytab);
        let path = std::env::temp_dir()
            .join(format!("admin-keytab-{}.keytab", hex::encode(&digest[..12])));

        if path.exists() {
            return Ok(path);
        }

        let file = tempfile::NamedTempFile::new_in(std::env::temp_dir())
            .context(WriteAdminKeytabSnafu)?;
        std::fs::write(file.path(), &self.admin_keytab).context(WriteAdminKeytabSnafu)?;
        file.persist(&path)
            .context(PersistAdminKeytabSnafu { path: path.clone() })?;

        Ok(path)
    }

    /// Executes one `kadmin … query <query>` invocation, e.g.
    /// `kadmin -kt admin.keytab -p admin/admin query "addprinc -randkey foo"`.
    ///
    /// `KRB5_CONFIG` points at the class-specific configuration. Dropping
    /// the future (CSI call cancellation) kills the subprocess.
    #[instrument(skip(self))]
    pub async fn query(&self, query: &str) -> Result<String> {
        let krb5_config_path = self.krb5_config.materialize().context(WriteKrb5ConfigSnafu)?;
        let admin_keytab_path = self.admin_keytab_path()?;

        let output = Command::new("kadmin")
            .arg("-kt")
            .arg(&admin_keytab_path)
            .arg("-p")
            .arg(&self.admin_principal)
            .arg("query")
            .arg(query)
            .env(KRB5_CONFIG_ENV, &krb5_config_path)
            .kill_on_drop(true)
            .output()
            .await
            .context(SpawnKadminSnafu)?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        ensure!(
            output.status.success(),
            KadminFailedSnafu {
                query: query.to_string(),
                code: output.status.code(),
                output: combined.clone(),
            }
        );

        debug!(query, output = %combined, "executed kadmin query");
        Ok(combined)
    }

    /// Creates a principal with a random key. Both a created and an
    /// already existing principal count as success; the remote kadmin is
    /// not robust against concurrent creation of the same principal, so
    /// callers serialise this through the shared kadmin lock.
    #[instrument(skip(self))]
    pub async fn add_principal(&self, principal: &str) -> Result<()> {
        match self.query(&format!("addprinc -randkey {principal}")).await {
            Ok(output) => {
                info!(principal, output = %output, "added principal");
                Ok(())
            }
            Err(error) if error.is_already_exists() => {
                debug!(principal, "principal already exists");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Extracts a keytab covering all given principals with a single
    /// `ktadd -norandkey` call, leaving the principal keys in the KDC
    /// untouched.
    #[instrument(skip(self))]
    pub async fn ktadd(&self, principals: &[String]) -> Result<Vec<u8>> {
        let keytab_file = tempfile::NamedTempFile::new().context(CreateKeytabTempFileSnafu)?;
        let keytab_path = keytab_file.path().to_string_lossy().into_owned();

        let query = format!("ktadd -k {keytab_path} -norandkey {}", principals.join(" "));
        let output = self.query(&query).await?;
        info!(?principals, output = %output, "saved keytab");

        tokio::fs::read(keytab_file.path())
            .await
            .context(ReadKeytabSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_is_detected() {
        let error = Error::KadminFailed {
            query: "addprinc -randkey foo".to_string(),
            code: Some(1),
            output: "add_principal: Principal or policy already exists while creating \"foo@EXAMPLE.COM\"."
                .to_string(),
        };
        assert!(error.is_already_exists());

        let error = Error::KadminFailed {
            query: "addprinc -randkey foo".to_string(),
            code: Some(1),
            output: "kadmin: Communication failure with server".to_string(),
        };
        assert!(!error.is_already_exists());
    }
}
