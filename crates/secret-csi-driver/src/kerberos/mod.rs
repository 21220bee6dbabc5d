//! Kerberos plumbing: `krb5.conf` synthesis and the `kadmin` subprocess
//! driver used to create principals and extract keytabs.
mod config;
pub(crate) mod kadmin;

pub use config::*;
pub use kadmin::*;
