//! Application identity hashing.
//!
//! Every process launched for the same application must arrive at the same
//! [`Identifier`], because it names both the shared memory segment and the
//! primary's socket endpoint. The digest input is:
//!
//! ```text
//! SHA-256( salt
//!        ‖ app_name ‖ org_name ‖ org_domain
//!        [‖ extra_tokens joined]        if any tokens
//!        [‖ version]                    if Some
//!        [‖ executable_path]            if Some (lower-cased on Windows)
//!        [‖ user_name] )                if Some
//! ```
//!
//! The digest is encoded as standard base64 with `/` replaced by `_` so the
//! result is a valid file name.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Salt prefixed to every digest. Changing it partitions all deployed instances.
pub const IDENTITY_SALT: &[u8] = b"SingleApplication";

/// Inputs to the identifier hash.
///
/// `None` for an optional field means "excluded from the hash", which is how
/// the version, path and per-user scoping switches are expressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppIdentity {
    pub app_name: String,
    pub org_name: String,
    pub org_domain: String,
    pub extra_tokens: Vec<String>,
    pub version: Option<String>,
    pub executable_path: Option<PathBuf>,
    pub user_name: Option<String>,
}

impl AppIdentity {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }
}

/// Hash-derived name shared by the coordination block and the local socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    pub fn derive(identity: &AppIdentity) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(IDENTITY_SALT);
        hasher.update(identity.app_name.as_bytes());
        hasher.update(identity.org_name.as_bytes());
        hasher.update(identity.org_domain.as_bytes());

        if !identity.extra_tokens.is_empty() {
            hasher.update(identity.extra_tokens.concat().as_bytes());
        }
        if let Some(version) = &identity.version {
            hasher.update(version.as_bytes());
        }
        if let Some(path) = &identity.executable_path {
            let path = path.to_string_lossy();
            if cfg!(windows) {
                hasher.update(path.to_lowercase().as_bytes());
            } else {
                hasher.update(path.as_bytes());
            }
        }
        if let Some(user) = &identity.user_name {
            hasher.update(user.as_bytes());
        }

        let encoded = STANDARD.encode(hasher.finalize()).replace('/', "_");
        Self(encoded)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
