//! Credentials file for the trusted token backend
//!
//! The file is JSON: `{"issuer": "...", "secret": "..."}`. Its absence is not an
//! error: the relay falls back to dev mode.

use crate::auth::{IdentityVerifier, SignedTokenBackend};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Default location of the credentials file, relative to the working directory
pub const DEFAULT_CREDENTIALS_PATH: &str = "credentials.json";

/// Length of generated secrets in bytes
const SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read credentials file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write credentials file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode credentials for {path}: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("credentials file {path} has an empty {field}")]
    Empty { path: PathBuf, field: &'static str },
}

/// Issuer name and signing secret shared with the token issuer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub issuer: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(issuer: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            secret: secret.into(),
        }
    }

    /// Generate credentials with a fresh random secret
    pub fn generate(issuer: impl Into<String>) -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::rng().fill(&mut bytes);

        Self::new(issuer, URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Load credentials from `path`; `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>, CredentialsError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialsError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let credentials: Self =
            serde_json::from_str(&contents).map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if credentials.issuer.is_empty() {
            return Err(CredentialsError::Empty {
                path: path.to_path_buf(),
                field: "issuer",
            });
        }
        if credentials.secret.is_empty() {
            return Err(CredentialsError::Empty {
                path: path.to_path_buf(),
                field: "secret",
            });
        }

        Ok(Some(credentials))
    }

    /// Write credentials as pretty JSON, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<(), CredentialsError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| CredentialsError::Encode {
            path: path.to_path_buf(),
            source,
        })?;

        write_private(path, json.as_bytes()).map_err(|source| CredentialsError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn backend(&self) -> SignedTokenBackend {
        SignedTokenBackend::new(self.issuer.clone(), self.secret.as_bytes().to_vec())
    }
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path)?;
    // mode() only applies on create; tighten a pre-existing file too
    #[cfg(unix)]
    file.set_permissions(fs::Permissions::from_mode(0o600))?;

    file.write_all(contents)
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("issuer", &self.issuer)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl IdentityVerifier {
    /// Build the verifier from the credentials file at `path`
    ///
    /// A missing file yields a dev-mode verifier; a broken one is an error.
    pub fn from_credentials_file(path: &Path) -> Result<Self, CredentialsError> {
        match Credentials::load(path)? {
            Some(credentials) => {
                info!(path = %path.display(), issuer = %credentials.issuer, "Credential backend initialized");
                Ok(Self::trusted(Arc::new(credentials.backend())))
            }
            None => {
                warn!(
                    path = %path.display(),
                    "No credentials file found; accepting unverified connections (dev mode)"
                );
                Ok(Self::dev_unverified())
            }
        }
    }
}
