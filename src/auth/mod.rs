//! Identity verification
//!
//! Every connection passes through [`IdentityVerifier::verify`] before it is
//! admitted. The verifier runs in one of two modes, chosen once at startup:
//! - `Trusted`: tokens are checked by a [`CredentialBackend`]
//! - `DevUnverified`: every token is accepted and mapped to a synthetic
//!   `dev-<token>` subject (local development without credentials)

mod credentials;
mod tokens;

pub use credentials::{Credentials, CredentialsError, DEFAULT_CREDENTIALS_PATH};
pub use tokens::{IdentityToken, SignedTokenBackend, TokenClaims, TokenError, IDENTITY_TOKEN_PREFIX};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Subject used in dev mode when the handshake carries no token
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Prefix of synthetic dev-mode subjects
pub const DEV_SUBJECT_PREFIX: &str = "dev-";

/// A verified (or, in dev mode, synthetic) identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    subject_id: String,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
        }
    }

    /// Synthetic identity derived from the raw token
    pub fn dev(token: Option<&str>) -> Self {
        let token = token.filter(|t| !t.is_empty()).unwrap_or(ANONYMOUS_SUBJECT);
        Self::new(format!("{}{}", DEV_SUBJECT_PREFIX, token))
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject_id)
    }
}

/// Authentication failed. Carries no detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Authentication error")]
pub struct AuthError;

/// A trusted credential-issuing backend
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Verify a bearer token and return the identity it was issued to
    async fn verify(&self, token: &str) -> Result<Identity, TokenError>;
}

/// How the verifier treats incoming tokens
#[derive(Clone)]
pub enum VerifierMode {
    Trusted(Arc<dyn CredentialBackend>),
    DevUnverified,
}

impl fmt::Debug for VerifierMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierMode::Trusted(_) => f.write_str("Trusted"),
            VerifierMode::DevUnverified => f.write_str("DevUnverified"),
        }
    }
}

/// Gate every connection passes before admission
#[derive(Debug, Clone)]
pub struct IdentityVerifier {
    mode: VerifierMode,
}

impl IdentityVerifier {
    pub fn new(mode: VerifierMode) -> Self {
        Self { mode }
    }

    pub fn trusted(backend: Arc<dyn CredentialBackend>) -> Self {
        Self::new(VerifierMode::Trusted(backend))
    }

    pub fn dev_unverified() -> Self {
        Self::new(VerifierMode::DevUnverified)
    }

    pub fn mode(&self) -> &VerifierMode {
        &self.mode
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self.mode, VerifierMode::Trusted(_))
    }

    /// Verify a handshake token
    ///
    /// Backend rejection reasons are logged and collapsed into [`AuthError`].
    pub async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match &self.mode {
            VerifierMode::DevUnverified => Ok(Identity::dev(token)),
            VerifierMode::Trusted(backend) => {
                let Some(token) = token.filter(|t| !t.is_empty()) else {
                    debug!("Rejecting handshake without token");
                    return Err(AuthError);
                };

                backend.verify(token).await.map_err(|e| {
                    warn!(error = %e, "Token verification failed");
                    AuthError
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"verifier-test-secret";

    fn trusted() -> IdentityVerifier {
        IdentityVerifier::trusted(Arc::new(SignedTokenBackend::new("convoy", TEST_SECRET)))
    }

    #[tokio::test]
    async fn test_dev_mode_derives_identity_from_token() {
        let verifier = IdentityVerifier::dev_unverified();

        let identity = verifier.verify(Some("alice")).await.unwrap();
        assert_eq!(identity.subject_id(), "dev-alice");

        // Deterministic
        let again = verifier.verify(Some("alice")).await.unwrap();
        assert_eq!(identity, again);
    }

    #[tokio::test]
    async fn test_dev_mode_anonymous() {
        let verifier = IdentityVerifier::dev_unverified();

        assert_eq!(verifier.verify(None).await.unwrap().subject_id(), "dev-anonymous");
        assert_eq!(verifier.verify(Some("")).await.unwrap().subject_id(), "dev-anonymous");
    }

    #[tokio::test]
    async fn test_trusted_mode_accepts_valid_token() {
        let token = IdentityToken::create("u1", "convoy", 60, TEST_SECRET).unwrap();

        let identity = trusted().verify(Some(token.as_str())).await.unwrap();
        assert_eq!(identity.subject_id(), "u1");
    }

    #[tokio::test]
    async fn test_trusted_mode_rejects_everything_else() {
        let verifier = trusted();
        let foreign = IdentityToken::create("u1", "convoy", 60, b"other-secret").unwrap();

        assert_eq!(verifier.verify(None).await, Err(AuthError));
        assert_eq!(verifier.verify(Some("")).await, Err(AuthError));
        assert_eq!(verifier.verify(Some("not-a-token")).await, Err(AuthError));
        assert_eq!(verifier.verify(Some(foreign.as_str())).await, Err(AuthError));
    }

    #[test]
    fn test_auth_error_is_generic() {
        assert_eq!(AuthError.to_string(), "Authentication error");
    }

    #[test]
    fn test_mode_flags() {
        assert!(trusted().is_trusted());
        assert!(!IdentityVerifier::dev_unverified().is_trusted());
    }
}
