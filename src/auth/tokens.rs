//! Signed identity tokens
//!
//! Token format: `idt-<payload>.<signature>`
//! - payload: base64url (no padding) JSON claims
//! - signature: first 16 bytes of HMAC-SHA256(secret, payload), base64url

use crate::auth::{CredentialBackend, Identity};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identity token prefix
pub const IDENTITY_TOKEN_PREFIX: &str = "idt-";

/// Truncated signature length in bytes
const SIGNATURE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token prefix: expected '{expected}', got '{got}'")]
    InvalidPrefix { expected: String, got: String },

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("invalid signing key")]
    InvalidKey,

    #[error("token decode error: {0}")]
    DecodeError(String),

    #[error("token encode error: {0}")]
    EncodeError(String),

    #[error("token issuer mismatch: expected '{expected}', got '{got}'")]
    IssuerMismatch { expected: String, got: String },

    #[error("token expired")]
    Expired,

    #[error("token has no subject")]
    MissingSubject,
}

/// Claims carried by an identity token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (stable user id)
    pub sub: String,
    /// Issuer that signed the token
    pub iss: String,
    /// Issued-at, Unix seconds
    pub iat: u64,
    /// Expiry, Unix seconds
    pub exp: u64,
}

/// A signed identity token
#[derive(Debug, Clone)]
pub struct IdentityToken {
    /// The full token string including prefix
    token: String,
    /// Decoded claims
    claims: TokenClaims,
}

impl IdentityToken {
    /// Sign a new token for `subject`, valid for `ttl_secs` from now
    pub fn create(
        subject: impl Into<String>,
        issuer: impl Into<String>,
        ttl_secs: u64,
        secret: &[u8],
    ) -> Result<Self, TokenError> {
        let iat = unix_now();
        let claims = TokenClaims {
            sub: subject.into(),
            iss: issuer.into(),
            iat,
            exp: iat.saturating_add(ttl_secs),
        };
        Self::sign(claims, secret)
    }

    /// Sign arbitrary claims
    pub fn sign(claims: TokenClaims, secret: &[u8]) -> Result<Self, TokenError> {
        let payload_json =
            serde_json::to_vec(&claims).map_err(|e| TokenError::EncodeError(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)?;
        mac.update(payload_b64.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_b64 = URL_SAFE_NO_PAD.encode(&signature[..SIGNATURE_LEN]);

        let token = format!("{}{}.{}", IDENTITY_TOKEN_PREFIX, payload_b64, signature_b64);

        Ok(Self { token, claims })
    }

    /// Parse a token and verify its signature
    ///
    /// Claims are not validated here; see [`IdentityToken::validate`].
    pub fn parse(token: &str, secret: &[u8]) -> Result<Self, TokenError> {
        let content = token.strip_prefix(IDENTITY_TOKEN_PREFIX).ok_or_else(|| {
            TokenError::InvalidPrefix {
                expected: IDENTITY_TOKEN_PREFIX.to_string(),
                got: token.chars().take(IDENTITY_TOKEN_PREFIX.len()).collect(),
            }
        })?;

        let (payload_b64, signature_b64) =
            content.split_once('.').ok_or(TokenError::InvalidFormat)?;
        if payload_b64.is_empty() || signature_b64.contains('.') {
            return Err(TokenError::InvalidFormat);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::InvalidSignature)?;
        if signature.len() != SIGNATURE_LEN {
            return Err(TokenError::InvalidSignature);
        }

        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)?;
        mac.update(payload_b64.as_bytes());
        mac.verify_truncated_left(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;

        let claims: TokenClaims = serde_json::from_slice(&payload_json)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    /// Check issuer, expiry and subject against `now` (Unix seconds)
    pub fn validate(&self, issuer: &str, now: u64) -> Result<(), TokenError> {
        if self.claims.iss != issuer {
            return Err(TokenError::IssuerMismatch {
                expected: issuer.to_string(),
                got: self.claims.iss.clone(),
            });
        }
        if self.claims.exp <= now {
            return Err(TokenError::Expired);
        }
        if self.claims.sub.is_empty() {
            return Err(TokenError::MissingSubject);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Trusted backend that verifies tokens signed with a shared secret
#[derive(Clone)]
pub struct SignedTokenBackend {
    issuer: String,
    secret: Vec<u8>,
}

impl SignedTokenBackend {
    pub fn new(issuer: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            issuer: issuer.into(),
            secret: secret.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

impl fmt::Debug for SignedTokenBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedTokenBackend")
            .field("issuer", &self.issuer)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl CredentialBackend for SignedTokenBackend {
    async fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        let token = IdentityToken::parse(token, &self.secret)?;
        token.validate(&self.issuer, unix_now())?;
        Ok(Identity::new(token.subject()))
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
