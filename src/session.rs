//! Session Token Verification
//! Mission: Resolve the authenticated user behind a platform session token
//!
//! Tokens are minted by the main platform on login; this service only
//! verifies them and extracts the subject. Verification failures resolve
//! to "no identity" rather than an error so telemetry ingestion can fall
//! back to anonymous tracking.

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Session token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id
    pub sub: String,
    /// Expiration timestamp (unix seconds)
    pub exp: usize,
}

/// Verifier for platform session tokens (HS256)
#[derive(Clone)]
pub struct SessionVerifier {
    secret: String,
}

impl SessionVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Verify a session token and return the user id, or None if the
    /// token is missing, malformed, expired, or signed with another key.
    pub fn verify(&self, token: &str) -> Option<String> {
        let decoded = decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()?;

        debug!("Verified session for user {}", decoded.claims.sub);
        Some(decoded.claims.sub)
    }

    /// Extract the user id from an `Authorization: Bearer <token>` value.
    pub fn verify_bearer(&self, header_value: &str) -> Option<String> {
        let token = header_value.strip_prefix("Bearer ")?.trim();
        if token.is_empty() {
            return None;
        }
        self.verify(token)
    }

    /// Mint a 24h session token. The platform is the normal issuer; this
    /// exists for local tooling and tests.
    pub fn issue(&self, user_id: &str) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(24))
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = SessionClaims {
            sub: user_id.to_string(),
            exp,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to sign session token")
    }
}
