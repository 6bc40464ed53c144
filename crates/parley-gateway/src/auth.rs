//! Bearer credential handling for the gateway handshake and the REST API.
//!
//! Credentials are HS256 JWTs carrying [`Claims`]. Verification here is pure;
//! resolving the subject to a stored user happens in [`crate::relay::Relay::authenticate`].

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use parley_types::api::Claims;

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,

    #[error("invalid or expired credential")]
    InvalidCredential,

    #[error("unknown identity")]
    UnknownIdentity,

    #[error("identity lookup failed")]
    LookupFailed,
}

#[derive(Clone)]
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Check signature and expiry. A blank token counts as missing.
    pub fn verify(&self, token: Option<&str>) -> Result<Claims, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Credential rejected: {}", e);
                AuthError::InvalidCredential
            })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    name: &str,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        name: name.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
