//! Push-endpoint authentication: HS256 tokens whose `email` claim names the
//! principal the bus is invoking the handler as.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use datafeed_core::Principal;

use crate::error::QueueError;

/// Claims carried by a push token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushClaims {
    pub email: String,
    pub aud: String,
    pub exp: usize,
    pub iat: usize,
}

/// Verifies bearer tokens presented to the push endpoint.
#[derive(Clone)]
pub struct PushTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for PushTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushTokenVerifier")
            .field("audience", &self.validation.aud)
            .finish_non_exhaustive()
    }
}

impl PushTokenVerifier {
    pub fn hs256(secret: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate signature, audience and expiry, returning the invoker.
    pub fn verify(&self, token: &str) -> Result<Principal, QueueError> {
        let data = jsonwebtoken::decode::<PushClaims>(token, &self.key, &self.validation)
            .map_err(|e| QueueError::Auth(format!("invalid push token: {e}")))?;
        if data.claims.email.trim().is_empty() {
            return Err(QueueError::Auth("push token has no email claim".into()));
        }
        Ok(Principal::new(data.claims.email))
    }
}

fn timestamp(value: i64, field: &str) -> Result<usize, QueueError> {
    usize::try_from(value).map_err(|_| QueueError::Auth(format!("{field} timestamp out of range")))
}

/// Mint a token asserting `principal` for `audience`. Used by the local bus
/// client and by tests; production tokens come from the identity provider.
pub fn mint_push_token(
    secret: &str,
    audience: &str,
    principal: &Principal,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<String, QueueError> {
    let claims = PushClaims {
        email: principal.as_str().to_string(),
        aud: audience.to_string(),
        exp: timestamp((now + ttl).timestamp(), "exp")?,
        iat: timestamp(now.timestamp(), "iat")?,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| QueueError::Auth(format!("push token minting failed: {e}")))
}
