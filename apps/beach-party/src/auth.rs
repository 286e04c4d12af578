use std::fmt;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account identifier extracted from a console access token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token missing or malformed")]
    Malformed,
    #[error("token verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token missing principal")]
    MissingPrincipal,
}

/// Turns a console bearer token into the principal that owns it.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<PrincipalId, TokenError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessClaims {
    #[serde(rename = "userId", alias = "sub")]
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// HS256 tokens signed with a shared secret. Tokens issued by the account
/// service carry `userId` and usually no `exp`; when `exp` is present it is
/// enforced.
#[derive(Clone)]
pub struct JwtTokenVerifier {
    enc: EncodingKey,
    dec: DecodingKey,
    ttl: Option<Duration>,
}

impl JwtTokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret),
            dec: DecodingKey::from_secret(secret),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn issue(&self, principal: &PrincipalId) -> Result<String, TokenError> {
        let claims = AccessClaims {
            user_id: principal.as_str().to_string(),
            exp: self.ttl.map(|ttl| (Utc::now() + ttl).timestamp()),
        };
        let header = Header::new(Algorithm::HS256);
        Ok(jsonwebtoken::encode(&header, &claims, &self.enc)?)
    }

    fn decode(&self, token: &str) -> Result<PrincipalId, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenError::Malformed);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims::<&str>(&[]);
        validation.validate_exp = true;
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.dec, &validation)?;
        let user_id = data.claims.user_id.trim();
        if user_id.is_empty() {
            return Err(TokenError::MissingPrincipal);
        }
        Ok(PrincipalId::new(user_id))
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<PrincipalId, TokenError> {
        self.decode(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_token_verifies_to_principal() {
        let verifier = JwtTokenVerifier::new(b"secret").with_ttl(Duration::minutes(5));
        let token = verifier.issue(&PrincipalId::new("user-1")).unwrap();
        let principal = verifier.verify(&token).await.unwrap();
        assert_eq!(principal.as_str(), "user-1");
    }

    #[tokio::test]
    async fn tokens_without_expiry_are_accepted() {
        let verifier = JwtTokenVerifier::new(b"secret");
        let token = verifier.issue(&PrincipalId::new("user-2")).unwrap();
        assert_eq!(verifier.verify(&token).await.unwrap().as_str(), "user-2");
    }

    #[tokio::test]
    async fn rejects_garbled_and_foreign_tokens() {
        let verifier = JwtTokenVerifier::new(b"secret");
        assert!(matches!(
            verifier.verify("").await,
            Err(TokenError::Malformed)
        ));
        assert!(matches!(
            verifier.verify("VALID.ACCESS.TOKEN").await,
            Err(TokenError::Jwt(_))
        ));

        let other = JwtTokenVerifier::new(b"other-secret");
        let token = other.issue(&PrincipalId::new("user-3")).unwrap();
        assert!(matches!(verifier.verify(&token).await, Err(TokenError::Jwt(_))));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let verifier = JwtTokenVerifier::new(b"secret").with_ttl(Duration::minutes(-10));
        let token = verifier.issue(&PrincipalId::new("user-4")).unwrap();
        assert!(matches!(verifier.verify(&token).await, Err(TokenError::Jwt(_))));
    }
}
