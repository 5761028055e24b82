//! Credential verification.
//!
//! The engine only needs [`AuthGate`]: token in, member id out. [`TokenAuth`]
//! is the bundled implementation, an HS256 JWT carrying `{"userId", "exp"}`
//! signed with a shared secret.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime: 7 days.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Resolves an opaque credential to the member it was issued for.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn verify_credential(&self, token: &str) -> Option<Uuid>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("User not found")]
    UnknownMember(Uuid),
    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

/// HS256 JWT issuer and verifier.
#[derive(Clone)]
pub struct TokenAuth {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenAuth {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a token for `member_id` valid for the configured lifetime.
    pub fn issue(&self, member_id: Uuid) -> Result<String, AuthError> {
        let now = now_secs();
        let claims = Claims {
            user_id: member_id,
            exp: now + self.ttl.as_secs(),
            iat: now,
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|e| AuthError::Encoding(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes())?);
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Check signature, algorithm and expiry. Any failure is `InvalidToken`.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (signing_input, signature) =
            token.rsplit_once('.').ok_or(AuthError::InvalidToken)?;
        let (header, payload) = signing_input
            .split_once('.')
            .ok_or(AuthError::InvalidToken)?;
        if payload.contains('.') {
            return Err(AuthError::InvalidToken);
        }

        let header: Header = decode_segment(header)?;
        if header.alg != "HS256" {
            return Err(AuthError::InvalidToken);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Encoding(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let claims: Claims = decode_segment(payload)?;
        if claims.exp <= now_secs() {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Encoding(e.to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[async_trait]
impl AuthGate for TokenAuth {
    async fn verify_credential(&self, token: &str) -> Option<Uuid> {
        match self.verify(token) {
            Ok(claims) => Some(claims.user_id),
            Err(e) => {
                log::debug!("Rejected credential: {e}");
                None
            }
        }
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::InvalidToken)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::InvalidToken)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let auth = TokenAuth::new("secret");
        let member = Uuid::new_v4();
        let token = auth.issue(member).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.user_id, member);
        assert_eq!(claims.exp - claims.iat, DEFAULT_TOKEN_TTL.as_secs());
    }

    #[test]
    fn test_payload_uses_user_id_claim() {
        let auth = TokenAuth::new("secret");
        let member = Uuid::new_v4();
        let token = auth.issue(member).unwrap();
        let payload = token.split('.').nth(1).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(value["userId"], member.to_string());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = TokenAuth::new("secret").issue(Uuid::new_v4()).unwrap();
        assert_eq!(
            TokenAuth::new("other").verify(&token),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let auth = TokenAuth::new("secret");
        let token = auth.issue(Uuid::new_v4()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = format!(
            r#"{{"userId":"{}","exp":{}}}"#,
            Uuid::new_v4(),
            u64::MAX
        );
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(forged_claims),
            parts[2]
        );
        assert_eq!(auth.verify(&forged), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = TokenAuth::new("secret").with_ttl(Duration::from_secs(0));
        let token = auth.issue(Uuid::new_v4()).unwrap();
        assert_eq!(auth.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_garbage_rejected() {
        let auth = TokenAuth::new("secret");
        for token in ["", "abc", "a.b", "a.b.c", "a.b.c.d"] {
            assert_eq!(auth.verify(token), Err(AuthError::InvalidToken), "{token}");
        }
    }

    #[test]
    fn test_auth_error_messages() {
        assert_eq!(AuthError::InvalidToken.to_string(), "Invalid token");
        assert_eq!(
            AuthError::UnknownMember(Uuid::nil()).to_string(),
            "User not found"
        );
    }

    #[tokio::test]
    async fn test_auth_gate() {
        let auth = TokenAuth::new("secret");
        let member = Uuid::new_v4();
        let token = auth.issue(member).unwrap();
        assert_eq!(auth.verify_credential(&token).await, Some(member));
        assert_eq!(auth.verify_credential("nope").await, None);
    }
}
