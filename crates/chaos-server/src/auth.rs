//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` is a stored user id and whose `aud`
//! matches the configured audience. Issuance exists for the CLI and tests;
//! the server itself only verifies.

use std::time::Duration;

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use chaos_core::ids::UserId;
use chaos_store::users::UserRow;

use crate::api::ApiError;
use crate::server::AppState;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token subject is not a known user")]
    UnknownUser,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
}

pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    audience: String,
}

impl std::fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuth").field("audience", &self.audience).finish()
    }
}

impl JwtAuth {
    pub fn new(secret: &SecretString, audience: impl Into<String>) -> Self {
        let audience = audience.into();
        let key = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            audience,
        }
    }

    pub fn issue(&self, user_id: &UserId, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let claims = Claims {
            sub: user_id.to_string(),
            aud: self.audience.clone(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Check signature, audience and expiry. Does not consult the store.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }
        Ok(UserId::from_raw(data.claims.sub))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer` wins over `?token=`. Browsers cannot set headers
/// on a WebSocket handshake, so the query form is accepted too.
fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = header {
        return Some(token.to_string());
    }
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

/// The authenticated caller of a request.
#[derive(Clone, Debug)]
pub struct AuthUser(pub UserRow);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        let user_id = state.auth.verify(&token)?;
        match state.services.users.get(&user_id) {
            Ok(user) => Ok(AuthUser(user)),
            Err(chaos_engine::ServiceError::NotFound(_)) => Err(AuthError::UnknownUser.into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn auth() -> JwtAuth {
        JwtAuth::new(&SecretString::from("test-secret"), "chaos")
    }

    fn parts(uri: &str, bearer: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn issued_token_verifies() {
        let auth = auth();
        let user = UserId::new();
        let token = auth.issue(&user, Duration::from_secs(60)).unwrap();
        assert_eq!(auth.verify(&token).unwrap(), user);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = auth().issue(&UserId::new(), Duration::from_secs(60)).unwrap();
        let other = JwtAuth::new(&SecretString::from("another"), "chaos");
        assert!(matches!(other.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let token = JwtAuth::new(&SecretString::from("test-secret"), "elsewhere")
            .issue(&UserId::new(), Duration::from_secs(60))
            .unwrap();
        assert!(matches!(auth().verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = auth();
        let claims = Claims {
            sub: UserId::new().to_string(),
            aud: "chaos".into(),
            iat: 0,
            exp: Utc::now().timestamp() - 3600,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &auth.encoding).unwrap();
        assert!(matches!(auth.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(auth().verify("not.a.jwt"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn header_wins_over_query() {
        let p = parts("/ws?token=from-query", Some("from-header"));
        assert_eq!(bearer_token(&p).as_deref(), Some("from-header"));
    }

    #[test]
    fn query_token_is_accepted() {
        let p = parts("/ws?token=abc", None);
        assert_eq!(bearer_token(&p).as_deref(), Some("abc"));
        assert!(bearer_token(&parts("/ws", None)).is_none());
        assert!(bearer_token(&parts("/ws?token=", None)).is_none());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        assert!(!format!("{:?}", auth()).contains("test-secret"));
    }
}
