use std::{collections::HashMap, time::Duration};

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_auth::AuthBearer;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use crate::AppState;

pub const ISSUER: &str = "quantum-chat";
pub const ACCESS_EXPIRY: Duration = Duration::from_secs(15 * 60);
pub const REFRESH_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub token_type: TokenType,
    pub exp: i64,
    pub iat: i64,
    pub sub: String,
    pub iss: String,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("authorization header format must be Bearer {{token}}")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("token has expired")]
    Expired,
    #[error("invalid token type")]
    WrongType,
    #[error("token has been revoked")]
    Revoked,
    #[error("error signing token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        match self {
            TokenError::Signing(_) => {
                tracing::error!("{self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            _ => (StatusCode::UNAUTHORIZED, self.to_string()).into_response(),
        }
    }
}

/// Signs and verifies HS256 tokens and remembers revoked ones until they expire.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    // sha256(token) -> unix expiry
    revoked: RwLock<HashMap<[u8; 32], i64>>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;

        TokenIssuer {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            revoked: RwLock::new(HashMap::new()),
        }
    }

    pub fn issue(&self, user_id: i64, token_type: TokenType) -> Result<(String, Claims), TokenError> {
        let lifetime = match token_type {
            TokenType::Access => ACCESS_EXPIRY,
            TokenType::Refresh => REFRESH_EXPIRY,
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            user_id,
            token_type,
            exp: now + lifetime.as_secs() as i64,
            iat: now,
            sub: user_id.to_string(),
            iss: ISSUER.to_owned(),
        };

        Ok((self.encode(&claims)?, claims))
    }

    pub fn issue_pair(&self, user_id: i64) -> Result<TokenPair, TokenError> {
        let (access_token, access) = self.issue(user_id, TokenType::Access)?;
        let (refresh_token, _) = self.issue(user_id, TokenType::Refresh)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at: access.exp,
        })
    }

    fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(TokenError::Signing)
    }

    pub async fn validate(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })?
            .claims;

        if claims.token_type != expected {
            return Err(TokenError::WrongType);
        }

        if self.revoked.read().await.contains_key(&digest(token)) {
            return Err(TokenError::Revoked);
        }

        Ok(claims)
    }

    /// Returns `false` when the token was already revoked.
    pub async fn revoke(&self, token: &str, expires_at: i64) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut revoked = self.revoked.write().await;
        revoked.retain(|_, exp| *exp > now);

        let fresh = revoked.insert(digest(token), expires_at).is_none();
        debug!(tracked = revoked.len(), "token revoked");
        fresh
    }

    /// Exchange a validated refresh token for a new pair. The old token is
    /// single use: a second rotation with it fails with `Revoked`.
    pub async fn rotate(&self, refresh_token: &str, claims: &Claims) -> Result<TokenPair, TokenError> {
        if !self.revoke(refresh_token, claims.exp).await {
            return Err(TokenError::Revoked);
        }
        self.issue_pair(claims.user_id)
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Caller authenticated by a valid, unrevoked access token.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: i64,
    pub claims: Claims,
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = TokenError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthBearer(token) = AuthBearer::from_request_parts(parts, state)
            .await
            .map_err(|_| TokenError::Missing)?;

        let claims = state.tokens.validate(&token, TokenType::Access).await?;

        Ok(AuthUser {
            user_id: claims.user_id,
            claims,
            token,
        })
    }
}
