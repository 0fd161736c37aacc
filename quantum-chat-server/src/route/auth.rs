use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_auth::AuthBearer;
use quantum_chat_proto::{LoginReq, RegisterReq, StatusMessage, TokenPairResp};
use tracing::{debug, info};

use crate::{
    AppState,
    hub::EvictReason,
    store,
    token::{AuthUser, TokenError, TokenIssuer, TokenType},
};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 50;
const PASSWORD_MIN_LEN: usize = 6;

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterReq>, JsonRejection>,
) -> Result<Json<TokenPairResp>, AuthError> {
    let Json(req) = payload.map_err(|_| AuthError::InvalidBody)?;
    validate_registration(&req)?;

    if store::user_by_name(&state.pool, &req.username).await?.is_some() {
        return Err(AuthError::UsernameTaken);
    }

    let password_hash = password_auth::generate_hash(&req.password);
    let user = store::create_user(&state.pool, &req.username, &password_hash, &req.public_key)
        .await
        .map_err(|e| {
            // lost a race against a concurrent registration
            if store::is_unique_violation(&e) {
                AuthError::UsernameTaken
            } else {
                AuthError::Database(e)
            }
        })?;

    info!(user_id = user.id, "user registered");

    token_response(&state.tokens, user.id, user.username)
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginReq>, JsonRejection>,
) -> Result<Json<TokenPairResp>, AuthError> {
    let Json(req) = payload.map_err(|_| AuthError::InvalidBody)?;

    let user = store::user_by_name(&state.pool, &req.username)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    password_auth::verify_password(&req.password, &user.password_hash)
        .map_err(|_| AuthError::InvalidCredentials)?;

    debug!(user_id = user.id, "user logged in");

    token_response(&state.tokens, user.id, user.username)
}

pub async fn refresh(
    State(state): State<AppState>,
    bearer: Result<AuthBearer, axum_auth::Rejection>,
) -> Result<Json<TokenPairResp>, AuthError> {
    let AuthBearer(token) = bearer.map_err(|_| TokenError::Missing)?;

    let claims = state.tokens.validate(&token, TokenType::Refresh).await?;
    let user = store::user_by_id(&state.pool, claims.user_id)
        .await?
        .ok_or(TokenError::Invalid)?;

    let pair = state.tokens.rotate(&token, &claims).await?;
    debug!(user_id = user.id, "token pair refreshed");

    Ok(Json(TokenPairResp {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        user_id: user.id,
        username: user.username,
        expires_in: pair.access_expires_at,
    }))
}

pub async fn logout(State(state): State<AppState>, user: AuthUser) -> Json<StatusMessage> {
    state.tokens.revoke(&user.token, user.claims.exp).await;

    let was_online = state
        .hub
        .write()
        .await
        .disconnect(user.user_id, EvictReason::LoggedOut);
    debug!(user_id = user.user_id, was_online, "user logged out");

    Json(StatusMessage {
        message: "Successfully logged out".to_owned(),
    })
}

fn token_response(
    tokens: &TokenIssuer,
    user_id: i64,
    username: String,
) -> Result<Json<TokenPairResp>, AuthError> {
    let pair = tokens.issue_pair(user_id)?;

    Ok(Json(TokenPairResp {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        user_id,
        username,
        expires_in: pair.access_expires_at,
    }))
}

/// Rules every stored username follows, also applied by `admin user rename`.
pub fn validate_username(username: &str) -> Result<(), &'static str> {
    let username_len = username.chars().count();

    if username.trim().is_empty() {
        return Err("username is required");
    }
    if username_len < USERNAME_MIN_LEN {
        return Err("username must be at least 3 characters");
    }
    if username_len > USERNAME_MAX_LEN {
        return Err("username must not exceed 50 characters");
    }
    Ok(())
}

fn validate_registration(req: &RegisterReq) -> Result<(), AuthError> {
    validate_username(&req.username).map_err(AuthError::Validation)?;

    if req.password.trim().is_empty() {
        return Err(AuthError::Validation("password is required"));
    }
    if req.password.chars().count() < PASSWORD_MIN_LEN {
        return Err(AuthError::Validation(
            "password must be at least 6 characters",
        ));
    }
    if req.public_key.is_empty() {
        return Err(AuthError::Validation("public key is required"));
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Invalid request body")]
    InvalidBody,
    #[error("{0}")]
    Validation(&'static str),
    #[error("Username already exists")]
    UsernameTaken,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::InvalidBody | AuthError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            AuthError::UsernameTaken => (StatusCode::CONFLICT, self.to_string()).into_response(),
            AuthError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
            }
            AuthError::Token(inner) => inner.into_response(),
            AuthError::Database(_) => {
                tracing::error!("{self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, header},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{app, testing::test_state};

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_bearer(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(res: Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn alice() -> Value {
        json!({"username": "alice", "password": "secret123", "public_key": "AQID"})
    }

    #[tokio::test]
    async fn register_then_login() {
        let state = test_state().await;

        let res = app(state.clone())
            .oneshot(post_json("/api/auth/register", alice()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let registered = body_json(res).await;
        assert_eq!(registered["username"], "alice");
        assert!(registered["access_token"].as_str().is_some_and(|t| !t.is_empty()));
        assert!(registered["expires_in"].as_i64().unwrap() > 0);

        let res = app(state.clone())
            .oneshot(post_json(
                "/api/auth/login",
                json!({"username": "alice", "password": "secret123"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let logged_in = body_json(res).await;
        assert_eq!(logged_in["user_id"], registered["user_id"]);

        let res = app(state)
            .oneshot(post_json(
                "/api/auth/login",
                json!({"username": "alice", "password": "wrong-password"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let state = test_state().await;
        store::create_user(&state.pool, "alice", "hash", &[1])
            .await
            .unwrap();

        let res = app(state)
            .oneshot(post_json("/api/auth/register", alice()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_user_cannot_login() {
        let state = test_state().await;
        let res = app(state)
            .oneshot(post_json(
                "/api/auth/login",
                json!({"username": "ghost", "password": "whatever"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let state = test_state().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let res = app(state).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn registration_rules() {
        let req = |username: &str, password: &str, key: &[u8]| RegisterReq {
            username: username.into(),
            password: password.into(),
            public_key: key.to_vec(),
        };

        assert!(validate_registration(&req("alice", "secret1", &[1])).is_ok());
        assert!(validate_registration(&req("   ", "secret1", &[1])).is_err());
        assert!(validate_registration(&req("al", "secret1", &[1])).is_err());
        assert!(validate_registration(&req(&"a".repeat(51), "secret1", &[1])).is_err());
        assert!(validate_registration(&req(&"a".repeat(50), "secret1", &[1])).is_ok());
        assert!(validate_registration(&req("alice", "short", &[1])).is_err());
        assert!(validate_registration(&req("alice", "      ", &[1])).is_err());
        assert!(validate_registration(&req("alice", "secret1", &[])).is_err());
    }

    #[tokio::test]
    async fn short_password_is_rejected() {
        let state = test_state().await;
        let res = app(state)
            .oneshot(post_json(
                "/api/auth/register",
                json!({"username": "alice", "password": "abc", "public_key": "AQID"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn refresh_rotates_pair() {
        let state = test_state().await;
        let user = store::create_user(&state.pool, "bob", "hash", &[1])
            .await
            .unwrap();
        let pair = state.tokens.issue_pair(user.id).unwrap();

        let res = app(state.clone())
            .oneshot(post_bearer("/api/auth/refresh", &pair.refresh_token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["username"], "bob");
        assert_eq!(body["user_id"], user.id);

        // single use
        let res = app(state.clone())
            .oneshot(post_bearer("/api/auth/refresh", &pair.refresh_token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // access tokens cannot refresh
        let res = app(state)
            .oneshot(post_bearer("/api/auth/refresh", &pair.access_token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_without_header_is_unauthorized() {
        let state = test_state().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/auth/refresh")
            .body(Body::empty())
            .unwrap();

        let res = app(state).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_revokes_access_token() {
        let state = test_state().await;
        let user = store::create_user(&state.pool, "bob", "hash", &[1])
            .await
            .unwrap();
        let pair = state.tokens.issue_pair(user.id).unwrap();

        let res = app(state.clone())
            .oneshot(post_bearer("/api/auth/logout", &pair.access_token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            body_json(res).await,
            json!({"message": "Successfully logged out"})
        );

        let res = app(state)
            .oneshot(post_bearer("/api/auth/logout", &pair.access_token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_requires_post() {
        let state = test_state().await;
        let req = Request::builder()
            .method("GET")
            .uri("/api/auth/logout")
            .body(Body::empty())
            .unwrap();

        let res = app(state).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
