use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use quantum_chat_proto::{MessageRecord, UserProfile};
use serde::Deserialize;

use crate::{AppState, store, token::AuthUser};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

/// Public profile of a peer, used to fetch their public key.
pub async fn user_profile(
    _caller: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserProfile>, ApiError> {
    let user = store::user_by_id(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;

    Ok(Json(UserProfile {
        id: user.id,
        username: user.username,
        public_key: user.public_key,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<i64>,
}

pub async fn message_history(
    caller: AuthUser,
    State(state): State<AppState>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest("limit must be between 1 and 200"));
    }

    let messages = store::recent_messages(&state.pool, caller.user_id, limit).await?;

    Ok(Json(messages.into_iter().map(MessageRecord::from).collect()))
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
            ApiError::Database(_) => {
                tracing::error!("{self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
