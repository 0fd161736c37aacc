mod auth;
mod chat;
mod users;

use axum::Json;
use quantum_chat_proto::{HEALTH_STATUS, HealthStatus, ROOT_MESSAGE, RootStatus};

pub use auth::{login, logout, refresh, register, validate_username};
pub use chat::{Heartbeat, chat_ws};
pub use users::{message_history, user_profile};

pub async fn root() -> Json<RootStatus> {
    Json(RootStatus {
        message: ROOT_MESSAGE.to_owned(),
    })
}

/// Liveness probe, never touches the database or the hub.
pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: HEALTH_STATUS.to_owned(),
    })
}
