use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::{Instrument, debug, debug_span};

use crate::{AppState, token::AuthUser};

mod socket;

pub use socket::Heartbeat;

/// Largest frame accepted from a client.
const MAX_MESSAGE_SIZE: usize = 512 * 1024;

pub async fn chat_ws(user: AuthUser, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let user_id = user.user_id;
    if state.hub.read().await.is_online(user_id) {
        debug!(user_id, "new connection will replace the current one");
    }

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| {
            socket::handle_socket(socket, state, user_id).instrument(debug_span!("chat_ws", user_id))
        })
}
