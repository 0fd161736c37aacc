use std::{pin::Pin, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::SinkExt;
use quantum_chat_proto::msg::{AckStatus, MessageType, WsMessage};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::{
    sync::{RwLock, mpsc, oneshot},
    time::{Instant, Interval, Sleep, interval_at, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    AppState,
    hub::{Delivery, EvictReason, Hub, Registration},
    store::{self, NewMessage},
};

const MAX_CLOSE_REASON: usize = 123;

/// Keep-alive timings of a chat socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Time allowed to write a frame to the peer.
    pub write_wait: Duration,
    /// Time allowed between two frames from the peer, pongs included.
    pub pong_wait: Duration,
    /// Must be shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Heartbeat {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
        }
    }
}

pub async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64) {
    let _tracker_token = state.ws_graceful_shutdown.tracker.token();
    let cancellation_token = state.ws_graceful_shutdown.token.child_token();

    let Registration {
        conn_id,
        outbound,
        evicted,
    } = state.hub.write().await.register(user_id);
    let heartbeat = state.heartbeat;
    debug!(conn_id, "websocket connected");

    let mut controller = ChatController {
        db: state.pool.clone(),
        hub: state.hub.clone(),
        ws: socket,
        outbound,
        evicted,
        cancellation_token,
        user_id,
        heartbeat,
        ping: interval_at(Instant::now() + heartbeat.ping_period, heartbeat.ping_period),
        read_deadline: Box::pin(sleep(heartbeat.pong_wait)),
    };

    while controller.next().await {}
    controller.ws.close().await.ok();

    state.hub.write().await.unregister(user_id, conn_id);
    debug!(conn_id, "websocket disconnected");
}

struct ChatController {
    db: SqlitePool,
    hub: Arc<RwLock<Hub>>,
    ws: WebSocket,
    outbound: mpsc::Receiver<String>,
    evicted: oneshot::Receiver<EvictReason>,
    cancellation_token: CancellationToken,
    user_id: i64,
    heartbeat: Heartbeat,
    ping: Interval,
    read_deadline: Pin<Box<Sleep>>,
}

impl ChatController {
    async fn send(&mut self, msg: Message) -> Result<(), ChatWsError> {
        match timeout(self.heartbeat.write_wait, self.ws.send(msg)).await {
            Ok(res) => res.map_err(|e| ChatWsError::Internal(e.to_string())),
            Err(_) => Err(ChatWsError::WriteTimeout),
        }
    }

    async fn close<T: IntoCloseFrame>(&mut self, msg: T) -> Result<(), ChatWsError> {
        let msg = msg.into_close_frame();
        match msg {
            Some(CloseFrame { code, ref reason }) if code != close_code::NORMAL => {
                debug!(
                    code,
                    %reason,
                    "closing websocket with error"
                );
            }
            _ => {}
        }
        self.send(Message::Close(msg)).await
    }

    async fn reply(&mut self, msg: WsMessage) -> Result<(), ChatWsError> {
        let frame =
            serde_json::to_string(&msg).map_err(|e| ChatWsError::Internal(e.to_string()))?;
        self.send(Message::Text(frame.into())).await
    }

    async fn next(&mut self) -> bool {
        tokio::select! {
            msg = self.ws.recv() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        self.close(ChatWsError::Internal(e.to_string())).await.ok();
                        return false;
                    }
                    None => {
                        return false; // connection closed
                    }
                };

                self.read_deadline
                    .as_mut()
                    .reset(Instant::now() + self.heartbeat.pong_wait);

                if let Err(e) = self.process_msg(msg).await {
                    self.close(e).await.ok();
                    return false;
                }
                true
            }
            frame = self.outbound.recv() => {
                let res = match frame {
                    Some(frame) => self.send(Message::Text(frame.into())).await,
                    None => Err(ChatWsError::Dropped),
                };

                if let Err(e) = res {
                    self.close(e).await.ok();
                    return false;
                }
                true
            }
            reason = &mut self.evicted => {
                // a dropped handle without a reason means the hub gave up on us
                let e = reason.map_or(ChatWsError::Dropped, ChatWsError::from);
                self.close(e).await.ok();
                false
            }
            _ = self.ping.tick() => {
                if let Err(e) = self.send(Message::Ping(Default::default())).await {
                    self.close(e).await.ok();
                    return false;
                }
                true
            }
            _ = &mut self.read_deadline => {
                self.close(ChatWsError::Timeout).await.ok();
                false
            }
            _ = self.cancellation_token.cancelled() => {
                self.close(ChatWsError::Shutdown).await.ok();
                false
            }
        }
    }

    async fn process_msg(&mut self, msg: Message) -> Result<(), ChatWsError> {
        match msg {
            Message::Close(Some(CloseFrame { code, reason })) => {
                trace!(
                    code,
                    %reason,
                    "websocket closed with frame"
                );
            }
            Message::Text(text) => {
                trace!("received text: {:?}", text.as_str());
                self.process_frame(text.as_str().as_bytes()).await?;
            }
            Message::Binary(bytes) => {
                trace!("received binary: {:?}", String::from_utf8_lossy(&bytes));
                self.process_frame(&bytes).await?;
            }
            _ => {} // pings are answered by axum, pongs only refresh the deadline
        }
        Ok(())
    }

    async fn process_frame(&mut self, raw: &[u8]) -> Result<(), ChatWsError> {
        let now = unix_now();

        let mut msg: WsMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%e, "unparsable frame");
                return self
                    .reply(WsMessage::error(self.user_id, "Invalid message format", now))
                    .await;
            }
        };

        msg.sender_id = Some(self.user_id);
        msg.timestamp = Some(now);

        let reply = match msg.kind {
            MessageType::Chat => match self.route_chat(msg, now).await {
                Ok(ack) => ack,
                Err(e) => {
                    match e {
                        ChatError::Storage(_) | ChatError::Encode(_) => {
                            warn!(%e, "failed to handle chat message")
                        }
                        _ => debug!(%e, "chat message rejected"),
                    }
                    WsMessage::error(self.user_id, e.client_message(), now)
                }
            },
            _ => WsMessage::error(self.user_id, "Unknown message type", now),
        };

        self.reply(reply).await
    }

    /// Persist, forward to the receiver if online, and build the sender's ack.
    async fn route_chat(&mut self, mut msg: WsMessage, now: i64) -> Result<WsMessage, ChatError> {
        let receiver_id = match msg.receiver_id {
            Some(id) if !msg.content.is_null() => id,
            _ => return Err(ChatError::Invalid),
        };

        if !store::user_exists(&self.db, receiver_id).await? {
            return Err(ChatError::UnknownReceiver(receiver_id));
        }

        let content = serde_json::to_string(&msg.content)?;
        let message_id = store::save_message(
            &self.db,
            NewMessage {
                sender_id: self.user_id,
                receiver_id,
                content: &content,
                timestamp: now,
            },
        )
        .await?;

        msg.message_id = Some(message_id);
        let frame = serde_json::to_string(&msg)?;
        let delivery = self.hub.write().await.send_to(receiver_id, frame);
        debug!(receiver_id, message_id, ?delivery, "chat message routed");

        let status = match delivery {
            Delivery::Queued => AckStatus::Delivered,
            Delivery::Offline | Delivery::Dropped => AckStatus::Stored,
        };

        Ok(WsMessage::ack(self.user_id, message_id, status, now))
    }
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Debug, thiserror::Error)]
enum ChatError {
    #[error("chat message without receiver or content")]
    Invalid,
    #[error("unknown receiver {0}")]
    UnknownReceiver(i64),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChatError {
    fn client_message(&self) -> &'static str {
        match self {
            ChatError::Invalid => "Invalid chat message",
            ChatError::UnknownReceiver(_) => "Unknown receiver",
            ChatError::Storage(_) | ChatError::Encode(_) => "Failed to process message",
        }
    }
}

trait IntoCloseFrame {
    fn into_close_frame(self) -> Option<CloseFrame>;
}

impl IntoCloseFrame for Option<CloseFrame> {
    fn into_close_frame(self) -> Option<CloseFrame> {
        self
    }
}

#[derive(Debug, thiserror::Error)]
enum ChatWsError {
    #[error("server is shutting down")]
    Shutdown,
    #[error("replaced by a newer connection")]
    Replaced,
    #[error("logged out")]
    LoggedOut,
    #[error("outbound queue overflow")]
    Dropped,
    #[error("no frame from peer within the read deadline")]
    Timeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EvictReason> for ChatWsError {
    fn from(reason: EvictReason) -> Self {
        match reason {
            EvictReason::Replaced => ChatWsError::Replaced,
            EvictReason::LoggedOut => ChatWsError::LoggedOut,
        }
    }
}

impl IntoCloseFrame for ChatWsError {
    fn into_close_frame(self) -> Option<CloseFrame> {
        let code = match self {
            ChatWsError::Shutdown => close_code::AWAY,
            ChatWsError::Replaced | ChatWsError::LoggedOut | ChatWsError::Timeout => {
                close_code::POLICY
            }
            ChatWsError::Dropped => close_code::AGAIN,
            ChatWsError::WriteTimeout | ChatWsError::Internal(_) => close_code::ERROR,
        };
        let mut reason = match self {
            ChatWsError::Shutdown => "server shutting down".to_owned(),
            other => other.to_string(),
        };
        // control frame payloads are capped at 125 bytes, two of them the code
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }

        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}
