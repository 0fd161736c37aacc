use futures_util::{SinkExt, StreamExt};
use http::{HeaderValue, header};
use log::{debug, info, warn};
use quantum_chat_proto::msg::{ChatContent, WsMessage};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};

use crate::net;

/// Receiver every smoke message is addressed to.
pub const RECEIVER_ID: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("invalid target: {0}")]
    Target(String),
    #[error("connection failed: {0}")]
    Connect(anyhow::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("server closed the connection before answering")]
    Closed,
    #[error("response is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected acknowledgment, got {0:?}")]
    NotAck(Value),
    #[error("expected message ID in response")]
    MissingMessageId,
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub token: String,
    pub prefer_ipv6: bool,
}

impl Target {
    /// Opens a fresh connection, sends one chat frame and returns the first
    /// data frame the server answers with.
    pub async fn exchange(&self, content: ChatContent) -> Result<String, CheckError> {
        let mut req = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| CheckError::Target(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| CheckError::Target(e.to_string()))?;
        req.headers_mut().insert(header::AUTHORIZATION, bearer);

        info!("Connecting to WebSocket server at {}...", self.url);
        let stream = net::connect(req.uri(), self.prefer_ipv6)
            .await
            .map_err(CheckError::Connect)?;
        let (mut ws, _) = tokio_tungstenite::client_async(req, stream).await?;
        info!("Connection established");

        let content = content.into_content()?;
        let frame = serde_json::to_string(&WsMessage::chat(RECEIVER_ID, content))?;
        info!("Sending message: {frame}");
        ws.send(Message::text(frame)).await?;

        let response = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text.as_str().to_owned(),
                Some(Ok(Message::Binary(bytes))) => {
                    break String::from_utf8_lossy(&bytes).into_owned();
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("WebSocket closed by server: {frame:?}");
                    return Err(CheckError::Closed);
                }
                Some(Ok(other)) => debug!("skipping control frame {other:?}"),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(CheckError::Closed),
            }
        };
        info!("Received response: {response}");

        if let Err(e) = ws.close(None).await {
            debug!("closing handshake failed: {e}");
        }
        Ok(response)
    }
}

/// Parses a response frame and requires it to be an ack, optionally with a
/// top level `message_id`.
pub fn expect_ack(response: &str, require_message_id: bool) -> Result<WsMessage, CheckError> {
    let value: Value = serde_json::from_str(response)?;
    if value.get("type").and_then(Value::as_str) != Some("ack") {
        return Err(CheckError::NotAck(value));
    }
    if require_message_id && value.get("message_id").is_none() {
        return Err(CheckError::MissingMessageId);
    }
    Ok(serde_json::from_value(value)?)
}
