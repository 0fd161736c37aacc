use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator of a frame on the chat socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Chat,
    Ack,
    Error,
    System,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Envelope of every JSON frame exchanged over `/ws`.
///
/// `content` is opaque to the server: it is stored and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
}

impl WsMessage {
    pub fn chat(receiver_id: i64, content: Value) -> Self {
        WsMessage {
            kind: MessageType::Chat,
            content,
            receiver_id: Some(receiver_id),
            sender_id: None,
            timestamp: None,
            message_id: None,
        }
    }

    pub fn ack(sender_id: i64, message_id: i64, status: AckStatus, timestamp: i64) -> Self {
        WsMessage {
            kind: MessageType::Ack,
            content: serde_json::json!({ "status": status, "message_id": message_id }),
            receiver_id: None,
            sender_id: Some(sender_id),
            timestamp: Some(timestamp),
            message_id: Some(message_id),
        }
    }

    pub fn error(sender_id: i64, error: &str, timestamp: i64) -> Self {
        WsMessage {
            kind: MessageType::Error,
            content: serde_json::json!({ "error": error }),
            receiver_id: None,
            sender_id: Some(sender_id),
            timestamp: Some(timestamp),
            message_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Queued on the receiver's live connection.
    Delivered,
    /// Persisted only; the receiver was offline.
    Stored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckContent {
    pub status: AckStatus,
    pub message_id: i64,
}

/// Body a chat client puts inside `content`, JSON-encoded as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatContent {
    pub fn into_content(self) -> serde_json::Result<Value> {
        serde_json::to_string(&self).map(Value::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_frame_omits_unset_fields() {
        let content = ChatContent {
            text: "Hello!".into(),
            timestamp: None,
        }
        .into_content()
        .unwrap();
        let frame = serde_json::to_value(WsMessage::chat(1, content)).unwrap();

        assert_eq!(
            frame,
            json!({
                "type": "chat",
                "content": "{\"text\":\"Hello!\"}",
                "receiver_id": 1
            })
        );
    }

    #[test]
    fn ack_carries_message_id_twice() {
        let frame = serde_json::to_value(WsMessage::ack(3, 42, AckStatus::Delivered, 100)).unwrap();

        assert_eq!(frame["type"], "ack");
        assert_eq!(frame["message_id"], 42);
        assert_eq!(frame["content"]["message_id"], 42);
        assert_eq!(frame["content"]["status"], "delivered");
        assert_eq!(frame["sender_id"], 3);
        assert!(frame.get("receiver_id").is_none());
    }

    #[test]
    fn ack_content_parses_back() {
        for status in [AckStatus::Delivered, AckStatus::Stored] {
            let ack = WsMessage::ack(1, 9, status, 100);
            let content: AckContent = serde_json::from_value(ack.content).unwrap();
            assert_eq!(content, AckContent { status, message_id: 9 });
        }
    }

    #[test]
    fn unknown_type_does_not_fail_parsing() {
        let msg: WsMessage = serde_json::from_str(r#"{"type":"typing","content":{}}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);

        let msg: WsMessage = serde_json::from_str(r#"{"content":"x"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
    }

    #[test]
    fn error_frame_shape() {
        let frame = serde_json::to_value(WsMessage::error(5, "Unknown message type", 1)).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["content"], json!({"error": "Unknown message type"}));
        assert!(frame.get("message_id").is_none());
    }
}
