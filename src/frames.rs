use serde::{Deserialize, Serialize};

use crate::store::{HistoryEntry, MessageStatus};

/// Wire format for timestamps, matching what clients already parse.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Inbound WebSocket frames.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "text")]
    Text { text: String },
    /// `data` is a browser data-URL: `data:<mime>;base64,<payload>`.
    #[serde(rename = "file")]
    File {
        data: String,
        filename: String,
        mimetype: String,
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "read")]
    Read { message_id: i64 },
}

/// Outbound WebSocket frames. Presence notices are deliberately not here:
/// they go out as bare strings, not JSON.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "text")]
    Text {
        message_id: i64,
        timestamp: String,
        sender: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<MessageStatus>,
    },
    #[serde(rename = "file")]
    File {
        message_id: i64,
        timestamp: String,
        sender: String,
        file_url: String,
        /// Caption, possibly empty.
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<MessageStatus>,
    },
    #[serde(rename = "status_update")]
    StatusUpdate {
        message_id: i64,
        timestamp: String,
        sender: String,
        content: Option<String>,
        file_url: Option<String>,
        status: MessageStatus,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    /// Render a persisted message as a replayable history frame.
    pub fn from_history(entry: &HistoryEntry) -> Self {
        let message = &entry.message;
        let timestamp = message.sent_at.format(TIMESTAMP_FORMAT).to_string();
        match &message.file_url {
            Some(url) => ServerFrame::File {
                message_id: message.id,
                timestamp,
                sender: entry.sender_name.clone(),
                file_url: url.clone(),
                text: message.content.clone().unwrap_or_default(),
                status: message.status,
            },
            None => ServerFrame::Text {
                message_id: message.id,
                timestamp,
                sender: entry.sender_name.clone(),
                text: message.content.clone().unwrap_or_default(),
                status: message.status,
            },
        }
    }

    /// A delivery-status notification for a direct message.
    pub fn status_update(entry: &HistoryEntry, status: MessageStatus) -> Self {
        let message = &entry.message;
        ServerFrame::StatusUpdate {
            message_id: message.id,
            timestamp: message.sent_at.format(TIMESTAMP_FORMAT).to_string(),
            sender: entry.sender_name.clone(),
            content: message.content.clone(),
            file_url: message.file_url.clone(),
            status,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Presence notice broadcast when a member joins a room.
pub fn online_notice(name: &str) -> String {
    format!("{name} is online.")
}

/// Presence notice broadcast when a member's socket goes away.
pub fn left_notice(name: &str) -> String {
    format!("{name} has left the chat.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredMessage;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn entry(content: Option<&str>, file_url: Option<&str>, status: Option<MessageStatus>) -> HistoryEntry {
        HistoryEntry {
            message: StoredMessage {
                id: 12,
                content: content.map(Into::into),
                sender_id: 1,
                room_id: None,
                receiver_id: Some(2),
                sent_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
                status,
                file_url: file_url.map(Into::into),
                file_type: file_url.map(|_| "image/png".into()),
            },
            sender_name: "Alice Anders".into(),
        }
    }

    #[test]
    fn parses_text_frame() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Text { text } if text == "hi"));
    }

    #[test]
    fn parses_file_frame_without_caption() {
        let raw = r#"{"type":"file","data":"data:image/png;base64,aGk=","filename":"a.png","mimetype":"image/png"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::File { text, filename, .. } => {
                assert_eq!(text, None);
                assert_eq!(filename, "a.png");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_frame_with_missing_field() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"text"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"read"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"poke"}"#).is_err());
    }

    #[test]
    fn history_without_file_renders_as_text() {
        let frame = ServerFrame::from_history(&entry(Some("hi"), None, None));
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["sender"], "Alice Anders");
        assert_eq!(value["timestamp"], "2026-03-14 09:26:53");
        // room-path frames have no status key at all
        assert!(value.get("status").is_none());
    }

    #[test]
    fn history_with_file_renders_as_file() {
        let frame = ServerFrame::from_history(&entry(
            Some("caption"),
            Some("/uploads/messages/x_a.png"),
            Some(MessageStatus::Delivered),
        ));
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["file_url"], "/uploads/messages/x_a.png");
        assert_eq!(value["text"], "caption");
        assert_eq!(value["status"], "delivered");
    }

    #[test]
    fn status_update_shape() {
        let frame = ServerFrame::status_update(&entry(Some("hi"), None, Some(MessageStatus::Sent)), MessageStatus::Read);
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "status_update",
                "message_id": 12,
                "timestamp": "2026-03-14 09:26:53",
                "sender": "Alice Anders",
                "content": "hi",
                "file_url": null,
                "status": "read",
            })
        );
    }

    #[test]
    fn presence_notices_are_bare_strings() {
        assert_eq!(online_notice("Alice Anders"), "Alice Anders is online.");
        assert_eq!(left_notice("Alice Anders"), "Alice Anders has left the chat.");
        assert!(serde_json::from_str::<Value>(&online_notice("x")).is_err());
    }
}
