use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Attachment, ConversationId, CorrelationId, MessageId, MessageKind, UserId,
};

/// One frame from the live channel: an event name plus an untyped payload.
/// The payload schema varies between server versions; normalization happens
/// against the `Raw*` shapes below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveFrame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl LiveFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Retraction,
    Typing,
    StoppedTyping,
    SendAck,
}

/// Folds the legacy event-name aliases the live channel still emits onto one
/// canonical kind. Unknown names are dropped by the router.
pub fn fold_event_alias(name: &str) -> Option<EventKind> {
    match name {
        "message" | "message.created" | "new_message" => Some(EventKind::Message),
        "message.deleted" | "message.retracted" | "delete_message" => Some(EventKind::Retraction),
        "typing" | "typing.started" | "composing" => Some(EventKind::Typing),
        "typing.stopped" | "paused" => Some(EventKind::StoppedTyping),
        "ack" | "message.ack" => Some(EventKind::SendAck),
        _ => None,
    }
}

/// Timestamps arrive either as RFC 3339 strings or epoch milliseconds
/// depending on the emitting server component.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

impl RawTimestamp {
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Rfc3339(ts) => Some(ts),
            RawTimestamp::EpochMillis(ms) => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttachment {
    #[serde(alias = "link", alias = "href")]
    pub url: String,
    #[serde(default, alias = "filename", alias = "file_name")]
    pub name: Option<String>,
    #[serde(default, alias = "size", alias = "length")]
    pub size_bytes: Option<u64>,
}

impl RawAttachment {
    pub fn into_attachment(self) -> Attachment {
        Attachment {
            name: self
                .name
                .unwrap_or_else(|| trailing_path_segment(&self.url)),
            size_bytes: self.size_bytes.unwrap_or(0),
            url: self.url,
        }
    }
}

fn trailing_path_segment(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

/// Superset of every message payload shape the sources are known to emit.
/// Unknown fields are dropped, not passed through.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessagePayload {
    #[serde(default, alias = "message_id", alias = "messageId")]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "client_id",
        alias = "clientId",
        alias = "correlationId"
    )]
    pub correlation_id: Option<String>,
    #[serde(
        default,
        alias = "chat_id",
        alias = "room_id",
        alias = "conversationId"
    )]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "user_id", alias = "from", alias = "senderId")]
    pub sender_id: Option<String>,
    #[serde(default, alias = "text", alias = "body")]
    pub content: Option<String>,
    #[serde(default, alias = "type", alias = "message_type")]
    pub kind: Option<String>,
    #[serde(default, alias = "file", alias = "media")]
    pub attachment: Option<RawAttachment>,
    #[serde(
        default,
        alias = "timestamp",
        alias = "sent_at",
        alias = "createdAt"
    )]
    pub created_at: Option<RawTimestamp>,
    #[serde(default, alias = "reply_to", alias = "replyTo", alias = "replyToId")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRetractionPayload {
    #[serde(alias = "id", alias = "messageId", alias = "target_id")]
    pub message_id: String,
    #[serde(
        default,
        alias = "chat_id",
        alias = "room_id",
        alias = "conversationId"
    )]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "user_id", alias = "actorId", alias = "from")]
    pub actor_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTypingPayload {
    #[serde(alias = "sender_id", alias = "from", alias = "userId")]
    pub user_id: String,
    #[serde(default, alias = "name", alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(
        default,
        alias = "chat_id",
        alias = "room_id",
        alias = "conversationId"
    )]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAckPayload {
    #[serde(
        alias = "client_id",
        alias = "clientId",
        alias = "correlationId"
    )]
    pub correlation_id: String,
}

/// The shape handed to send transports. Acceptance by a transport is distinct
/// from confirmation; the canonical id arrives later as a message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub correlation_id: CorrelationId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_every_message_alias_to_one_kind() {
        for name in ["message", "message.created", "new_message"] {
            assert_eq!(fold_event_alias(name), Some(EventKind::Message));
        }
        for name in ["message.deleted", "message.retracted", "delete_message"] {
            assert_eq!(fold_event_alias(name), Some(EventKind::Retraction));
        }
        assert_eq!(fold_event_alias("presence.join"), None);
    }

    #[test]
    fn tolerates_renamed_payload_fields() {
        let legacy: RawMessagePayload = serde_json::from_value(serde_json::json!({
            "messageId": "m-1",
            "from": "u-9",
            "body": "hello",
            "timestamp": 1_700_000_000_000_i64,
            "room_id": "c-1",
            "unknown_field": {"dropped": true}
        }))
        .expect("legacy payload");
        assert_eq!(legacy.id.as_deref(), Some("m-1"));
        assert_eq!(legacy.sender_id.as_deref(), Some("u-9"));
        assert_eq!(legacy.content.as_deref(), Some("hello"));
        assert_eq!(legacy.conversation_id.as_deref(), Some("c-1"));
        assert!(legacy.created_at.expect("ts").to_utc().is_some());
    }

    #[test]
    fn parses_both_timestamp_encodings() {
        let rfc: RawTimestamp =
            serde_json::from_value(serde_json::json!("2024-05-01T10:00:00Z")).expect("rfc3339");
        let epoch: RawTimestamp =
            serde_json::from_value(serde_json::json!(1_714_557_600_000_i64)).expect("epoch");
        assert_eq!(rfc.to_utc(), epoch.to_utc());
    }

    #[test]
    fn attachment_falls_back_to_url_segment_for_name() {
        let raw: RawAttachment = serde_json::from_value(serde_json::json!({
            "href": "https://cdn.example/files/report.pdf",
            "size": 2048
        }))
        .expect("attachment");
        let attachment = raw.into_attachment();
        assert_eq!(attachment.name, "report.pdf");
        assert_eq!(attachment.size_bytes, 2048);
    }
}
