use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{ConversationId, UserId};

/// Literal confirmation text carried by every ack frame.
pub const ACK_TEXT: &str = "Message delivered";

/// The `type` discriminator of a wire frame.
///
/// Anything the server does not recognise (including a missing `type`)
/// decodes as `Unknown` so the reader can log and skip it instead of
/// dropping the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    #[serde(rename = "message")]
    Chat,
    #[serde(rename = "typing")]
    Typing,
    #[serde(rename = "ack")]
    Ack,
    #[default]
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "message",
            Self::Typing => "typing",
            Self::Ack => "ack",
            Self::Unknown => "unknown",
        }
    }
}

/// One JSON object per WebSocket text frame, in both directions.
///
/// `author_id` and `sent_at` are always stamped by the server; whatever the
/// client puts there is discarded. `reciever_id` keeps the historical
/// spelling clients already send.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "type", default)]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "UserId::is_unset")]
    pub author_id: UserId,
    #[serde(rename = "reciever_id", default, skip_serializing_if = "UserId::is_unset")]
    pub recipient_id: UserId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<i64>,
}

impl ChatFrame {
    /// Acknowledgement written straight back to the sender of a chat frame.
    pub fn ack(temp_id: Option<i64>, conversation_id: ConversationId) -> Self {
        Self {
            kind: FrameKind::Ack,
            conversation_id: Some(conversation_id),
            content: ACK_TEXT.to_string(),
            temp_id,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client-supplied timestamps are ignored, so a malformed one must not
/// fail the whole frame.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

/// Error frame sent to a single connection, e.g. `{"error":"Unauthorized"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<i64>,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>, temp_id: Option<i64>) -> Self {
        Self {
            error: error.into(),
            temp_id,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new("Unauthorized", None)
    }

    pub fn not_saved(temp_id: Option<i64>) -> Self {
        Self::new("Message could not be saved", temp_id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A unit of fan-out work handed to the dispatcher.
///
/// Carrying a concrete `ConversationId` (not an `Option`) makes "resolved
/// before dispatch" a property of the type.
#[derive(Clone, Debug, PartialEq)]
pub enum Broadcast {
    Chat {
        author_id: UserId,
        recipient_id: UserId,
        conversation_id: ConversationId,
        content: String,
        sent_at: DateTime<Utc>,
        temp_id: Option<i64>,
    },
    Typing {
        author_id: UserId,
        conversation_id: ConversationId,
        sent_at: DateTime<Utc>,
    },
}

impl Broadcast {
    pub fn author_id(&self) -> UserId {
        match self {
            Self::Chat { author_id, .. } | Self::Typing { author_id, .. } => *author_id,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Chat {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Chat { .. } => FrameKind::Chat,
            Self::Typing { .. } => FrameKind::Typing,
        }
    }

    /// Fan-out predicate evaluated once per registered member.
    ///
    /// Chat goes to the recipient only. Typing goes to every connected
    /// member except the author, regardless of conversation.
    pub fn should_deliver_to(&self, member: UserId) -> bool {
        match self {
            Self::Chat {
                author_id,
                recipient_id,
                ..
            } => member == *recipient_id && member != *author_id,
            Self::Typing { author_id, .. } => member != *author_id,
        }
    }

    pub fn to_frame(&self) -> ChatFrame {
        match self {
            Self::Chat {
                author_id,
                recipient_id,
                conversation_id,
                content,
                sent_at,
                temp_id,
            } => ChatFrame {
                kind: FrameKind::Chat,
                author_id: *author_id,
                recipient_id: *recipient_id,
                conversation_id: Some(*conversation_id),
                content: content.clone(),
                sent_at: Some(*sent_at),
                temp_id: *temp_id,
            },
            Self::Typing {
                author_id,
                conversation_id,
                sent_at,
            } => ChatFrame {
                kind: FrameKind::Typing,
                author_id: *author_id,
                conversation_id: Some(*conversation_id),
                sent_at: Some(*sent_at),
                ..ChatFrame::default()
            },
        }
    }
}

/// Projection of a chat frame that reaches the message store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub author_id: UserId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(author: i64, recipient: i64) -> Broadcast {
        Broadcast::Chat {
            author_id: UserId::new(author),
            recipient_id: UserId::new(recipient),
            conversation_id: ConversationId::new(1),
            content: "hi".into(),
            sent_at: Utc::now(),
            temp_id: Some(42),
        }
    }

    #[test]
    fn decode_client_chat_frame() {
        let raw = r#"{"type":"message","reciever_id":7,"content":"hi","temp_id":42}"#;
        let frame: ChatFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.kind, FrameKind::Chat);
        assert_eq!(frame.recipient_id, UserId::new(7));
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.temp_id, Some(42));
        assert!(frame.conversation_id.is_none());
        assert!(frame.author_id.is_unset());
    }

    #[test]
    fn unknown_and_missing_type_decode_as_unknown() {
        let frame: ChatFrame = serde_json::from_str(r#"{"type":"user_status"}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
        let frame: ChatFrame = serde_json::from_str(r#"{"content":"x"}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
    }

    #[test]
    fn null_conversation_id_accepted() {
        let frame: ChatFrame =
            serde_json::from_str(r#"{"type":"typing","conversation_id":null}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Typing);
        assert!(frame.conversation_id.is_none());
    }

    #[test]
    fn malformed_client_timestamp_is_dropped() {
        let frame: ChatFrame =
            serde_json::from_str(r#"{"type":"message","sent_at":"yesterday"}"#).unwrap();
        assert!(frame.sent_at.is_none());
    }

    #[test]
    fn non_object_fails_to_decode() {
        assert!(serde_json::from_str::<ChatFrame>("[1,2]").is_err());
        assert!(serde_json::from_str::<ChatFrame>("not json").is_err());
    }

    #[test]
    fn ack_wire_shape() {
        let ack = ChatFrame::ack(Some(42), ConversationId::new(9));
        let json: serde_json::Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["temp_id"], 42);
        assert_eq!(json["conversation_id"], 9);
        assert_eq!(json["content"], "Message delivered");
        assert!(json.get("author_id").is_none());
    }

    #[test]
    fn chat_broadcast_wire_shape() {
        let frame = chat(3, 7).to_frame();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["author_id"], 3);
        assert_eq!(json["reciever_id"], 7);
        assert_eq!(json["conversation_id"], 1);
        assert_eq!(json["content"], "hi");
        assert!(json["sent_at"].is_string());
    }

    #[test]
    fn chat_goes_to_recipient_only() {
        let msg = chat(3, 7);
        assert!(msg.should_deliver_to(UserId::new(7)));
        assert!(!msg.should_deliver_to(UserId::new(3)));
        assert!(!msg.should_deliver_to(UserId::new(11)));
    }

    #[test]
    fn typing_goes_to_everyone_but_author() {
        let msg = Broadcast::Typing {
            author_id: UserId::new(3),
            conversation_id: ConversationId::new(1),
            sent_at: Utc::now(),
        };
        assert!(!msg.should_deliver_to(UserId::new(3)));
        assert!(msg.should_deliver_to(UserId::new(7)));
        assert!(msg.should_deliver_to(UserId::new(11)));
        assert_eq!(msg.to_frame().kind, FrameKind::Typing);
        assert!(msg.to_frame().content.is_empty());
    }

    #[test]
    fn error_frame_shape() {
        let json = ErrorFrame::unauthorized().to_json().unwrap();
        assert_eq!(json, r#"{"error":"Unauthorized"}"#);
        let json: serde_json::Value =
            serde_json::from_str(&ErrorFrame::not_saved(Some(5)).to_json().unwrap()).unwrap();
        assert_eq!(json["temp_id"], 5);
    }
}
