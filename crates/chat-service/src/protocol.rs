//! Chat wire protocol.
//!
//! Every WebSocket text frame and every broker payload is one JSON object:
//!
//! ```text
//! {
//!   "kind": "CHAT" | "TYPING" | "JOIN" | "LEAVE" | "NOTIFICATION" | "SYSTEM"
//!         | "CONNECT" | "DISCONNECT" | "ERROR",
//!   "messageId": "...",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "senderId": "alice" | null,
//!   "receiverId": "bob" | null,
//!   "roomId": "group_42" | null,
//!   ...kind-specific fields...
//! }
//! ```
//!
//! # Audience
//!
//! `receiverId` and `roomId` are mutually exclusive. They are folded into a
//! single [`Audience`] at decode time so the "at most one target" rule is
//! carried by the type. Targeted kinds additionally check which audience
//! they accept (see [`Envelope::validate`]).
//!
//! # Client frames
//!
//! Frames from clients go through [`decode_client_frame`], which rejects
//! server-only kinds, overwrites the sender with the authenticated identity
//! and fills in `messageId`/`timestamp` when the client omitted them.

use chrono::{DateTime, Utc};
use common::types::{MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// System message code sent right after a connection is registered.
pub const CONNECTED_CODE: &str = "CONNECTED";

/// Error code for frames that could not be decoded.
pub const INVALID_MESSAGE_CODE: &str = "INVALID_MESSAGE";

/// Error code for frames that decoded but could not be dispatched.
pub const DELIVERY_FAILED_CODE: &str = "DELIVERY_FAILED";

/// Errors raised while decoding or validating an envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame was not valid JSON or did not match the envelope shape.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Both `receiverId` and `roomId` were set.
    #[error("A message cannot target both a receiver and a room")]
    ConflictingTarget,

    /// A targeted kind arrived without a target.
    #[error("{0} messages require a target")]
    MissingTarget(MessageKind),

    /// A kind arrived with a target it does not accept.
    #[error("{0} messages cannot be sent to that target")]
    InvalidTarget(MessageKind),

    /// A required field was absent.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// The kind may only be produced by the server.
    #[error("{0} messages cannot be sent by clients")]
    NotAcceptedFromClient(MessageKind),

    /// Message content failed validation.
    #[error("Invalid content: {0}")]
    InvalidContent(String),
}

/// Discriminator of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Chat,
    Typing,
    Join,
    Leave,
    Notification,
    System,
    Connect,
    Disconnect,
    Error,
}

impl MessageKind {
    /// Wire name of the kind, also used as a metrics label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Chat => "CHAT",
            MessageKind::Typing => "TYPING",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
            MessageKind::Notification => "NOTIFICATION",
            MessageKind::System => "SYSTEM",
            MessageKind::Connect => "CONNECT",
            MessageKind::Disconnect => "DISCONNECT",
            MessageKind::Error => "ERROR",
        }
    }

    /// Kinds a client may put on the wire.
    #[must_use]
    pub fn accepted_from_client(self) -> bool {
        matches!(
            self,
            MessageKind::Chat
                | MessageKind::Typing
                | MessageKind::Join
                | MessageKind::Leave
                | MessageKind::Notification
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an envelope is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// A single user (`receiverId`).
    User(UserId),
    /// Members of a room (`roomId`).
    Room(RoomId),
    /// Neither target set.
    Broadcast,
}

impl Audience {
    /// Fold the two optional wire targets into an audience.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::ConflictingTarget` if both are set.
    pub fn from_parts(receiver: Option<UserId>, room: Option<RoomId>) -> Result<Self, DecodeError> {
        match (receiver, room) {
            (Some(_), Some(_)) => Err(DecodeError::ConflictingTarget),
            (Some(user), None) => Ok(Audience::User(user)),
            (None, Some(room)) => Ok(Audience::Room(room)),
            (None, None) => Ok(Audience::Broadcast),
        }
    }

    fn into_parts(self) -> (Option<UserId>, Option<RoomId>) {
        match self {
            Audience::User(user) => (Some(user), None),
            Audience::Room(room) => (None, Some(room)),
            Audience::Broadcast => (None, None),
        }
    }
}

/// Chat content type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    File,
}

/// Typing indicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypingStatus {
    Start,
    Stop,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

fn default_notification_type() -> String {
    "GENERAL".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub is_read: bool,
}

impl ChatPayload {
    /// Plain text chat content with defaults for everything else.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: ContentType::Text,
            attachment_url: None,
            reply_to_message_id: None,
            is_read: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub status: TypingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub content: String,
    #[serde(default = "default_notification_type")]
    pub notification_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPayload {
    pub content: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub content: String,
    pub code: String,
}

/// Kind-specific part of an envelope, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Chat(ChatPayload),
    Typing(TypingPayload),
    Join(JoinPayload),
    Leave(LeavePayload),
    Notification(NotificationPayload),
    System(SystemPayload),
    Connect,
    Disconnect,
    Error(ErrorPayload),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Chat(_) => MessageKind::Chat,
            Payload::Typing(_) => MessageKind::Typing,
            Payload::Join(_) => MessageKind::Join,
            Payload::Leave(_) => MessageKind::Leave,
            Payload::Notification(_) => MessageKind::Notification,
            Payload::System(_) => MessageKind::System,
            Payload::Connect => MessageKind::Connect,
            Payload::Disconnect => MessageKind::Disconnect,
            Payload::Error(_) => MessageKind::Error,
        }
    }
}

/// On-the-wire shape. Identity and timing fields are optional here so that
/// client frames can omit them; [`Envelope`] is the validated form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default)]
    message_id: Option<MessageId>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    sender_id: Option<UserId>,
    #[serde(default)]
    receiver_id: Option<UserId>,
    #[serde(default)]
    room_id: Option<RoomId>,
    #[serde(flatten)]
    payload: Payload,
}

/// A validated message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    /// `None` only for server-originated frames (System, Error, control-API
    /// notifications).
    pub sender_id: Option<UserId>,
    pub audience: Audience,
    pub payload: Payload,
}

impl Envelope {
    /// Build a new envelope with a fresh id and the current time.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if the payload kind does not accept the audience.
    pub fn new(
        sender_id: Option<UserId>,
        audience: Audience,
        payload: Payload,
    ) -> Result<Self, DecodeError> {
        let envelope = Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            sender_id,
            audience,
            payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Server-originated System message addressed to one user.
    #[must_use]
    pub fn system(
        recipient: UserId,
        code: impl Into<String>,
        content: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            sender_id: None,
            audience: Audience::User(recipient),
            payload: Payload::System(SystemPayload {
                content: content.into(),
                code: code.into(),
                data,
            }),
        }
    }

    /// Server-originated Error frame addressed to one user.
    #[must_use]
    pub fn error(recipient: UserId, code: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            sender_id: None,
            audience: Audience::User(recipient),
            payload: Payload::Error(ErrorPayload {
                content: content.into(),
                code: code.into(),
            }),
        }
    }

    /// Disconnect presence event for `user`, addressed to `room`.
    #[must_use]
    pub fn disconnect(user: UserId, room: RoomId) -> Self {
        Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            sender_id: Some(user),
            audience: Audience::Room(room),
            payload: Payload::Disconnect,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Room target, if any.
    #[must_use]
    pub fn room(&self) -> Option<&RoomId> {
        match &self.audience {
            Audience::Room(room) => Some(room),
            _ => None,
        }
    }

    /// User target, if any.
    #[must_use]
    pub fn receiver(&self) -> Option<&UserId> {
        match &self.audience {
            Audience::User(user) => Some(user),
            _ => None,
        }
    }

    /// Check that the payload kind accepts the audience and that user-
    /// originated kinds carry a sender.
    ///
    /// | kind          | accepted audience |
    /// |---------------|-------------------|
    /// | Chat, Typing  | user or room      |
    /// | Join, Leave   | room              |
    /// | Notification  | user              |
    /// | Disconnect    | room              |
    /// | others        | any               |
    ///
    /// # Errors
    ///
    /// Returns the first rule the envelope violates.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let kind = self.kind();
        let targeted = !matches!(self.audience, Audience::Broadcast);
        match kind {
            MessageKind::Chat | MessageKind::Typing => {
                if !targeted {
                    return Err(DecodeError::MissingTarget(kind));
                }
            }
            MessageKind::Join | MessageKind::Leave | MessageKind::Disconnect => match self.audience {
                Audience::Room(_) => {}
                Audience::Broadcast => return Err(DecodeError::MissingTarget(kind)),
                Audience::User(_) => return Err(DecodeError::InvalidTarget(kind)),
            },
            MessageKind::Notification => match self.audience {
                Audience::User(_) => {}
                Audience::Broadcast => return Err(DecodeError::MissingTarget(kind)),
                Audience::Room(_) => return Err(DecodeError::InvalidTarget(kind)),
            },
            MessageKind::System | MessageKind::Connect | MessageKind::Error => {}
        }

        let needs_sender = matches!(
            kind,
            MessageKind::Chat
                | MessageKind::Typing
                | MessageKind::Join
                | MessageKind::Leave
                | MessageKind::Disconnect
        );
        if needs_sender && self.sender_id.is_none() {
            return Err(DecodeError::MissingField("senderId"));
        }
        Ok(())
    }

    /// Check chat content: non-blank and at most `max_chars` characters.
    ///
    /// Other kinds always pass.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::InvalidContent` for blank or oversized content.
    pub fn validate_content(&self, max_chars: usize) -> Result<(), DecodeError> {
        if let Payload::Chat(chat) = &self.payload {
            if chat.content.trim().is_empty() {
                return Err(DecodeError::InvalidContent(
                    "content must not be blank".to_string(),
                ));
            }
            if chat.content.chars().count() > max_chars {
                return Err(DecodeError::InvalidContent(format!(
                    "content exceeds {max_chars} characters"
                )));
            }
        }
        Ok(())
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns the serializer error (does not happen for well-formed values).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a broker payload. All identity and timing fields must be
    /// present.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if the payload is malformed or violates an
    /// audience rule.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = DecodeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let envelope = Envelope {
            message_id: wire.message_id.ok_or(DecodeError::MissingField("messageId"))?,
            timestamp: wire.timestamp.ok_or(DecodeError::MissingField("timestamp"))?,
            sender_id: wire.sender_id,
            audience: Audience::from_parts(wire.receiver_id, wire.room_id)?,
            payload: wire.payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (receiver_id, room_id) = envelope.audience.into_parts();
        WireEnvelope {
            message_id: Some(envelope.message_id),
            timestamp: Some(envelope.timestamp),
            sender_id: envelope.sender_id,
            receiver_id,
            room_id,
            payload: envelope.payload,
        }
    }
}

/// Decode a frame received from an authenticated client.
///
/// The sender is always `identity`, whatever the frame claims. A missing
/// `messageId` or `timestamp` is generated.
///
/// # Errors
///
/// Returns `DecodeError` for malformed JSON, server-only kinds, audience
/// violations and invalid chat content.
pub fn decode_client_frame(
    text: &str,
    identity: &UserId,
    max_content_chars: usize,
) -> Result<Envelope, DecodeError> {
    let wire: WireEnvelope =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let kind = wire.payload.kind();
    if !kind.accepted_from_client() {
        return Err(DecodeError::NotAcceptedFromClient(kind));
    }

    let envelope = Envelope {
        message_id: wire.message_id.unwrap_or_default(),
        timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        sender_id: Some(identity.clone()),
        audience: Audience::from_parts(wire.receiver_id, wire.room_id)?,
        payload: wire.payload,
    };
    envelope.validate()?;
    envelope.validate_content(max_content_chars)?;
    Ok(envelope)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    #[test]
    fn test_chat_to_room_wire_shape() {
        let envelope = Envelope::new(
            Some(user("alice")),
            Audience::Room(room("lobby")),
            Payload::Chat(ChatPayload::text("hi")),
        )
        .unwrap();

        let value: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["kind"], "CHAT");
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["roomId"], "lobby");
        assert_eq!(value["receiverId"], Value::Null);
        assert_eq!(value["content"], "hi");
        assert_eq!(value["contentType"], "TEXT");
        assert_eq!(value["isRead"], false);
        assert!(value["messageId"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_broker_decode_is_field_for_field_equal() {
        let original = Envelope::new(
            Some(user("alice")),
            Audience::User(user("bob")),
            Payload::Chat(ChatPayload {
                content: "see attached".to_string(),
                content_type: ContentType::Image,
                attachment_url: Some("https://cdn.example/a.png".to_string()),
                reply_to_message_id: Some(MessageId("m-1".to_string())),
                is_read: false,
            }),
        )
        .unwrap();

        let decoded = Envelope::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_notification_defaults() {
        let text = json!({
            "kind": "NOTIFICATION",
            "messageId": "n-1",
            "timestamp": "2024-05-01T12:00:00Z",
            "senderId": null,
            "receiverId": "carol",
            "roomId": null,
            "title": "Welcome",
            "content": "Hello Carol"
        })
        .to_string();

        let envelope = Envelope::from_json(&text).unwrap();
        let Payload::Notification(n) = &envelope.payload else {
            panic!("expected notification");
        };
        assert_eq!(n.notification_type, "GENERAL");
        assert_eq!(n.priority, Priority::Normal);
        assert_eq!(envelope.receiver(), Some(&user("carol")));
    }

    #[test]
    fn test_both_targets_rejected() {
        let text = json!({
            "kind": "CHAT",
            "receiverId": "bob",
            "roomId": "lobby",
            "content": "hi"
        })
        .to_string();

        assert_eq!(
            decode_client_frame(&text, &user("alice"), 1000).unwrap_err(),
            DecodeError::ConflictingTarget
        );
    }

    #[test]
    fn test_chat_without_target_rejected() {
        let text = json!({"kind": "CHAT", "content": "hi"}).to_string();

        assert_eq!(
            decode_client_frame(&text, &user("alice"), 1000).unwrap_err(),
            DecodeError::MissingTarget(MessageKind::Chat)
        );
    }

    #[test]
    fn test_join_requires_room() {
        let text = json!({"kind": "JOIN", "receiverId": "bob"}).to_string();
        assert_eq!(
            decode_client_frame(&text, &user("alice"), 1000).unwrap_err(),
            DecodeError::InvalidTarget(MessageKind::Join)
        );

        let text = json!({"kind": "LEAVE"}).to_string();
        assert_eq!(
            decode_client_frame(&text, &user("alice"), 1000).unwrap_err(),
            DecodeError::MissingTarget(MessageKind::Leave)
        );
    }

    #[test]
    fn test_notification_to_room_rejected() {
        let result = Envelope::new(
            None,
            Audience::Room(room("lobby")),
            Payload::Notification(NotificationPayload {
                title: "t".to_string(),
                content: "c".to_string(),
                notification_type: default_notification_type(),
                priority: Priority::High,
                action_url: None,
            }),
        );
        assert_eq!(
            result.unwrap_err(),
            DecodeError::InvalidTarget(MessageKind::Notification)
        );
    }

    #[test]
    fn test_client_sender_is_overwritten() {
        let text = json!({
            "kind": "CHAT",
            "senderId": "mallory",
            "roomId": "lobby",
            "content": "hi"
        })
        .to_string();

        let envelope = decode_client_frame(&text, &user("alice"), 1000).unwrap();
        assert_eq!(envelope.sender_id, Some(user("alice")));
    }

    #[test]
    fn test_client_frame_gets_generated_id_and_timestamp() {
        let text = json!({"kind": "TYPING", "roomId": "lobby", "status": "START"}).to_string();

        let before = Utc::now();
        let envelope = decode_client_frame(&text, &user("alice"), 1000).unwrap();
        assert!(!envelope.message_id.0.is_empty());
        assert!(envelope.timestamp >= before);
    }

    #[test]
    fn test_server_kinds_rejected_from_clients() {
        for kind in ["SYSTEM", "CONNECT", "DISCONNECT", "ERROR"] {
            let text = json!({
                "kind": kind,
                "roomId": "lobby",
                "content": "x",
                "code": "X"
            })
            .to_string();
            let err = decode_client_frame(&text, &user("alice"), 1000).unwrap_err();
            assert!(
                matches!(err, DecodeError::NotAcceptedFromClient(_)),
                "{kind} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_chat_content_validation() {
        let blank = json!({"kind": "CHAT", "roomId": "lobby", "content": "   "}).to_string();
        assert!(matches!(
            decode_client_frame(&blank, &user("alice"), 1000),
            Err(DecodeError::InvalidContent(_))
        ));

        let long = json!({"kind": "CHAT", "roomId": "lobby", "content": "x".repeat(11)}).to_string();
        assert!(matches!(
            decode_client_frame(&long, &user("alice"), 10),
            Err(DecodeError::InvalidContent(_))
        ));

        let exact = json!({"kind": "CHAT", "roomId": "lobby", "content": "x".repeat(10)}).to_string();
        assert!(decode_client_frame(&exact, &user("alice"), 10).is_ok());
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode_client_frame("not json", &user("alice"), 1000),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"kind":"SHOUT"}"#, &user("alice"), 1000),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"kind":"CHAT","roomId":"bad room","content":"x"}"#, &user("alice"), 1000),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_broker_decode_requires_message_id() {
        let text = json!({
            "kind": "CHAT",
            "timestamp": "2024-05-01T12:00:00Z",
            "senderId": "alice",
            "roomId": "lobby",
            "content": "hi"
        })
        .to_string();

        assert!(matches!(
            Envelope::from_json(&text),
            Err(DecodeError::Malformed(msg)) if msg.contains("messageId")
        ));
    }

    #[test]
    fn test_system_and_connect_round_trip() {
        let system = Envelope::system(user("alice"), CONNECTED_CODE, "connected", None);
        let decoded = Envelope::from_json(&system.to_json().unwrap()).unwrap();
        assert_eq!(decoded, system);

        let disconnect = Envelope::disconnect(user("alice"), room("lobby"));
        let value: Value = serde_json::to_value(&disconnect).unwrap();
        assert_eq!(value["kind"], "DISCONNECT");
        assert_eq!(Envelope::from_json(&value.to_string()).unwrap(), disconnect);
    }
}
