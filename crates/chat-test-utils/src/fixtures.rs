//! Test fixtures: identities, envelopes and tokens.

use chat_service::delivery::DeliverySettings;
use chat_service::protocol::{Audience, ChatPayload, Envelope, JoinPayload, Payload};
use common::jwt::{issue_user_token, UserClaims};
use common::types::{RoomId, UserId};
use std::time::Duration;

/// HS256 secret used by every test server.
pub const TEST_JWT_SECRET: &str = "test-jwt-secret-at-least-32-bytes-long";

/// Control API token used by every test server.
pub const TEST_SERVICE_TOKEN: &str = "test-service-token";

/// Content limit used by test instances.
pub const TEST_MAX_CONTENT_LENGTH: usize = 1000;

pub fn user(id: &str) -> UserId {
    UserId::parse(id).expect("valid test user id")
}

pub fn room(id: &str) -> RoomId {
    RoomId::parse(id).expect("valid test room id")
}

/// Delivery settings for instance `instance_id` on the default channels.
pub fn test_settings(instance_id: &str) -> DeliverySettings {
    DeliverySettings {
        instance_id: instance_id.to_string(),
        chat_channel: "chat".to_string(),
        notification_channel: "notification".to_string(),
        max_content_length: TEST_MAX_CONTENT_LENGTH,
    }
}

pub fn chat_to_user(sender: &str, receiver: &str, content: &str) -> Envelope {
    Envelope::new(
        Some(user(sender)),
        Audience::User(user(receiver)),
        Payload::Chat(ChatPayload::text(content)),
    )
    .expect("valid chat envelope")
}

pub fn chat_to_room(sender: &str, room_id: &str, content: &str) -> Envelope {
    Envelope::new(
        Some(user(sender)),
        Audience::Room(room(room_id)),
        Payload::Chat(ChatPayload::text(content)),
    )
    .expect("valid chat envelope")
}

pub fn join_room(sender: &str, room_id: &str) -> Envelope {
    Envelope::new(
        Some(user(sender)),
        Audience::Room(room(room_id)),
        Payload::Join(JoinPayload::default()),
    )
    .expect("valid join envelope")
}

/// Client frame text for a chat to one user.
pub fn chat_frame(receiver: &str, content: &str) -> String {
    serde_json::json!({ "kind": "CHAT", "receiverId": receiver, "content": content }).to_string()
}

/// Client frame text for a chat to a room.
pub fn room_chat_frame(room_id: &str, content: &str) -> String {
    serde_json::json!({ "kind": "CHAT", "roomId": room_id, "content": content }).to_string()
}

/// Client frame text for a room join.
pub fn join_frame(room_id: &str) -> String {
    serde_json::json!({ "kind": "JOIN", "roomId": room_id }).to_string()
}

/// A bearer token for `user_id` signed with [`TEST_JWT_SECRET`].
pub fn test_user_token(user_id: &str) -> String {
    let claims = UserClaims::for_user(user_id, Duration::from_secs(3600));
    issue_user_token(TEST_JWT_SECRET.as_bytes(), &claims).expect("token signing")
}
