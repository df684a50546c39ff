//! Control API handlers.
//!
//! Implements the service-to-service endpoints:
//!
//! - `POST /api/v1/messages/private` - chat to one user
//! - `POST /api/v1/messages/room` - chat to a room
//! - `POST /api/v1/notifications` - notification to one user
//! - `GET /api/v1/presence/online-count` - users online cluster-wide
//! - `GET /api/v1/presence/users/{userId}` - is one user online
//! - `GET /api/v1/rooms/{roomId}/participants/count` - room size
//! - `GET /api/v1/users/{userId}/mailbox` - consume pending mailbox entries
//! - `DELETE /api/v1/users/{userId}/rooms` - leave every room
//!
//! All routes sit behind `require_service_token`.

use crate::delivery::NotificationRequest;
use crate::errors::ChatError;
use crate::protocol::{Envelope, Priority};
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use common::types::{MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessageRequest {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessageRequest {
    pub sender_id: String,
    pub room_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBody {
    pub receiver_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub action_url: Option<String>,
}

/// Returned for every accepted send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAccepted {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
}

impl From<&Envelope> for SendAccepted {
    fn from(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            timestamp: envelope.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedRooms {
    pub removed_rooms: Vec<RoomId>,
}

fn parse_user(raw: &str, field: &str) -> Result<UserId, ChatError> {
    UserId::parse(raw).map_err(|e| ChatError::BadRequest(format!("{field}: {e}")))
}

fn parse_room(raw: &str, field: &str) -> Result<RoomId, ChatError> {
    RoomId::parse(raw).map_err(|e| ChatError::BadRequest(format!("{field}: {e}")))
}

/// Handler for `POST /api/v1/messages/private`.
#[instrument(skip_all, name = "chat.control.send_private")]
pub async fn send_private_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrivateMessageRequest>,
) -> Result<(StatusCode, Json<SendAccepted>), ChatError> {
    let sender = parse_user(&body.sender_id, "senderId")?;
    let receiver = parse_user(&body.receiver_id, "receiverId")?;
    let envelope = state
        .delivery
        .send_private_message(sender, receiver, body.content)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SendAccepted::from(&envelope))))
}

/// Handler for `POST /api/v1/messages/room`.
#[instrument(skip_all, name = "chat.control.send_room")]
pub async fn send_room_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RoomMessageRequest>,
) -> Result<(StatusCode, Json<SendAccepted>), ChatError> {
    let sender = parse_user(&body.sender_id, "senderId")?;
    let room = parse_room(&body.room_id, "roomId")?;
    let envelope = state
        .delivery
        .send_room_message(sender, room, body.content)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SendAccepted::from(&envelope))))
}

/// Handler for `POST /api/v1/notifications`.
#[instrument(skip_all, name = "chat.control.send_notification")]
pub async fn send_notification(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NotificationBody>,
) -> Result<(StatusCode, Json<SendAccepted>), ChatError> {
    let receiver = parse_user(&body.receiver_id, "receiverId")?;
    let envelope = state
        .delivery
        .send_notification(NotificationRequest {
            receiver,
            title: body.title,
            content: body.content,
            notification_type: body.notification_type,
            priority: body.priority.unwrap_or_default(),
            action_url: body.action_url,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SendAccepted::from(&envelope))))
}

/// Handler for `GET /api/v1/presence/online-count`.
pub async fn online_count(State(state): State<Arc<AppState>>) -> Result<Json<usize>, ChatError> {
    Ok(Json(state.delivery.online_count().await?))
}

/// Handler for `GET /api/v1/presence/users/{userId}`.
pub async fn user_presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<bool>, ChatError> {
    let user = parse_user(&user_id, "userId")?;
    Ok(Json(state.delivery.is_online(&user).await?))
}

/// Handler for `GET /api/v1/rooms/{roomId}/participants/count`.
pub async fn participant_count(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<usize>, ChatError> {
    let room = parse_room(&room_id, "roomId")?;
    Ok(Json(state.delivery.participant_count(&room).await?))
}

/// Handler for `GET /api/v1/users/{userId}/mailbox`.
///
/// Consumes the entries it returns.
#[instrument(skip_all, name = "chat.control.take_mailbox")]
pub async fn take_mailbox(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Envelope>>, ChatError> {
    let user = parse_user(&user_id, "userId")?;
    Ok(Json(state.delivery.take_mailbox(&user).await?))
}

/// Handler for `DELETE /api/v1/users/{userId}/rooms`.
#[instrument(skip_all, name = "chat.control.remove_user_rooms")]
pub async fn remove_user_rooms(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<RemovedRooms>, ChatError> {
    let user = parse_user(&user_id, "userId")?;
    let removed_rooms = state.delivery.remove_user_rooms(&user).await?;
    Ok(Json(RemovedRooms { removed_rooms }))
}
