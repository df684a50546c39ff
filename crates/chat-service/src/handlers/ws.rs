//! WebSocket endpoint.
//!
//! `GET /ws/chat?userId=<id>` or with `Authorization: Bearer <jwt>`.
//! The handshake is authenticated before the upgrade; a rejected handshake
//! gets a 401 and no upgrade.
//!
//! # Socket tasks
//!
//! Each accepted socket runs two tasks sharing one `CancellationToken`:
//!
//! - reader (this handler's task): decodes text frames and dispatches them
//!   in arrival order
//! - writer: drains the connection's outbound queue into the socket
//!
//! Either side finishing cancels the other. The connection is then
//! unregistered, only if it is still the registered one.

use crate::handshake::HandshakeContext;
use crate::protocol::{Envelope, INVALID_MESSAGE_CODE};
use crate::registry::Connection;
use crate::routes::AppState;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::types::UserId;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Handler for `GET /ws/chat`.
#[instrument(skip_all, name = "chat.ws.upgrade")]
pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let context = HandshakeContext::from_request(&query, &headers);
    let user = match state.authenticator.authenticate(&context).await {
        Ok(user) => user,
        Err(reason) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": { "code": "UNAUTHORIZED", "message": reason.to_string() }
                })),
            )
                .into_response();
        }
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| run_socket(socket, user, state)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn run_socket(socket: WebSocket, user: UserId, state: Arc<AppState>) {
    let cancel_token = state.shutdown.child_token();
    let (connection, outbound) =
        Connection::new(user.clone(), state.connection_buffer, cancel_token.clone());
    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(write_frames(sink, outbound, cancel_token.clone()));

    state.delivery.connect(Arc::clone(&connection)).await;

    loop {
        let message = tokio::select! {
            () = cancel_token.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                state.delivery.handle_client_frame(&connection, &text).await;
            }
            Some(Ok(Message::Binary(_))) => {
                connection.touch();
                let reply = Envelope::error(
                    user.clone(),
                    INVALID_MESSAGE_CODE,
                    "Binary frames are not supported",
                );
                state.delivery.registry().send_local(&user, &reply).await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.touch(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(target: "chat.ws", user_id = %user, error = %e, "Socket read failed");
                break;
            }
        }
    }

    cancel_token.cancel();
    // the writer only ends on cancel or socket error
    let _ = writer.await;
    state.delivery.disconnect(&user, connection.id()).await;
    info!(target: "chat.ws", user_id = %user, "Socket closed");
}

async fn write_frames(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    cancel_token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
            debug!(target: "chat.ws", error = %e, "Socket write failed");
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    cancel_token.cancel();
}
