//! Per-challenge WebSocket endpoint.
//!
//! A client presents its access token as a query parameter, proves it owns
//! the challenge (or is an admin), and then receives the challenge's push
//! events as `{"type", "data"}` frames until either side disconnects.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::api::AppState;
use crate::application::push::PushReceiver;
use crate::auth;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn trading_ws(
    ws: WebSocketUpgrade,
    Path(challenge_id): Path<i64>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let principal = match auth::verify_access_token(&state.settings.jwt_signing_key, &query.token)
    {
        Ok(p) => p,
        Err(_) => return (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
    };

    let challenge = match state.challenges.get(challenge_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return (StatusCode::NOT_FOUND, "challenge not found").into_response(),
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response(),
    };
    if challenge.user_id != principal.user_id && !principal.role.is_admin() {
        return (StatusCode::FORBIDDEN, "not your challenge").into_response();
    }

    let receiver = state.push.subscribe(challenge_id);
    ws.on_upgrade(move |socket| handle_socket(socket, receiver))
}

/// One task drives both directions; a disconnect on either side ends it and
/// drops the receiver, which unsubscribes from the hub.
async fn handle_socket(mut socket: WebSocket, receiver: PushReceiver) {
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            debug!("push event serialization failed: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // Hub disconnected us (sustained backpressure).
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    debug!(
        "websocket for challenge {} closed",
        receiver.challenge_id()
    );
}
