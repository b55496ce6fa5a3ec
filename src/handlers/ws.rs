//! Real-time notification socket.
//!
//! The handshake must carry a bearer token (query `token` or Authorization
//! header); unauthenticated upgrades are refused outright. The session is
//! registered for pushes only after a `subscribe` frame whose echoed token
//! verifies to the same principal, and a `replay` frame pushes every pending
//! notification in creation order.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::errors::ServiceError;
use crate::handlers::notifications::NotificationAppState;
use crate::services::notifications::{ServerFrame, SessionHandle};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { token: String },
    Replay,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub fn routes(state: NotificationAppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    State(state): State<NotificationAppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    let principal = match token.as_deref().map(|t| state.verifier.verify(t)) {
        Some(Ok(user)) => user,
        _ => {
            return ServiceError::Unauthorized("websocket handshake requires a bearer token".into())
                .into_response()
        }
    };

    ws.on_upgrade(move |socket| run_session(socket, state, principal))
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(_) => true,
    }
}

async fn run_session(
    socket: WebSocket,
    state: NotificationAppState,
    principal: AuthenticatedUser,
) {
    let session_id = Uuid::new_v4();
    let user_id = principal.user_id;
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut subscribed = false;

    debug!(user_id = %user_id, session_id = %session_id, "websocket session opened");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                if !send_frame(&mut sink, &frame).await {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_frame(
                            &text,
                            &state,
                            &principal,
                            session_id,
                            &tx,
                            &mut sink,
                            &mut subscribed,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if subscribed {
        state.notifications.registry().unregister(user_id, session_id);
    }
    info!(user_id = %user_id, session_id = %session_id, "websocket session closed");
}

/// Returns false when the session must close.
async fn handle_client_frame(
    text: &str,
    state: &NotificationAppState,
    principal: &AuthenticatedUser,
    session_id: Uuid,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    sink: &mut SplitSink<WebSocket, Message>,
    subscribed: &mut bool,
) -> bool {
    let user_id = principal.user_id;
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe { token }) => match state.verifier.verify(&token) {
            Ok(echoed) if echoed.user_id == user_id => {
                if !*subscribed {
                    state
                        .notifications
                        .registry()
                        .register(user_id, SessionHandle::new(session_id, tx.clone()));
                    *subscribed = true;
                }
                let _ = tx.send(ServerFrame::Subscribed { user_id });
                true
            }
            _ => {
                warn!(user_id = %user_id, "subscribe frame token rejected");
                let frame = ServerFrame::Error {
                    code: "UNAUTHORIZED".into(),
                    message: "subscription token rejected".into(),
                };
                let _ = send_frame(sink, &frame).await;
                false
            }
        },
        Ok(ClientFrame::Replay) => {
            if !*subscribed {
                let _ = tx.send(ServerFrame::Error {
                    code: "NOT_SUBSCRIBED".into(),
                    message: "subscribe before requesting a replay".into(),
                });
                return true;
            }
            if let Err(e) = state.notifications.replay_pending(user_id).await {
                warn!(user_id = %user_id, error = %e, "replay failed");
            }
            true
        }
        Err(_) => {
            let _ = tx.send(ServerFrame::Error {
                code: "BAD_FRAME".into(),
                message: "unrecognized frame".into(),
            });
            true
        }
    }
}
