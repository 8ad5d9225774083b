//! Realtime endpoint: authenticates the upgrade, tags the connection with its
//! identity, and dispatches chat/call frames until the peer goes away.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use shared::{
    domain::{CallId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientEvent, ServerEvent},
};

use crate::{
    auth,
    calls::LeaveOutcome,
    hub::{ConnectionId, Hub},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Token check happens before the upgrade is accepted; a bad credential never
/// gets a socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let Some(token) = q.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match auth::verify_token(&state.auth, &token) {
        Ok(user_id) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, user_id))
            .into_response(),
        Err(error) => {
            debug!(%error, "refusing websocket upgrade");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let conn_id = ConnectionId::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    state.hub.register(conn_id, tx);
    state.hub.join(&Hub::user_room(&user_id), conn_id);
    info!(conn = %conn_id, user = %user_id, "realtime connection established");

    // History snapshot goes through the same channel, so it is ordered before
    // any live event for this connection.
    match server_api::load_history(&state.api, &user_id).await {
        Ok(messages) => {
            state
                .hub
                .send_to_connection(conn_id, ServerEvent::LoadMessages { messages });
        }
        Err(error) => warn!(user = %user_id, code = ?error.code, "history load failed"),
    }

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => handle_event(&state, conn_id, &user_id, event).await,
            Err(error) => {
                state.hub.send_to_connection(
                    conn_id,
                    ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        format!("malformed frame: {error}"),
                    )),
                );
            }
        }
    }

    disconnect_cleanup(&state, conn_id, &user_id).await;
    send_task.abort();
    info!(conn = %conn_id, user = %user_id, "realtime connection closed");
}

pub(crate) async fn handle_event(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    user_id: &UserId,
    event: ClientEvent,
) {
    match event {
        ClientEvent::SendMessage {
            to_user_id,
            to_group_id,
            content,
            attachment,
            call_id,
        } => {
            match server_api::send_message(
                &state.api,
                user_id,
                to_user_id,
                to_group_id,
                content,
                attachment,
                call_id,
            )
            .await
            {
                Ok((message, delivery)) => {
                    fan_out(state, user_id, &delivery, ServerEvent::Message { message });
                }
                Err(error) => reject(state, conn_id, error),
            }
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => match server_api::edit_message(&state.api, user_id, &message_id, content).await {
            Ok((message, delivery)) => {
                fan_out(
                    state,
                    user_id,
                    &delivery,
                    ServerEvent::MessageEdited { message },
                );
            }
            Err(error) => reject(state, conn_id, error),
        },
        ClientEvent::DeleteMessage { message_id } => {
            match server_api::delete_message(&state.api, user_id, &message_id).await {
                Ok((message_id, delivery)) => {
                    fan_out(
                        state,
                        user_id,
                        &delivery,
                        ServerEvent::MessageDeleted { message_id },
                    );
                }
                Err(error) => reject(state, conn_id, error),
            }
        }
        ClientEvent::JoinCall { call_id } => {
            let room = Hub::call_room(&call_id);
            // Existing members learn about the joiner even on a re-join, so
            // they can restart negotiation.
            state.hub.send_to_room_except(
                &room,
                conn_id,
                &ServerEvent::CallJoined {
                    initiator_id: user_id.clone(),
                },
            );
            state.hub.join(&room, conn_id);
            state.calls.join(&call_id, user_id);
        }
        ClientEvent::Offer { call_id, payload } => {
            relay(state, &call_id, conn_id, ServerEvent::Offer { payload });
        }
        ClientEvent::Answer { call_id, payload } => {
            relay(state, &call_id, conn_id, ServerEvent::Answer { payload });
        }
        ClientEvent::IceCandidate { call_id, payload } => {
            relay(state, &call_id, conn_id, ServerEvent::IceCandidate { payload });
        }
        ClientEvent::AddParticipant { call_id, username } => {
            match server_api::resolve_username(&state.api, &username).await {
                Ok(Some(target)) => {
                    state.hub.send_to_user(
                        &target,
                        ServerEvent::IncomingCall {
                            call_id: call_id.clone(),
                            from_user_id: user_id.clone(),
                            call_link: call_link(&state.public_base_url, &call_id),
                        },
                    );
                    state
                        .hub
                        .send_to_connection(conn_id, ServerEvent::ParticipantAdded { username });
                }
                Ok(None) => {
                    state
                        .hub
                        .send_to_connection(conn_id, ServerEvent::ParticipantNotFound { username });
                }
                Err(error) => reject(state, conn_id, error),
            }
        }
        ClientEvent::EndCall { call_id } => {
            let room = Hub::call_room(&call_id);
            state
                .hub
                .send_to_room_except(&room, conn_id, &ServerEvent::CallEnded {});
            state.hub.leave(&room, conn_id);
            if state.calls.leave(&call_id, user_id) == LeaveOutcome::Emptied {
                finish_call(state, &call_id).await;
            }
        }
    }
}

pub(crate) async fn disconnect_cleanup(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    user_id: &UserId,
) {
    state.hub.unregister(conn_id);
    for call_id in state.calls.leave_all(user_id) {
        finish_call(state, &call_id).await;
    }
}

/// The room just emptied: rewrite its invite message and re-deliver the edit
/// to everyone the original message reached.
async fn finish_call(state: &Arc<AppState>, call_id: &CallId) {
    match server_api::end_call(&state.api, call_id).await {
        Ok(Some((message, delivery))) => {
            let author = message.from_user_id.clone();
            fan_out(
                state,
                &author,
                &delivery,
                ServerEvent::MessageEdited { message },
            );
        }
        Ok(None) => debug!(call = %call_id, "call ended with no invite message"),
        Err(error) => warn!(call = %call_id, code = ?error.code, "call-end update failed"),
    }
}

/// Delivers one event to every identity in the destination set, author
/// included, exactly once each. Absent identities are a no-op.
fn fan_out(
    state: &Arc<AppState>,
    author: &UserId,
    delivery: &server_api::Delivery,
    event: ServerEvent,
) {
    for recipient in delivery.recipients(author) {
        state.hub.send_to_user(&recipient, event.clone());
    }
}

/// Forwards an opaque negotiation payload to everyone else in the call room.
fn relay(state: &Arc<AppState>, call_id: &CallId, sender: ConnectionId, event: ServerEvent) {
    state
        .hub
        .send_to_room_except(&Hub::call_room(call_id), sender, &event);
}

fn reject(state: &Arc<AppState>, conn_id: ConnectionId, error: ApiError) {
    state.hub.send_to_connection(conn_id, ServerEvent::Error(error));
}

fn call_link(base_url: &str, call_id: &CallId) -> String {
    format!("{base_url}/call.html?callId={call_id}&type=video")
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
