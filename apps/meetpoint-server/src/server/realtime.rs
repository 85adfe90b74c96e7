use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use meetpoint_core::UserId;
use meetpoint_protocol::parse_envelope;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    auth::{authenticate_with_token, bearer_token},
    core::{AppState, AuthContext, ConnectionControl, NOTIFICATION_REPLAY_LIMIT},
    errors::ApiFailure,
    gateway_events::{self, GatewayEvent},
    handlers::notifications::list_notifications_for_user,
    types::GatewayQuery,
};

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let token = query
        .token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ApiFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(state: AppState, socket: WebSocket, auth: AuthContext) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let forced_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    state
        .connection_senders
        .write()
        .await
        .insert(connection_id, outbound_tx.clone());
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);

    // Last connection wins. A previous socket for the same user is told to
    // close before this one takes over the registry slot.
    let replaced = state
        .user_connections
        .write()
        .await
        .insert(auth.user_id.to_string(), connection_id);
    if let Some(previous_id) = replaced {
        let controls = state.connection_controls.read().await;
        if let Some(control) = controls.get(&previous_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }

    let connected_event = gateway_events::connected(auth.user_id);
    let _ = outbound_tx.send(connected_event.payload).await;

    match list_notifications_for_user(&state, auth.user_id, NOTIFICATION_REPLAY_LIMIT).await {
        Ok(replay) => {
            let replay_event = gateway_events::notifications(&replay);
            let _ = outbound_tx.send(replay_event.payload).await;
        }
        Err(_) => {
            tracing::warn!(
                event = "gateway.replay_failed",
                user_id = %auth.user_id,
                connection_id = %connection_id
            );
        }
    }

    let forced_disconnect_send = Arc::clone(&forced_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        forced_disconnect_send.store(true, Ordering::Relaxed);
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "superseded".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Push-only gateway: client text frames must still be well-formed
    // envelopes, but their content is otherwise ignored. A frame that fails
    // the size cap or the protocol boundary terminates the connection.
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "frame_too_large";
                    break;
                }
                if parse_envelope(text.as_bytes()).is_err() {
                    disconnect_reason = "invalid_frame";
                    break;
                }
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "frame_too_large";
                    break;
                }
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if !forced_disconnect.load(Ordering::Relaxed) {
        tracing::debug!(
            event = "gateway.disconnect",
            reason = disconnect_reason,
            user_id = %auth.user_id,
            connection_id = %connection_id
        );
    }
    remove_connection(&state, auth.user_id, connection_id).await;
    send_task.abort();
}

async fn remove_connection(state: &AppState, user_id: UserId, connection_id: Uuid) {
    state.connection_senders.write().await.remove(&connection_id);
    state
        .connection_controls
        .write()
        .await
        .remove(&connection_id);

    let mut user_connections = state.user_connections.write().await;
    if user_connections.get(&user_id.to_string()) == Some(&connection_id) {
        user_connections.remove(&user_id.to_string());
    }
}

/// Fire and forget. A full outbound queue marks the consumer slow and the
/// connection is told to close; the client catches up over REST.
pub(crate) async fn push_user_event(state: &AppState, user_id: UserId, event: &GatewayEvent) {
    let connection_id = {
        let user_connections = state.user_connections.read().await;
        user_connections.get(&user_id.to_string()).copied()
    };
    let Some(connection_id) = connection_id else {
        return;
    };

    let sender = {
        let senders = state.connection_senders.read().await;
        senders.get(&connection_id).cloned()
    };
    let Some(sender) = sender else {
        return;
    };

    if sender.try_send(event.payload.clone()).is_err() {
        tracing::warn!(
            event = "gateway.slow_consumer",
            event_type = event.event_type,
            user_id = %user_id,
            connection_id = %connection_id
        );
        let controls = state.connection_controls.read().await;
        if let Some(control) = controls.get(&connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}
