use crate::state::SyncState;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use nodesync_core::authority::Hub;
use nodesync_core::model::ConsumerKey;
use nodesync_core::protocol::{ClientMessage, ServerMessage};
use nodesync_core::SyncError;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub workspace: String,
    pub actor: String,
    pub device: String,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub sync_state: Arc<SyncState>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if query.actor.is_empty() || query.device.is_empty() {
        warn!("WebSocket connection rejected: missing actor or device");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let hub = match state.sync_state.hub(&query.workspace).await {
        Ok(hub) => hub,
        Err(e @ SyncError::InvalidInput(_)) => {
            warn!("WebSocket connection rejected: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
        Err(e) => {
            error!("Failed to open workspace {}: {}", query.workspace, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(
        "WebSocket upgrade: actor={}, device={}, workspace={}",
        query.actor, query.device, query.workspace
    );

    ws.on_upgrade(move |socket| handle_socket(socket, hub, query.actor, query.device))
        .into_response()
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, actor_id: String, device_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let connection_id = hub.registry().connect(&actor_id, &device_id, batch_tx);

    info!(
        "WebSocket connected: actor={}, workspace={}, connections={}",
        actor_id,
        hub.workspace_id(),
        hub.registry().stats().connections
    );

    loop {
        let outgoing = tokio::select! {
            Some(msg) = ws_rx.next() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => handle_message(&hub, &connection_id, &actor_id, message),
                            Err(e) => {
                                warn!("Unreadable client message: {}", e);
                                Some(ServerMessage::Error {
                                    request_id: None,
                                    error: SyncError::InvalidInput(e.to_string()).to_serializable(),
                                })
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                        None
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => None,
                }
            }

            Some(batch) = batch_rx.recv() => Some(ServerMessage::ChangeBatch { batch }),

            else => break,
        };

        if let Some(message) = outgoing {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    }

    hub.registry().disconnect(&connection_id);
    info!(
        "WebSocket disconnected: actor={}, workspace={}",
        actor_id,
        hub.workspace_id()
    );
}

/// Apply one client message; returns the direct reply, if any. Change
/// batches triggered by consumer messages arrive on the batch channel.
fn handle_message(
    hub: &Hub,
    connection_id: &str,
    actor_id: &str,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::PushMutations {
            request_id,
            mutations,
        } => {
            debug!("push {} ({} mutations) from {}", request_id, mutations.len(), actor_id);
            let results = hub.authority().push_mutations(actor_id, mutations);
            Some(ServerMessage::PushResult {
                request_id,
                results,
            })
        }
        ClientMessage::ConsumerInit {
            consumer_key,
            cursor,
        } => consumer_reply(&consumer_key, |key| {
            hub.registry().init_consumer(connection_id, key, cursor)
        }),
        ClientMessage::ConsumerAck {
            consumer_key,
            cursor,
        } => consumer_reply(&consumer_key, |key| {
            hub.registry().ack(connection_id, &key, cursor)
        }),
    }
}

fn consumer_reply(
    consumer_key: &str,
    f: impl FnOnce(ConsumerKey) -> nodesync_core::Result<()>,
) -> Option<ServerMessage> {
    let result = consumer_key
        .parse::<ConsumerKey>()
        .map_err(SyncError::InvalidInput)
        .and_then(f);
    match result {
        Ok(()) => None,
        Err(e) => {
            debug!("consumer {} refused: {}", consumer_key, e);
            Some(ServerMessage::ConsumerError {
                consumer_key: consumer_key.to_string(),
                message: e.to_string(),
            })
        }
    }
}
