//! WebSocket transport for native replicas (tokio-tungstenite).
//!
//! One socket carries pushes (matched to their responses by request id)
//! and the consumer protocol. Change batches are forwarded to the channel
//! returned by [`SyncTransport::take_batches`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::SyncTransport;
use crate::encoding::generate_id;
use crate::error::{Result, SyncError};
use crate::model::{ChangeBatch, ConsumerKey, Mutation, MutationResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::scheduler::BoxFuture;

const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

type PendingPushes = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Vec<MutationResult>>>>>>;

pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingPushes,
    batches: Mutex<Option<mpsc::UnboundedReceiver<ChangeBatch>>>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connect to `server_url` (e.g. `ws://localhost:3030/sync`).
    pub async fn connect(
        server_url: &str,
        workspace_id: &str,
        actor_id: &str,
        device_id: &str,
    ) -> Result<Self> {
        let mut url = Url::parse(server_url)
            .map_err(|e| SyncError::InvalidInput(format!("bad server url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("workspace", workspace_id)
            .append_pair("actor", actor_id)
            .append_pair("device", device_id);

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Transport(format!("WebSocket connection failed: {}", e)))?;
        log::info!("connected to {}", server_url);

        let (mut write, mut read) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let pending: PendingPushes = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    log::error!("send error: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => dispatch(message, &reader_pending, &batch_tx),
                        Err(e) => log::warn!("unreadable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("connection closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("read error: {}", e);
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // dropping the senders fails every waiting push
            reader_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        });

        Ok(Self {
            outgoing,
            pending,
            batches: Mutex::new(Some(batch_rx)),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::Transport("not connected".into()));
        }
        let text = serde_json::to_string(message)?;
        self.outgoing
            .send(text)
            .map_err(|_| SyncError::Transport("connection closed".into()))
    }
}

fn dispatch(
    message: ServerMessage,
    pending: &PendingPushes,
    batches: &mpsc::UnboundedSender<ChangeBatch>,
) {
    match message {
        ServerMessage::PushResult {
            request_id,
            results,
        } => {
            if let Some(tx) = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&request_id) {
                let _ = tx.send(Ok(results));
            }
        }
        ServerMessage::ChangeBatch { batch } => {
            let _ = batches.send(batch);
        }
        ServerMessage::ConsumerError {
            consumer_key,
            message,
        } => {
            log::warn!("consumer {} refused: {}", consumer_key, message);
        }
        ServerMessage::Error { request_id, error } => {
            let waiting = request_id
                .and_then(|id| pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id));
            match waiting {
                Some(tx) => {
                    let _ = tx.send(Err(SyncError::Transport(error.message)));
                }
                None => log::warn!("server error ({}): {}", error.kind, error.message),
            }
        }
    }
}

impl SyncTransport for WsTransport {
    fn push_mutations(&self, mutations: Vec<Mutation>) -> BoxFuture<'_, Result<Vec<MutationResult>>> {
        Box::pin(async move {
            let request_id = generate_id();
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(request_id.clone(), tx);

            let sent = self.send(&ClientMessage::PushMutations {
                request_id: request_id.clone(),
                mutations,
            });
            if let Err(e) = sent {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                return Err(e);
            }

            match tokio::time::timeout(PUSH_TIMEOUT, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SyncError::Transport("connection lost".into())),
                Err(_) => {
                    self.pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&request_id);
                    Err(SyncError::Transport("push timed out".into()))
                }
            }
        })
    }

    fn init_consumer(&self, key: ConsumerKey, cursor: Option<i64>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.send(&ClientMessage::ConsumerInit {
                consumer_key: key.to_string(),
                cursor,
            })
        })
    }

    fn ack(&self, key: ConsumerKey, cursor: i64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.send(&ClientMessage::ConsumerAck {
                consumer_key: key.to_string(),
                cursor,
            })
        })
    }

    fn take_batches(&self) -> Option<mpsc::UnboundedReceiver<ChangeBatch>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
