//! In-process transport talking directly to a [`Hub`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::SyncTransport;
use crate::authority::Hub;
use crate::error::{Result, SyncError};
use crate::model::{ChangeBatch, ConsumerKey, Mutation, MutationResult};
use crate::scheduler::BoxFuture;

/// Connects a replica to an in-process authority. Can be switched offline
/// to simulate an unreachable server.
pub struct LoopbackTransport {
    hub: Arc<Hub>,
    actor_id: String,
    device_id: String,
    sender: mpsc::UnboundedSender<ChangeBatch>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChangeBatch>>>,
    connection_id: Mutex<Option<String>>,
    online: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(hub: Arc<Hub>, actor_id: &str, device_id: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = hub.registry().connect(actor_id, device_id, sender.clone());
        Self {
            hub,
            actor_id: actor_id.to_string(),
            device_id: device_id.to_string(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            connection_id: Mutex::new(Some(connection_id)),
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Going offline drops the connection and its consumers; coming back
    /// opens a fresh connection.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let mut connection_id = self.connection_id.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = connection_id.take() {
            self.hub.registry().disconnect(&id);
        }
        if online {
            *connection_id = Some(self.hub.registry().connect(
                &self.actor_id,
                &self.device_id,
                self.sender.clone(),
            ));
        }
        log::debug!("loopback {} is {}", self.device_id, if online { "online" } else { "offline" });
    }

    fn connection(&self) -> Result<String> {
        if !self.is_online() {
            return Err(SyncError::Transport("offline".into()));
        }
        self.connection_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SyncError::Transport("not connected".into()))
    }
}

impl SyncTransport for LoopbackTransport {
    fn push_mutations(&self, mutations: Vec<Mutation>) -> BoxFuture<'_, Result<Vec<MutationResult>>> {
        Box::pin(async move {
            self.connection()?;
            Ok(self.hub.authority().push_mutations(&self.actor_id, mutations))
        })
    }

    fn init_consumer(&self, key: ConsumerKey, cursor: Option<i64>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let connection_id = self.connection()?;
            self.hub.registry().init_consumer(&connection_id, key, cursor)
        })
    }

    fn ack(&self, key: ConsumerKey, cursor: i64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let connection_id = self.connection()?;
            self.hub.registry().ack(&connection_id, &key, cursor)
        })
    }

    fn take_batches(&self) -> Option<mpsc::UnboundedReceiver<ChangeBatch>> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
