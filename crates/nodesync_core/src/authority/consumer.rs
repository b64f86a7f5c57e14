//! Consumer protocol.
//!
//! A consumer streams one `(type, root)` change stream to one connection.
//! It fetches at most one batch at a time and waits for the client to
//! acknowledge it before fetching the next. Pings that arrive meanwhile
//! collapse into a single follow-up fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use super::accept::Authority;
use super::store::{get_cursor, set_cursor};
use crate::encoding::generate_id;
use crate::error::{Result, SyncError};
use crate::model::{ChangeBatch, ConsumerKey};

/// Delivery state of one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Fetching,
    /// A batch was delivered and is waiting for its ack.
    Syncing,
}

/// Pure state machine behind a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerMachine {
    state: ConsumerState,
    pending_ping: bool,
}

impl ConsumerMachine {
    pub fn new() -> Self {
        Self {
            state: ConsumerState::Idle,
            pending_ping: false,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn has_pending_ping(&self) -> bool {
        self.pending_ping
    }

    /// New changes may exist. Returns true if a fetch should start now.
    pub fn ping(&mut self) -> bool {
        match self.state {
            ConsumerState::Idle => {
                self.state = ConsumerState::Fetching;
                true
            }
            ConsumerState::Fetching | ConsumerState::Syncing => {
                self.pending_ping = true;
                false
            }
        }
    }

    /// A fetch finished. Returns true if another fetch should start now.
    pub fn fetched(&mut self, delivered: bool) -> bool {
        if self.state != ConsumerState::Fetching {
            return false;
        }
        if delivered {
            self.state = ConsumerState::Syncing;
            return false;
        }
        self.state = ConsumerState::Idle;
        self.take_ping()
    }

    /// The client acknowledged the delivered batch. Returns true if a fetch
    /// should start now.
    pub fn acked(&mut self) -> bool {
        if self.state != ConsumerState::Syncing {
            return false;
        }
        // the next page may already be waiting; this fetch also covers a
        // remembered ping
        self.pending_ping = false;
        self.state = ConsumerState::Fetching;
        true
    }

    /// A fetch failed. Goes idle but remembers that changes may be waiting,
    /// so the next ping or poll retries.
    pub fn failed(&mut self) {
        if self.state == ConsumerState::Fetching {
            self.state = ConsumerState::Idle;
            self.pending_ping = true;
        }
    }

    /// The client restarted the stream at a cursor of its choosing. Any
    /// unacknowledged delivery is abandoned. Returns true if a fetch should
    /// start now.
    pub fn restart(&mut self) -> bool {
        match self.state {
            ConsumerState::Fetching => {
                self.pending_ping = true;
                false
            }
            ConsumerState::Idle | ConsumerState::Syncing => {
                self.pending_ping = false;
                self.state = ConsumerState::Fetching;
                true
            }
        }
    }

    fn take_ping(&mut self) -> bool {
        if std::mem::take(&mut self.pending_ping) {
            self.state = ConsumerState::Fetching;
            true
        } else {
            false
        }
    }
}

impl Default for ConsumerMachine {
    fn default() -> Self {
        Self::new()
    }
}

struct Consumer {
    machine: ConsumerMachine,
    /// Last acknowledged change id.
    cursor: i64,
}

struct ConnectionEntry {
    actor_id: String,
    device_id: String,
    sender: mpsc::UnboundedSender<ChangeBatch>,
    consumers: HashMap<ConsumerKey, Consumer>,
}

/// Counts reported by [`ConsumerRegistry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub connections: usize,
    pub consumers: usize,
}

/// Live connections and their consumers for one workspace.
///
/// Consumers are created on `init_consumer` and dropped with their
/// connection. Fetches read the store outside the registry lock.
pub struct ConsumerRegistry {
    authority: Arc<Authority>,
    batch_size: usize,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
}

impl ConsumerRegistry {
    pub fn new(authority: Arc<Authority>, batch_size: usize) -> Self {
        Self {
            authority,
            batch_size: batch_size.max(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, ConnectionEntry>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection. Batches for its consumers go to `sender`.
    pub fn connect(
        &self,
        actor_id: &str,
        device_id: &str,
        sender: mpsc::UnboundedSender<ChangeBatch>,
    ) -> String {
        let connection_id = generate_id();
        self.connections().insert(
            connection_id.clone(),
            ConnectionEntry {
                actor_id: actor_id.to_string(),
                device_id: device_id.to_string(),
                sender,
                consumers: HashMap::new(),
            },
        );
        log::debug!("connection {} opened for {}/{}", connection_id, actor_id, device_id);
        connection_id
    }

    /// Drop a connection and its consumers. In-flight fetches are discarded.
    pub fn disconnect(&self, connection_id: &str) {
        if let Some(entry) = self.connections().remove(connection_id) {
            log::debug!(
                "connection {} closed ({} consumers)",
                connection_id,
                entry.consumers.len()
            );
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        let connections = self.connections();
        ConsumerStats {
            connections: connections.len(),
            consumers: connections.values().map(|c| c.consumers.len()).sum(),
        }
    }

    pub fn consumer_state(&self, connection_id: &str, key: &ConsumerKey) -> Option<ConsumerState> {
        self.connections()
            .get(connection_id)?
            .consumers
            .get(key)
            .map(|c| c.machine.state())
    }

    fn cursor_key(device_id: &str, key: &ConsumerKey) -> String {
        format!("{}/{}", device_id, key)
    }

    /// Create (or restart) the consumer for `key` on a connection.
    ///
    /// A new consumer starts at `cursor`, or at the cursor this device last
    /// acknowledged when `cursor` is `None`. An existing consumer given a
    /// cursor drops any unacknowledged batch and resumes from there; without
    /// one it is just pinged.
    pub fn init_consumer(&self, connection_id: &str, key: ConsumerKey, cursor: Option<i64>) -> Result<()> {
        let (actor_id, device_id) = {
            let connections = self.connections();
            let entry = connections
                .get(connection_id)
                .ok_or_else(|| SyncError::NotFound(format!("connection {}", connection_id)))?;
            (entry.actor_id.clone(), entry.device_id.clone())
        };
        self.authority.check_subscription(&actor_id, &key.root_id)?;
        let start = match cursor {
            Some(cursor) => cursor,
            None => self
                .authority
                .store()
                .with_conn(|c| get_cursor(c, &Self::cursor_key(&device_id, &key)))?
                .unwrap_or(0),
        };

        let fetch = {
            let mut connections = self.connections();
            let Some(entry) = connections.get_mut(connection_id) else {
                return Ok(());
            };
            match entry.consumers.get_mut(&key) {
                Some(consumer) => match cursor {
                    Some(cursor) => {
                        log::debug!("consumer {} restarted at {}", key, cursor);
                        consumer.cursor = cursor;
                        consumer.machine.restart()
                    }
                    None => consumer.machine.ping(),
                },
                None => {
                    log::debug!("consumer {} started at {}", key, start);
                    let mut consumer = Consumer {
                        machine: ConsumerMachine::new(),
                        cursor: start,
                    };
                    let fetch = consumer.machine.ping();
                    entry.consumers.insert(key.clone(), consumer);
                    fetch
                }
            }
        };
        if fetch {
            self.fetch(connection_id, &key);
        }
        Ok(())
    }

    /// The client applied everything up to `cursor`.
    pub fn ack(&self, connection_id: &str, key: &ConsumerKey, cursor: i64) -> Result<()> {
        let (device_id, fetch) = {
            let mut connections = self.connections();
            let entry = connections
                .get_mut(connection_id)
                .ok_or_else(|| SyncError::NotFound(format!("connection {}", connection_id)))?;
            let consumer = entry
                .consumers
                .get_mut(key)
                .ok_or_else(|| SyncError::NotFound(format!("consumer {}", key)))?;
            consumer.cursor = consumer.cursor.max(cursor);
            (entry.device_id.clone(), consumer.machine.acked())
        };
        self.authority
            .store()
            .with_tx(|tx| set_cursor(tx, &Self::cursor_key(&device_id, key), cursor))?;
        if fetch {
            self.fetch(connection_id, key);
        }
        Ok(())
    }

    /// Ping every consumer of `root_id`.
    pub fn notify(&self, root_id: &str) {
        self.ping_where(|key| key.root_id == root_id);
    }

    /// Ping every consumer.
    pub fn ping_all(&self) {
        self.ping_where(|_| true);
    }

    fn ping_where(&self, matches: impl Fn(&ConsumerKey) -> bool) {
        let to_fetch: Vec<(String, ConsumerKey)> = {
            let mut connections = self.connections();
            let mut to_fetch = Vec::new();
            for (connection_id, entry) in connections.iter_mut() {
                for (key, consumer) in entry.consumers.iter_mut() {
                    if matches(key) && consumer.machine.ping() {
                        to_fetch.push((connection_id.clone(), key.clone()));
                    }
                }
            }
            to_fetch
        };
        for (connection_id, key) in to_fetch {
            self.fetch(&connection_id, &key);
        }
    }

    /// Run fetches for a consumer in `Fetching` until it delivers a batch
    /// or goes idle.
    fn fetch(&self, connection_id: &str, key: &ConsumerKey) {
        loop {
            let Some(cursor) = self
                .connections()
                .get(connection_id)
                .and_then(|e| e.consumers.get(key))
                .map(|c| c.cursor)
            else {
                return;
            };

            let fetched = self.authority.changes_since(key, cursor, self.batch_size);

            let mut connections = self.connections();
            let Some(entry) = connections.get_mut(connection_id) else {
                return;
            };
            let Some(consumer) = entry.consumers.get_mut(key) else {
                return;
            };
            let changes = match fetched {
                Ok(changes) => changes,
                Err(e) => {
                    log::error!("consumer {} fetch from {} failed: {}", key, cursor, e);
                    consumer.machine.failed();
                    return;
                }
            };
            if consumer.cursor != cursor {
                // the cursor moved while fetching; fetch again from it
                consumer.machine.restart();
                if consumer.machine.fetched(false) {
                    continue;
                }
                return;
            }
            if changes.is_empty() {
                if consumer.machine.fetched(false) {
                    continue;
                }
                return;
            }
            let batch = ChangeBatch {
                consumer_key: key.to_string(),
                cursor: changes.last().map_or(cursor, |c| c.id),
                changes,
            };
            consumer.machine.fetched(true);
            log::trace!("consumer {} delivering {} changes", key, batch.changes.len());
            if entry.sender.send(batch).is_err() {
                log::debug!("connection {} is gone", connection_id);
                drop(connections);
                self.disconnect(connection_id);
            }
            return;
        }
    }

    /// Ping consumers whenever the authority commits changes. Returns when
    /// the notifier closes.
    pub async fn run_notifications(self: Arc<Self>) {
        let mut rx = self.authority.notifier().subscribe();
        loop {
            match rx.recv().await {
                Ok(notice) => self.notify(&notice.root_id),
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("change notifications lagged by {}", skipped);
                    self.ping_all();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pings_collapse_while_busy() {
        let mut machine = ConsumerMachine::new();
        assert!(machine.ping());
        assert_eq!(machine.state(), ConsumerState::Fetching);
        assert!(!machine.ping());
        assert!(!machine.ping());
        assert!(machine.has_pending_ping());

        // empty fetch with a remembered ping fetches exactly once more
        assert!(machine.fetched(false));
        assert!(!machine.has_pending_ping());
        assert!(!machine.fetched(false));
        assert_eq!(machine.state(), ConsumerState::Idle);
    }

    #[test]
    fn test_delivery_waits_for_ack() {
        let mut machine = ConsumerMachine::new();
        assert!(machine.ping());
        assert!(!machine.fetched(true));
        assert_eq!(machine.state(), ConsumerState::Syncing);
        assert!(!machine.ping());
        assert!(machine.acked());
        assert_eq!(machine.state(), ConsumerState::Fetching);
        assert!(!machine.fetched(false));
        assert_eq!(machine.state(), ConsumerState::Idle);
    }

    #[test]
    fn test_stray_ack_is_ignored() {
        let mut machine = ConsumerMachine::new();
        assert!(!machine.acked());
        assert_eq!(machine.state(), ConsumerState::Idle);
    }

    #[test]
    fn test_failed_fetch_keeps_ping() {
        let mut machine = ConsumerMachine::new();
        assert!(machine.ping());
        machine.failed();
        assert_eq!(machine.state(), ConsumerState::Idle);
        assert!(machine.has_pending_ping());
        // the next poll retries
        assert!(machine.ping());
        assert_eq!(machine.state(), ConsumerState::Fetching);
    }

    #[test]
    fn test_restart_abandons_unacked_batch() {
        let mut machine = ConsumerMachine::new();
        assert!(machine.ping());
        assert!(!machine.fetched(true));
        assert!(!machine.ping());
        assert!(machine.restart());
        assert_eq!(machine.state(), ConsumerState::Fetching);
        assert!(!machine.has_pending_ping());

        // mid-fetch the restart waits for the fetch to finish
        assert!(!machine.restart());
        assert!(machine.fetched(false));
        assert_eq!(machine.state(), ConsumerState::Fetching);
    }
}
