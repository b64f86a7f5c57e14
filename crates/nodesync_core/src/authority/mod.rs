//! Authoritative side: mutation acceptance, change log, consumers.
//!
//! One [`Hub`] serves one workspace. It owns the [`Authority`] that decides
//! pushed mutations, the [`ConsumerRegistry`] that streams the resulting
//! changes, and the jobs that poll consumers and compact the update log.

mod accept;
mod changes;
mod consumer;
mod jobs;
mod store;

pub use accept::Authority;
pub use changes::{ChangeNotice, ChangeNotifier};
pub use consumer::{ConsumerMachine, ConsumerRegistry, ConsumerState, ConsumerStats};
pub use jobs::{CONSUMERS_POLL, ConsumersPollJob, UPDATES_COMPACT, UpdatesCompactJob};
pub use store::AuthorityStore;

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::crdt::MergeEngine;
use crate::error::Result;
use crate::scheduler::Scheduler;

/// Authority, consumer registry and jobs for one workspace.
pub struct Hub {
    workspace_id: String,
    authority: Arc<Authority>,
    registry: Arc<ConsumerRegistry>,
    scheduler: Scheduler,
    config: EngineConfig,
    notifications: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(workspace_id: &str, store: AuthorityStore, engine: MergeEngine, config: EngineConfig) -> Self {
        let authority = Arc::new(Authority::new(Arc::new(store), engine, config.cas_retries));
        let registry = Arc::new(ConsumerRegistry::new(
            authority.clone(),
            config.consumer_batch_size,
        ));
        Self {
            workspace_id: workspace_id.to_string(),
            authority,
            registry,
            scheduler: Scheduler::new(),
            config,
            notifications: Mutex::new(None),
        }
    }

    /// Open (or create) the workspace database at `path`.
    pub fn open<P: AsRef<Path>>(workspace_id: &str, path: P, config: EngineConfig) -> Result<Self> {
        Ok(Self::new(
            workspace_id,
            AuthorityStore::open(path)?,
            MergeEngine::default(),
            config,
        ))
    }

    pub fn in_memory(workspace_id: &str, config: EngineConfig) -> Result<Self> {
        Ok(Self::new(
            workspace_id,
            AuthorityStore::in_memory()?,
            MergeEngine::default(),
            config,
        ))
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Start the notification loop and the recurring jobs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut notifications = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        if notifications.is_some() {
            return;
        }
        *notifications = Some(tokio::spawn(self.registry.clone().run_notifications()));
        self.scheduler.schedule(Arc::new(ConsumersPollJob::new(
            self.registry.clone(),
            self.config.consumers_poll,
        )));
        self.scheduler.schedule(Arc::new(UpdatesCompactJob::new(
            self.authority.clone(),
            self.config.update_log_keep,
            self.config.updates_compact,
        )));
        log::info!("workspace {} started", self.workspace_id);
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        if let Some(task) = self
            .notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
