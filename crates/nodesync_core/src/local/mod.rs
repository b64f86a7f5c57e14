//! Local replica: entity store, outbox, revert handlers and sync jobs.
//!
//! [`SyncClient`] wires them to a [`SyncTransport`]: local writes go to the
//! outbox and trigger `mutations.sync`; incoming change batches are applied
//! and then acknowledged.

mod jobs;
mod outbox;
mod replica;
mod revert;
mod store;

pub use jobs::{
    CONSUMERS_SYNC, ConsumersSyncJob, MUTATIONS_SYNC, MutationsSyncJob, TOMBSTONES_CLEANUP,
    TombstonesCleanupJob, backoff,
};
pub use outbox::{ConsolidationPlan, FlushReport, Outbox, plan_consolidation};
pub use replica::Replica;
pub use revert::{Compensation, Reverter};
pub use store::{LocalStore, PendingKind, PendingUpdate, TombstoneRecord};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::crdt::MergeEngine;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::model::ConsumerKey;
use crate::scheduler::Scheduler;
use crate::transport::SyncTransport;

/// A local replica connected to an authority.
pub struct SyncClient {
    replica: Arc<Replica>,
    outbox: Arc<Outbox>,
    transport: Arc<dyn SyncTransport>,
    scheduler: Arc<Scheduler>,
    config: EngineConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        engine: MergeEngine,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::default();
        let reverter = Arc::new(Reverter::new(engine.clone()));
        let replica = Arc::new(Replica::new(
            store.clone(),
            engine,
            events.clone(),
            config.local_update_retries,
        ));
        let outbox = Arc::new(Outbox::new(
            store,
            transport.clone(),
            reverter,
            events,
            config.mutation_batch_size,
            config.mutation_retry_ceiling,
        ));
        Self {
            replica,
            outbox,
            transport,
            scheduler: Arc::new(Scheduler::new()),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open (or create) a replica database at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        transport: Arc<dyn SyncTransport>,
        config: EngineConfig,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::open(path)?);
        Ok(Self::new(store, transport, MergeEngine::default(), config))
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn events(&self) -> &EventBus {
        self.replica.events()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Register the sync jobs and start the event and batch loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let config = &self.config;
        self.scheduler.schedule(Arc::new(MutationsSyncJob::new(
            self.outbox.clone(),
            config.mutations_sync,
            Duration::from_millis(config.max_backoff_ms),
        )));
        self.scheduler.schedule(Arc::new(ConsumersSyncJob::new(
            self.replica.clone(),
            self.transport.clone(),
            config.consumers_sync,
        )));
        self.scheduler.schedule(Arc::new(TombstonesCleanupJob::new(
            self.replica.store().clone(),
            config.tombstone_retention_ms,
            config.tombstones_cleanup,
        )));

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(tokio::spawn(trigger_on_events(
            self.events().clone(),
            self.scheduler.clone(),
        )));
        if let Some(mut batches) = self.transport.take_batches() {
            let replica = self.replica.clone();
            let transport = self.transport.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(batch) = batches.recv().await {
                    if let Err(e) = apply_and_ack(&replica, transport.as_ref(), &batch).await {
                        log::warn!("change batch for {} not applied: {}", batch.consumer_key, e);
                    }
                }
                log::debug!("change batch stream closed");
            }));
        }
        log::info!("sync client started");
    }

    /// Flush the outbox now, bypassing the scheduler.
    pub async fn sync_now(&self) -> Result<FlushReport> {
        self.outbox.flush().await
    }

    /// Initialize every consumer now, bypassing the scheduler.
    pub async fn init_consumers(&self) -> Result<usize> {
        ConsumersSyncJob::new(
            self.replica.clone(),
            self.transport.clone(),
            self.config.consumers_sync,
        )
        .init_all()
        .await
    }

    /// Track a root shared by someone else and start its consumers soon.
    pub fn follow_root(&self, root_id: &str) -> Result<()> {
        self.replica.follow_root(root_id)?;
        self.scheduler.trigger(CONSUMERS_SYNC);
        Ok(())
    }

    /// Stop jobs and background loops.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

async fn apply_and_ack(
    replica: &Replica,
    transport: &dyn SyncTransport,
    batch: &crate::model::ChangeBatch,
) -> Result<()> {
    replica.apply_batch(batch)?;
    let key: ConsumerKey = batch
        .consumer_key
        .parse()
        .map_err(crate::error::SyncError::InvalidInput)?;
    transport.ack(key, batch.cursor).await
}

async fn trigger_on_events(events: EventBus, scheduler: Arc<Scheduler>) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(EngineEvent::MutationQueued { .. }) => {
                scheduler.trigger(MUTATIONS_SYNC);
            }
            Ok(EngineEvent::NodeCreated {
                node_id, root_id, ..
            }) if node_id == root_id => {
                scheduler.trigger(CONSUMERS_SYNC);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::debug!("event listener lagged by {}", skipped);
                scheduler.trigger(MUTATIONS_SYNC);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
