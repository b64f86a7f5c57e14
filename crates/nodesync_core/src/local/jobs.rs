//! Recurring replica jobs run by the [`Scheduler`](crate::scheduler::Scheduler).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::outbox::Outbox;
use super::replica::Replica;
use super::store::{LocalStore, purge_tombstones};
use crate::config::JobTiming;
use crate::encoding::now_millis;
use crate::error::{Result, SyncError};
use crate::model::{ConsumerKey, ConsumerType};
use crate::scheduler::{BoxFuture, Job};
use crate::transport::SyncTransport;

pub const MUTATIONS_SYNC: &str = "mutations.sync";
pub const CONSUMERS_SYNC: &str = "consumers.sync";
pub const TOMBSTONES_CLEANUP: &str = "tombstones.cleanup";

const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// `base * 2^failures`, capped at `max`.
pub fn backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    base.checked_mul(2u32.saturating_pow(failures.min(16)))
        .unwrap_or(max)
        .min(max)
}

/// Flushes the outbox. Transport failures stretch the repeat interval.
pub struct MutationsSyncJob {
    outbox: Arc<Outbox>,
    timing: JobTiming,
    max_backoff: Duration,
    failures: AtomicU32,
}

impl MutationsSyncJob {
    pub fn new(outbox: Arc<Outbox>, timing: JobTiming, max_backoff: Duration) -> Self {
        Self {
            outbox,
            timing,
            max_backoff,
            failures: AtomicU32::new(0),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Job for MutationsSyncJob {
    fn key(&self) -> String {
        MUTATIONS_SYNC.to_string()
    }

    fn debounce(&self) -> Duration {
        self.timing.debounce()
    }

    fn interval(&self) -> Option<Duration> {
        let base = self.timing.interval()?;
        match self.failures() {
            0 => Some(base),
            n => Some(backoff(BACKOFF_BASE, n, self.max_backoff)),
        }
    }

    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.outbox.flush().await {
                Ok(_) => {
                    self.failures.store(0, Ordering::SeqCst);
                    Ok(())
                }
                Err(e @ SyncError::Transport(_)) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    log::debug!("mutations.sync: transport down ({} failures)", failures);
                    Err(e)
                }
                Err(e) => Err(e),
            }
        })
    }
}

/// Starts (or pings) every consumer of every root the replica follows.
pub struct ConsumersSyncJob {
    replica: Arc<Replica>,
    transport: Arc<dyn SyncTransport>,
    timing: JobTiming,
}

impl ConsumersSyncJob {
    pub fn new(replica: Arc<Replica>, transport: Arc<dyn SyncTransport>, timing: JobTiming) -> Self {
        Self {
            replica,
            transport,
            timing,
        }
    }

    /// Initialize consumers and return how many were started.
    ///
    /// A root the authority refuses (e.g. not pushed yet) is skipped; a
    /// transport failure aborts the run.
    pub async fn init_all(&self) -> Result<usize> {
        let mut started = 0;
        for root_id in self.replica.root_ids()? {
            for consumer_type in ConsumerType::ALL {
                let key = ConsumerKey::new(consumer_type, root_id.clone());
                let cursor = self.replica.cursor(&key.to_string())?;
                match self.transport.init_consumer(key.clone(), Some(cursor)).await {
                    Ok(()) => started += 1,
                    Err(e @ SyncError::Transport(_)) => return Err(e),
                    Err(e) => log::debug!("consumer {} not started: {}", key, e),
                }
            }
        }
        Ok(started)
    }
}

impl Job for ConsumersSyncJob {
    fn key(&self) -> String {
        CONSUMERS_SYNC.to_string()
    }

    fn debounce(&self) -> Duration {
        self.timing.debounce()
    }

    fn interval(&self) -> Option<Duration> {
        self.timing.interval()
    }

    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let started = self.init_all().await?;
            log::trace!("consumers.sync: {} consumers initialized", started);
            Ok(())
        })
    }
}

/// Drops settled delete tombstones past their retention.
pub struct TombstonesCleanupJob {
    store: Arc<LocalStore>,
    retention_ms: i64,
    timing: JobTiming,
}

impl TombstonesCleanupJob {
    pub fn new(store: Arc<LocalStore>, retention_ms: i64, timing: JobTiming) -> Self {
        Self {
            store,
            retention_ms,
            timing,
        }
    }

    pub fn purge(&self) -> Result<usize> {
        let before = now_millis() - self.retention_ms;
        self.store.with_tx(|tx| purge_tombstones(tx, before))
    }
}

impl Job for TombstonesCleanupJob {
    fn key(&self) -> String {
        TOMBSTONES_CLEANUP.to_string()
    }

    fn debounce(&self) -> Duration {
        self.timing.debounce()
    }

    fn interval(&self) -> Option<Duration> {
        self.timing.interval()
    }

    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let purged = self.purge()?;
            if purged > 0 {
                log::debug!("tombstones.cleanup: purged {}", purged);
            }
            Ok(())
        })
    }
}
