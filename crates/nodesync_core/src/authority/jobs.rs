//! Recurring authoritative jobs.

use std::sync::Arc;
use std::time::Duration;

use super::accept::Authority;
use super::consumer::ConsumerRegistry;
use crate::config::JobTiming;
use crate::error::Result;
use crate::scheduler::{BoxFuture, Job};

pub const CONSUMERS_POLL: &str = "consumers.poll";
pub const UPDATES_COMPACT: &str = "updates.compact";

/// Pings every consumer, catching changes a notification missed.
pub struct ConsumersPollJob {
    registry: Arc<ConsumerRegistry>,
    timing: JobTiming,
}

impl ConsumersPollJob {
    pub fn new(registry: Arc<ConsumerRegistry>, timing: JobTiming) -> Self {
        Self { registry, timing }
    }
}

impl Job for ConsumersPollJob {
    fn key(&self) -> String {
        CONSUMERS_POLL.to_string()
    }

    fn debounce(&self) -> Duration {
        self.timing.debounce()
    }

    fn interval(&self) -> Option<Duration> {
        self.timing.interval()
    }

    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.registry.ping_all();
            Ok(())
        })
    }
}

pub struct UpdatesCompactJob {
    authority: Arc<Authority>,
    keep: usize,
    timing: JobTiming,
}

impl UpdatesCompactJob {
    pub fn new(authority: Arc<Authority>, keep: usize, timing: JobTiming) -> Self {
        Self {
            authority,
            keep,
            timing,
        }
    }
}

impl Job for UpdatesCompactJob {
    fn key(&self) -> String {
        UPDATES_COMPACT.to_string()
    }

    fn debounce(&self) -> Duration {
        self.timing.debounce()
    }

    fn interval(&self) -> Option<Duration> {
        self.timing.interval()
    }

    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let removed = self.authority.compact_update_log(self.keep)?;
            if removed > 0 {
                log::info!("updates.compact: removed {} log entries", removed);
            }
            Ok(())
        })
    }
}
