//! Transports between a local replica and the authority.
//!
//! Pushes are request/response; change batches arrive asynchronously on a
//! channel that the client takes once and drains.

mod loopback;
#[cfg(feature = "native-sync")]
mod ws;

pub use loopback::LoopbackTransport;
#[cfg(feature = "native-sync")]
pub use ws::WsTransport;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{ChangeBatch, ConsumerKey, Mutation, MutationResult};
use crate::scheduler::BoxFuture;

/// Connection from a replica to the authority.
pub trait SyncTransport: Send + Sync {
    /// Push a batch and return one result per accepted-or-rejected item.
    ///
    /// Fails with `SyncError::Transport` when no response was received.
    fn push_mutations(&self, mutations: Vec<Mutation>) -> BoxFuture<'_, Result<Vec<MutationResult>>>;

    /// Start (or ping) the consumer for `key`. `cursor` is the client's last
    /// durably applied change; `None` resumes from the authority's record.
    fn init_consumer(&self, key: ConsumerKey, cursor: Option<i64>) -> BoxFuture<'_, Result<()>>;

    /// Report that every change up to `cursor` has been applied.
    fn ack(&self, key: ConsumerKey, cursor: i64) -> BoxFuture<'_, Result<()>>;

    /// Incoming change batches. Returns `None` after the first call.
    fn take_batches(&self) -> Option<mpsc::UnboundedReceiver<ChangeBatch>>;
}
