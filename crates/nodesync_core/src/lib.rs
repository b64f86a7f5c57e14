#![doc = include_str!("../README.md")]

/// Ancestry index (closure table of node paths)
pub mod ancestry;

/// Authoritative store, change log and consumer protocol
pub mod authority;

/// Engine configuration
pub mod config;

/// CRDT merge engine and schemas
pub mod crdt;

/// Serde helpers and identifiers
pub mod encoding;

/// Error (common error types)
pub mod error;

/// Outbound engine events
pub mod events;

/// Local replica: entity store, outbox, revert, jobs
pub mod local;

/// Plain data types
pub mod model;

/// Role resolution over the ancestry index
pub mod permission;

/// Wire messages exchanged between replicas and the authority
pub mod protocol;

/// Debounced job runner
pub mod scheduler;

mod store;

/// Transports between a replica and the authority
pub mod transport;

pub use error::{Result, SyncError};
