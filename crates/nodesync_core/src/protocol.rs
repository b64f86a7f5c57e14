//! JSON messages exchanged over a sync connection.
//!
//! Both directions are tagged with `type`. Consumer keys travel in their
//! `type:root` string form.

use serde::{Deserialize, Serialize};

use crate::error::SerializableError;
use crate::model::{ChangeBatch, Mutation, MutationResult};

/// Replica → authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    PushMutations {
        request_id: String,
        mutations: Vec<Mutation>,
    },
    /// Start or ping a consumer. Without a cursor the authority resumes
    /// from the last cursor this device acknowledged.
    ConsumerInit {
        consumer_key: String,
        #[serde(default)]
        cursor: Option<i64>,
    },
    ConsumerAck {
        consumer_key: String,
        cursor: i64,
    },
}

/// Authority → replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    PushResult {
        request_id: String,
        results: Vec<MutationResult>,
    },
    ChangeBatch {
        batch: ChangeBatch,
    },
    ConsumerError {
        consumer_key: String,
        message: String,
    },
    /// A request failed as a whole; `request_id` is set when it was a push.
    Error {
        #[serde(default)]
        request_id: Option<String>,
        error: SerializableError,
    },
}
