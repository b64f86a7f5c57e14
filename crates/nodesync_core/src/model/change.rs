use serde::{Deserialize, Serialize};

use super::node::{Document, Node, NodeInteraction, NodeReaction};

/// Collection a consumer streams, scoped by root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerType {
    Nodes,
    Documents,
    Reactions,
    Interactions,
}

impl ConsumerType {
    pub const ALL: [ConsumerType; 4] = [
        ConsumerType::Nodes,
        ConsumerType::Documents,
        ConsumerType::Reactions,
        ConsumerType::Interactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerType::Nodes => "nodes",
            ConsumerType::Documents => "documents",
            ConsumerType::Reactions => "reactions",
            ConsumerType::Interactions => "interactions",
        }
    }
}

impl std::fmt::Display for ConsumerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConsumerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConsumerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown consumer type: {}", s))
    }
}

/// Identifies one change stream of a client: `<type>:<root_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub consumer_type: ConsumerType,
    pub root_id: String,
}

impl ConsumerKey {
    pub fn new(consumer_type: ConsumerType, root_id: impl Into<String>) -> Self {
        Self {
            consumer_type,
            root_id: root_id.into(),
        }
    }
}

impl std::fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.consumer_type, self.root_id)
    }
}

impl std::str::FromStr for ConsumerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, root_id) = s
            .split_once(':')
            .ok_or_else(|| format!("Malformed consumer key: {}", s))?;
        if root_id.is_empty() {
            return Err(format!("Malformed consumer key: {}", s));
        }
        Ok(Self::new(kind.parse()?, root_id))
    }
}

/// Content of an accepted change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChangePayload {
    NodeUpserted {
        node: Node,
        /// Client pending-update ids absorbed by this revision.
        #[serde(default)]
        update_ids: Vec<String>,
    },
    NodeDeleted {
        node_id: String,
        deleted_at: i64,
    },
    DocumentUpdated {
        document: Document,
        #[serde(default)]
        update_ids: Vec<String>,
    },
    ReactionUpserted {
        reaction: NodeReaction,
    },
    InteractionUpserted {
        interaction: NodeInteraction,
    },
}

impl ChangePayload {
    /// The consumer stream that carries this change.
    pub fn consumer_type(&self) -> ConsumerType {
        match self {
            ChangePayload::NodeUpserted { .. } | ChangePayload::NodeDeleted { .. } => {
                ConsumerType::Nodes
            }
            ChangePayload::DocumentUpdated { .. } => ConsumerType::Documents,
            ChangePayload::ReactionUpserted { .. } => ConsumerType::Reactions,
            ChangePayload::InteractionUpserted { .. } => ConsumerType::Interactions,
        }
    }
}

/// Immutable record of an accepted mutation. `id` is the stream cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: i64,
    pub root_id: String,
    pub payload: ChangePayload,
    pub created_at: i64,
}

/// A page of changes for one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub consumer_key: String,
    pub changes: Vec<Change>,
    /// Cursor to acknowledge once the batch is durably applied.
    pub cursor: i64,
}
