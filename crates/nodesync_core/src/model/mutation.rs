use serde::{Deserialize, Serialize};

use super::node::NodeType;
use crate::encoding::base64_bytes;

/// Kind of local operation waiting in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationType {
    CreateNode,
    UpdateNode,
    DeleteNode,
    CreateReaction,
    DeleteReaction,
    UpdateDocument,
    MarkSeen,
    MarkOpened,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::CreateNode => "create_node",
            MutationType::UpdateNode => "update_node",
            MutationType::DeleteNode => "delete_node",
            MutationType::CreateReaction => "create_reaction",
            MutationType::DeleteReaction => "delete_reaction",
            MutationType::UpdateDocument => "update_document",
            MutationType::MarkSeen => "mark_seen",
            MutationType::MarkOpened => "mark_opened",
        }
    }
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodePayload {
    pub node_id: String,
    pub root_id: String,
    pub parent_id: Option<String>,
    pub node_type: NodeType,
    /// Full initial CRDT state of the node.
    #[serde(with = "base64_bytes")]
    pub state: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodePayload {
    pub node_id: String,
    pub root_id: String,
    /// Local pending update rows folded into `data`.
    pub update_ids: Vec<String>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Authoritative revision the local edit was derived from.
    pub base_revision: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNodePayload {
    pub node_id: String,
    pub root_id: String,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub node_id: String,
    pub root_id: String,
    pub reaction: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocumentPayload {
    pub document_id: String,
    pub root_id: String,
    pub update_ids: Vec<String>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub base_revision: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionPayload {
    pub node_id: String,
    pub root_id: String,
    pub at: i64,
}

/// Operation-specific data of a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationPayload {
    CreateNode(CreateNodePayload),
    UpdateNode(UpdateNodePayload),
    DeleteNode(DeleteNodePayload),
    CreateReaction(ReactionPayload),
    DeleteReaction(ReactionPayload),
    UpdateDocument(UpdateDocumentPayload),
    MarkSeen(InteractionPayload),
    MarkOpened(InteractionPayload),
}

impl MutationPayload {
    pub fn mutation_type(&self) -> MutationType {
        match self {
            MutationPayload::CreateNode(_) => MutationType::CreateNode,
            MutationPayload::UpdateNode(_) => MutationType::UpdateNode,
            MutationPayload::DeleteNode(_) => MutationType::DeleteNode,
            MutationPayload::CreateReaction(_) => MutationType::CreateReaction,
            MutationPayload::DeleteReaction(_) => MutationType::DeleteReaction,
            MutationPayload::UpdateDocument(_) => MutationType::UpdateDocument,
            MutationPayload::MarkSeen(_) => MutationType::MarkSeen,
            MutationPayload::MarkOpened(_) => MutationType::MarkOpened,
        }
    }

    /// The node this mutation concerns. Documents share their node's id.
    pub fn node_id(&self) -> &str {
        match self {
            MutationPayload::CreateNode(p) => &p.node_id,
            MutationPayload::UpdateNode(p) => &p.node_id,
            MutationPayload::DeleteNode(p) => &p.node_id,
            MutationPayload::CreateReaction(p) | MutationPayload::DeleteReaction(p) => &p.node_id,
            MutationPayload::UpdateDocument(p) => &p.document_id,
            MutationPayload::MarkSeen(p) | MutationPayload::MarkOpened(p) => &p.node_id,
        }
    }

    pub fn root_id(&self) -> &str {
        match self {
            MutationPayload::CreateNode(p) => &p.root_id,
            MutationPayload::UpdateNode(p) => &p.root_id,
            MutationPayload::DeleteNode(p) => &p.root_id,
            MutationPayload::CreateReaction(p) | MutationPayload::DeleteReaction(p) => &p.root_id,
            MutationPayload::UpdateDocument(p) => &p.root_id,
            MutationPayload::MarkSeen(p) | MutationPayload::MarkOpened(p) => &p.root_id,
        }
    }

    /// Key under which a newer mutation of the same class supersedes an older one.
    ///
    /// Create/update/delete of a node all share the node key; reactions are
    /// keyed per reaction; interactions per interaction kind.
    pub fn supersede_key(&self) -> String {
        match self {
            MutationPayload::CreateNode(p) => format!("node:{}", p.node_id),
            MutationPayload::UpdateNode(p) => format!("node:{}", p.node_id),
            MutationPayload::DeleteNode(p) => format!("node:{}", p.node_id),
            MutationPayload::UpdateDocument(p) => format!("document:{}", p.document_id),
            MutationPayload::CreateReaction(p) | MutationPayload::DeleteReaction(p) => {
                format!("reaction:{}:{}", p.node_id, p.reaction)
            }
            MutationPayload::MarkSeen(p) => format!("seen:{}", p.node_id),
            MutationPayload::MarkOpened(p) => format!("opened:{}", p.node_id),
        }
    }
}

/// A local, not-yet-acknowledged operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: String,
    pub actor_id: String,
    pub payload: MutationPayload,
    pub created_at: i64,
    #[serde(default)]
    pub retries: u32,
}

impl Mutation {
    pub fn new(actor_id: &str, payload: MutationPayload) -> Self {
        Self {
            id: crate::encoding::generate_id(),
            actor_id: actor_id.to_string(),
            payload,
            created_at: crate::encoding::now_millis(),
            retries: 0,
        }
    }

    pub fn mutation_type(&self) -> MutationType {
        self.payload.mutation_type()
    }
}

/// Why the authority refused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Validation,
    Permission,
    NotFound,
    Conflict,
    Internal,
}

impl RejectReason {
    /// Terminal rejections are reverted immediately instead of consuming retry budget.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RejectReason::Validation | RejectReason::Permission | RejectReason::NotFound
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationStatus {
    Accepted,
    Rejected { reason: RejectReason, message: String },
}

/// Per-item outcome of a pushed mutation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub id: String,
    pub result: MutationStatus,
}

impl MutationResult {
    pub fn accepted(id: &str) -> Self {
        Self {
            id: id.to_string(),
            result: MutationStatus::Accepted,
        }
    }

    pub fn rejected(id: &str, reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: MutationStatus::Rejected {
                reason,
                message: message.into(),
            },
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.result, MutationStatus::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(node: &str, reaction: &str) -> ReactionPayload {
        ReactionPayload {
            node_id: node.into(),
            root_id: "root".into(),
            reaction: reaction.into(),
            created_at: 1,
        }
    }

    #[test]
    fn test_payload_wire_format() {
        let mutation = Mutation::new(
            "u1",
            MutationPayload::DeleteNode(DeleteNodePayload {
                node_id: "n1".into(),
                root_id: "s1".into(),
                deleted_at: 5,
            }),
        );
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["payload"]["type"], "delete_node");
        assert_eq!(json["payload"]["nodeId"], "n1");
        assert_eq!(json["actorId"], "u1");

        let back: Mutation = serde_json::from_value(json).unwrap();
        assert_eq!(back, mutation);
    }

    #[test]
    fn test_supersede_keys() {
        let create = MutationPayload::CreateReaction(reaction("n1", "+1"));
        let delete = MutationPayload::DeleteReaction(reaction("n1", "+1"));
        let other = MutationPayload::CreateReaction(reaction("n1", "heart"));
        assert_eq!(create.supersede_key(), delete.supersede_key());
        assert_ne!(create.supersede_key(), other.supersede_key());
    }

    #[test]
    fn test_result_wire_format() {
        let result = MutationResult::rejected("m1", RejectReason::Permission, "nope");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"]["status"], "rejected");
        assert_eq!(json["result"]["reason"], "permission");
        assert!(MutationResult::accepted("m2").is_accepted());
        assert!(RejectReason::Permission.is_terminal());
        assert!(!RejectReason::Conflict.is_terminal());
    }
}
