use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;

/// Plain-data projection of a CRDT document.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Node type tag, which selects the schema and permission rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Space,
    Folder,
    Page,
    Database,
    Record,
    Channel,
    Chat,
    Message,
    File,
}

impl NodeType {
    /// All built-in node types.
    pub const ALL: [NodeType; 9] = [
        NodeType::Space,
        NodeType::Folder,
        NodeType::Page,
        NodeType::Database,
        NodeType::Record,
        NodeType::Channel,
        NodeType::Chat,
        NodeType::Message,
        NodeType::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Space => "space",
            NodeType::Folder => "folder",
            NodeType::Page => "page",
            NodeType::Database => "database",
            NodeType::Record => "record",
            NodeType::Channel => "channel",
            NodeType::Chat => "chat",
            NodeType::Message => "message",
            NodeType::File => "file",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown node type: {}", s))
    }
}

/// A hierarchical collaborative entity.
///
/// `attributes` is always the projection of `state` (plus, on a local
/// replica, the pending update tail). It is never edited directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub attributes: Attributes,
    #[serde(with = "base64_bytes")]
    pub state: Vec<u8>,
    pub revision: i64,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: Option<i64>,
    pub updated_by: Option<String>,
    #[serde(default)]
    pub server_created_at: Option<i64>,
    #[serde(default)]
    pub server_updated_at: Option<i64>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Look up a string attribute.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Collaborative rich content owned by a node (pages, records).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub root_id: String,
    pub content: Attributes,
    #[serde(with = "base64_bytes")]
    pub state: Vec<u8>,
    pub revision: i64,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: Option<i64>,
    pub updated_by: Option<String>,
}

/// A reaction left by a collaborator on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReaction {
    pub node_id: String,
    pub collaborator_id: String,
    pub reaction: String,
    pub root_id: String,
    pub revision: i64,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

/// Per-collaborator read tracking for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInteraction {
    pub node_id: String,
    pub collaborator_id: String,
    pub root_id: String,
    pub revision: i64,
    pub first_seen_at: Option<i64>,
    pub last_seen_at: Option<i64>,
    pub first_opened_at: Option<i64>,
    pub last_opened_at: Option<i64>,
}

impl NodeInteraction {
    pub fn new(node_id: &str, collaborator_id: &str, root_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            collaborator_id: collaborator_id.to_string(),
            root_id: root_id.to_string(),
            revision: 0,
            first_seen_at: None,
            last_seen_at: None,
            first_opened_at: None,
            last_opened_at: None,
        }
    }

    /// Record a "seen" interaction at `at`.
    pub fn seen(&mut self, at: i64) {
        self.first_seen_at = Some(self.first_seen_at.map_or(at, |prev| prev.min(at)));
        self.last_seen_at = Some(self.last_seen_at.map_or(at, |prev| prev.max(at)));
    }

    /// Record an "opened" interaction at `at`. Opening implies seeing.
    pub fn opened(&mut self, at: i64) {
        self.seen(at);
        self.first_opened_at = Some(self.first_opened_at.map_or(at, |prev| prev.min(at)));
        self.last_opened_at = Some(self.last_opened_at.map_or(at, |prev| prev.max(at)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_roundtrip_str() {
        for node_type in NodeType::ALL {
            assert_eq!(node_type.as_str().parse::<NodeType>().unwrap(), node_type);
        }
        assert!("widget".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_node_serializes_camel_case() {
        let node = Node {
            id: "n1".into(),
            node_type: NodeType::Page,
            parent_id: Some("s1".into()),
            root_id: "s1".into(),
            attributes: Attributes::new(),
            state: vec![1, 2],
            revision: 3,
            created_at: 10,
            created_by: "u1".into(),
            updated_at: None,
            updated_by: None,
            server_created_at: None,
            server_updated_at: None,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "page");
        assert_eq!(json["parentId"], "s1");
        assert_eq!(json["state"], "AQI=");
    }

    #[test]
    fn test_interaction_timestamps() {
        let mut interaction = NodeInteraction::new("n1", "u1", "s1");
        interaction.seen(100);
        interaction.seen(50);
        assert_eq!(interaction.first_seen_at, Some(50));
        assert_eq!(interaction.last_seen_at, Some(100));

        interaction.opened(200);
        assert_eq!(interaction.first_opened_at, Some(200));
        assert_eq!(interaction.last_seen_at, Some(200));
    }
}
