//! Ancestry-scoped role resolution.
//!
//! Grants live in a node's `collaborators` attribute (`{actorId: role}`).
//! The effective role of an actor on a node is the grant found on the
//! nearest node walking from the node up to its root.

use serde::{Deserialize, Serialize};

use crate::crdt::SchemaRegistry;
use crate::error::{Result, SyncError};
use crate::model::{Node, NodeType};

/// Attribute key holding explicit grants.
pub const COLLABORATORS_FIELD: &str = "collaborators";

/// Collaboration role, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Collaborator,
    Editor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Collaborator => "collaborator",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "collaborator" => Ok(Role::Collaborator),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Explicit grant for `actor_id` stored on `attributes`, if any.
pub fn explicit_role(attributes: &crate::model::Attributes, actor_id: &str) -> Option<Role> {
    attributes
        .get(COLLABORATORS_FIELD)?
        .as_object()?
        .get(actor_id)?
        .as_str()?
        .parse()
        .ok()
}

/// Most specific grant along `ancestry`, which is ordered root-to-leaf.
pub fn effective_role(ancestry: &[Node], actor_id: &str) -> Option<Role> {
    ancestry
        .iter()
        .rev()
        .find_map(|node| explicit_role(&node.attributes, actor_id))
}

fn require(role: Option<Role>, needed: Role, what: &str) -> Result<Role> {
    match role {
        Some(role) if role >= needed => Ok(role),
        Some(role) => Err(SyncError::Permission(format!(
            "{} requires role {} (has {})",
            what, needed, role
        ))),
        None => Err(SyncError::Permission(format!(
            "{} requires role {} (no access)",
            what, needed
        ))),
    }
}

/// Check that `actor_id` may create a node of `node_type` under the parent
/// whose ancestry (root-to-parent) is `parent_ancestry`.
///
/// Creating a root requires the creator to grant themselves `admin`.
pub fn check_create(
    registry: &SchemaRegistry,
    parent_ancestry: &[Node],
    actor_id: &str,
    node_type: NodeType,
    attributes: &crate::model::Attributes,
) -> Result<()> {
    let schema = registry.get(node_type)?;
    let Some(parent) = parent_ancestry.last() else {
        if !schema.is_root() {
            return Err(SyncError::Validation(format!(
                "{} nodes need a parent",
                node_type
            )));
        }
        return match explicit_role(attributes, actor_id) {
            Some(Role::Admin) => Ok(()),
            _ => Err(SyncError::Permission(format!(
                "creator of a {} must be its admin",
                node_type
            ))),
        };
    };
    registry.validate_parent(node_type, parent.node_type)?;
    require(
        effective_role(parent_ancestry, actor_id),
        schema.create_role,
        &format!("creating a {}", node_type),
    )?;
    Ok(())
}

/// Check that `actor_id` may edit the node at the end of `ancestry`.
///
/// Editors may edit anything; authors may edit their own nodes with at
/// least `collaborator`.
pub fn check_update(ancestry: &[Node], actor_id: &str) -> Result<()> {
    let node = ancestry
        .last()
        .ok_or_else(|| SyncError::NotFound("empty ancestry".to_string()))?;
    let role = effective_role(ancestry, actor_id);
    if node.created_by == actor_id {
        require(role, Role::Collaborator, "editing own node")?;
    } else {
        require(role, Role::Editor, &format!("editing {}", node.id))?;
    }
    Ok(())
}

/// Deletion follows the same rule as editing, except roots need `admin`.
pub fn check_delete(ancestry: &[Node], actor_id: &str) -> Result<()> {
    let node = ancestry
        .last()
        .ok_or_else(|| SyncError::NotFound("empty ancestry".to_string()))?;
    if node.is_root() {
        require(
            effective_role(ancestry, actor_id),
            Role::Admin,
            "deleting a root",
        )?;
        return Ok(());
    }
    check_update(ancestry, actor_id)
}

/// Reactions and interactions only need read access.
pub fn check_view(ancestry: &[Node], actor_id: &str) -> Result<()> {
    require(effective_role(ancestry, actor_id), Role::Viewer, "viewing")?;
    Ok(())
}

/// Editing a node's document requires edit rights on the node itself.
pub fn check_document_edit(ancestry: &[Node], actor_id: &str) -> Result<()> {
    check_update(ancestry, actor_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attributes;
    use serde_json::json;

    fn node(id: &str, node_type: NodeType, parent: Option<&str>, attrs: serde_json::Value) -> Node {
        let attributes: Attributes = attrs.as_object().cloned().unwrap_or_default();
        Node {
            id: id.into(),
            node_type,
            parent_id: parent.map(String::from),
            root_id: "space".into(),
            attributes,
            state: vec![],
            revision: 0,
            created_at: 0,
            created_by: "owner".into(),
            updated_at: None,
            updated_by: None,
            server_created_at: None,
            server_updated_at: None,
        }
    }

    fn ancestry() -> Vec<Node> {
        vec![
            node(
                "space",
                NodeType::Space,
                None,
                json!({"collaborators": {"owner": "admin", "ed": "editor", "viewer": "viewer", "guest": "viewer"}}),
            ),
            node(
                "folder",
                NodeType::Folder,
                Some("space"),
                json!({"collaborators": {"guest": "editor"}}),
            ),
        ]
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin > Role::Editor);
        assert!(Role::Editor > Role::Collaborator);
        assert!(Role::Collaborator > Role::Viewer);
        assert_eq!("editor".parse::<Role>().unwrap(), Role::Editor);
    }

    #[test]
    fn test_most_specific_grant_wins() {
        let chain = ancestry();
        assert_eq!(effective_role(&chain, "guest"), Some(Role::Editor));
        assert_eq!(effective_role(&chain[..1], "guest"), Some(Role::Viewer));
        assert_eq!(effective_role(&chain, "ed"), Some(Role::Editor));
        assert_eq!(effective_role(&chain, "stranger"), None);
    }

    #[test]
    fn test_check_create_rules() {
        let registry = SchemaRegistry::default();
        let chain = ancestry();
        let attrs = Attributes::new();

        assert!(check_create(&registry, &chain, "guest", NodeType::Page, &attrs).is_ok());
        assert!(matches!(
            check_create(&registry, &chain, "viewer", NodeType::Page, &attrs),
            Err(SyncError::Permission(_))
        ));
        // Messages cannot live in folders.
        assert!(matches!(
            check_create(&registry, &chain, "owner", NodeType::Message, &attrs),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_root_creator_must_be_admin() {
        let registry = SchemaRegistry::default();
        let granted: Attributes = json!({"collaborators": {"u1": "admin"}})
            .as_object()
            .cloned()
            .unwrap();
        assert!(check_create(&registry, &[], "u1", NodeType::Space, &granted).is_ok());
        assert!(check_create(&registry, &[], "u2", NodeType::Space, &granted).is_err());
        assert!(matches!(
            check_create(&registry, &[], "u1", NodeType::Page, &granted),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_authors_edit_own_nodes() {
        let mut chain = ancestry();
        let mut message = node("m1", NodeType::Page, Some("folder"), json!({}));
        message.created_by = "viewer".into();
        chain.push(message);
        // Authorship does not lift a viewer to collaborator.
        assert!(check_update(&chain, "viewer").is_err());
        assert!(check_update(&chain, "ed").is_ok());
        assert!(check_delete(&chain, "ed").is_ok());
        assert!(check_view(&chain, "viewer").is_ok());
        assert!(check_delete(&chain[..1], "ed").is_err());
        assert!(check_delete(&chain[..1], "owner").is_ok());
    }
}
