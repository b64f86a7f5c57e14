//! Attribute schemas per node type.
//!
//! Every merged projection is validated before it is persisted, so a
//! schema describes the *whole* attribute set, not a single edit.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::{Attributes, NodeType};
use crate::permission::{COLLABORATORS_FIELD, Role};

/// Shape accepted for a single attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
    /// Object of `actorId -> role name`.
    RoleMap,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
            FieldKind::RoleMap => value.as_object().is_some_and(|grants| {
                grants
                    .values()
                    .all(|v| v.as_str().is_some_and(|s| s.parse::<Role>().is_ok()))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub required: bool,
}

/// Schema for one node type.
#[derive(Debug, Clone)]
pub struct NodeSchema {
    pub node_type: NodeType,
    pub fields: IndexMap<String, FieldSpec>,
    /// Allowed parent types. Empty means the type is a root.
    pub parents: Vec<NodeType>,
    pub has_document: bool,
    /// Minimum role on the parent needed to create this type.
    pub create_role: Role,
}

impl NodeSchema {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            fields: IndexMap::new(),
            parents: Vec::new(),
            has_document: false,
            create_role: Role::Editor,
        }
    }

    pub fn field(mut self, name: &str, kind: FieldKind, required: bool) -> Self {
        self.fields
            .insert(name.to_string(), FieldSpec { kind, required });
        self
    }

    pub fn parents(mut self, parents: &[NodeType]) -> Self {
        self.parents = parents.to_vec();
        self
    }

    pub fn with_document(mut self) -> Self {
        self.has_document = true;
        self
    }

    pub fn create_role(mut self, role: Role) -> Self {
        self.create_role = role;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Validate a full attribute projection against this schema.
    pub fn validate(&self, projection: &Attributes) -> Result<()> {
        match projection.get("type").and_then(Value::as_str) {
            Some(t) if t == self.node_type.as_str() => {}
            other => {
                return Err(SyncError::Validation(format!(
                    "type mismatch: expected {}, got {:?}",
                    self.node_type, other
                )));
            }
        }

        let parent = projection.get("parentId").filter(|v| !v.is_null());
        match (self.is_root(), parent) {
            (true, Some(_)) => {
                return Err(SyncError::Validation(format!(
                    "{} is a root type and cannot have a parent",
                    self.node_type
                )));
            }
            (false, None) => {
                return Err(SyncError::Validation(format!(
                    "{} requires parentId",
                    self.node_type
                )));
            }
            (false, Some(v)) if !v.is_string() => {
                return Err(SyncError::Validation("parentId must be a string".into()));
            }
            _ => {}
        }

        validate_fields(&self.fields, projection, &["type", "parentId"])
    }
}

fn validate_fields(
    fields: &IndexMap<String, FieldSpec>,
    projection: &Attributes,
    reserved: &[&str],
) -> Result<()> {
    for (key, value) in projection {
        if reserved.contains(&key.as_str()) {
            continue;
        }
        let spec = fields
            .get(key)
            .ok_or_else(|| SyncError::Validation(format!("unknown field '{}'", key)))?;
        if value.is_null() {
            if spec.required {
                return Err(SyncError::Validation(format!("field '{}' is required", key)));
            }
            continue;
        }
        if !spec.kind.matches(value) {
            return Err(SyncError::Validation(format!(
                "field '{}' must be {:?}",
                key, spec.kind
            )));
        }
    }
    for (key, spec) in fields {
        if spec.required && projection.get(key).is_none_or(Value::is_null) {
            return Err(SyncError::Validation(format!("field '{}' is required", key)));
        }
    }
    Ok(())
}

/// Lookup table of node schemas plus the document schema.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    nodes: HashMap<NodeType, NodeSchema>,
    document_fields: IndexMap<String, FieldSpec>,
}

impl SchemaRegistry {
    /// Registry with no node types.
    pub fn empty() -> Self {
        let mut document_fields = IndexMap::new();
        document_fields.insert(
            "content".to_string(),
            FieldSpec {
                kind: FieldKind::Any,
                required: true,
            },
        );
        Self {
            nodes: HashMap::new(),
            document_fields,
        }
    }

    pub fn register(&mut self, schema: NodeSchema) {
        self.nodes.insert(schema.node_type, schema);
    }

    pub fn get(&self, node_type: NodeType) -> Result<&NodeSchema> {
        self.nodes
            .get(&node_type)
            .ok_or_else(|| SyncError::Validation(format!("no schema for {}", node_type)))
    }

    /// Read and parse the `type` attribute of a projection.
    pub fn node_type_of(projection: &Attributes) -> Result<NodeType> {
        projection
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Validation("missing type".into()))?
            .parse()
            .map_err(SyncError::Validation)
    }

    /// Validate a node projection and return its type.
    pub fn validate_node(&self, projection: &Attributes) -> Result<NodeType> {
        let node_type = Self::node_type_of(projection)?;
        self.get(node_type)?.validate(projection)?;
        Ok(node_type)
    }

    pub fn validate_document(&self, content: &Attributes) -> Result<()> {
        validate_fields(&self.document_fields, content, &[])
    }

    pub fn validate_parent(&self, child: NodeType, parent: NodeType) -> Result<()> {
        let schema = self.get(child)?;
        if schema.parents.contains(&parent) {
            Ok(())
        } else {
            Err(SyncError::Validation(format!(
                "{} cannot be a child of {}",
                child, parent
            )))
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        use FieldKind::*;
        use NodeType::*;

        let container = [Space, Folder, Page];
        let mut registry = Self::empty();

        registry.register(
            NodeSchema::new(Space)
                .field("name", String, true)
                .field("description", String, false)
                .field("avatar", String, false)
                .field("visibility", String, false)
                .field(COLLABORATORS_FIELD, RoleMap, true)
                .create_role(Role::Admin),
        );
        for node_type in [Folder, Page, Database, Channel] {
            let mut schema = NodeSchema::new(node_type)
                .field("name", String, true)
                .field("avatar", String, false)
                .field("index", String, false)
                .field(COLLABORATORS_FIELD, RoleMap, false)
                .parents(&container);
            if node_type == Page {
                schema = schema.with_document();
            }
            if node_type == Database {
                schema = schema.field("fields", Object, false);
            }
            registry.register(schema);
        }
        registry.register(
            NodeSchema::new(Record)
                .field("name", String, true)
                .field("fields", Object, false)
                .field("index", String, false)
                .parents(&[Database])
                .with_document()
                .create_role(Role::Collaborator),
        );
        registry.register(
            NodeSchema::new(Chat)
                .field("collaborators", RoleMap, true)
                .create_role(Role::Admin),
        );
        registry.register(
            NodeSchema::new(Message)
                .field("subtype", String, false)
                .field("content", Array, false)
                .field("referenceId", String, false)
                .parents(&[Channel, Chat, Message, Record, Page])
                .create_role(Role::Collaborator),
        );
        registry.register(
            NodeSchema::new(File)
                .field("name", String, true)
                .field("originalName", String, false)
                .field("mimeType", String, false)
                .field("extension", String, false)
                .field("size", Number, false)
                .field("subtype", String, false)
                .field("status", Number, false)
                .field("index", String, false)
                .parents(&[Folder, Page, Record, Message, Channel, Chat])
                .create_role(Role::Collaborator),
        );
        registry
    }
}
