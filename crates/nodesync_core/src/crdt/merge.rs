//! Pure merge functions over encoded CRDT state.
//!
//! Every call reconstructs a working document, applies its inputs, derives
//! and validates the projection, and returns owned values. Nothing here
//! touches storage; callers persist the output only if their own checks
//! (permissions, revision) also pass.

use std::sync::Arc;

use super::document::{AttributeDoc, merge_deltas};
use super::schema::SchemaRegistry;
use crate::error::Result;
use crate::model::{Attributes, NodeType};

/// Result of merging updates into a base state.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    /// Compacted snapshot absorbing the base and all applied updates.
    pub state: Vec<u8>,
    /// Validated projection of `state`.
    pub attributes: Attributes,
}

/// Result of a local edit: the delta to ship plus the merged outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEdit {
    /// Encoded update produced by the edit (empty if the edit was a no-op).
    pub delta: Vec<u8>,
    pub merged: Merged,
}

impl LocalEdit {
    pub fn is_noop(&self) -> bool {
        self.delta.is_empty()
    }
}

/// Merge engine bound to a schema registry.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    schemas: Arc<SchemaRegistry>,
}

impl MergeEngine {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self { schemas }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Replay `updates` in order on top of `base`, without validation.
    fn rebuild<U: AsRef<[u8]>>(base: &[u8], updates: &[U]) -> Result<AttributeDoc> {
        let doc = AttributeDoc::from_state(base)?;
        for update in updates {
            doc.apply(update.as_ref())?;
        }
        Ok(doc)
    }

    /// Decode `base` plus `updates` into plain data without validating it.
    pub fn project<U: AsRef<[u8]>>(&self, base: &[u8], updates: &[U]) -> Result<Attributes> {
        Ok(Self::rebuild(base, updates)?.projection())
    }

    /// `merge(base, updates) -> (state, projection)` for a node.
    ///
    /// Fails with a validation error if the merged projection does not
    /// satisfy the schema of its `type`.
    pub fn merge_node<U: AsRef<[u8]>>(&self, base: &[u8], updates: &[U]) -> Result<Merged> {
        let doc = Self::rebuild(base, updates)?;
        let attributes = doc.projection();
        self.schemas.validate_node(&attributes)?;
        Ok(Merged {
            state: doc.encode_state(),
            attributes,
        })
    }

    /// Same as [`merge_node`](Self::merge_node) for collaborative documents.
    pub fn merge_document<U: AsRef<[u8]>>(&self, base: &[u8], updates: &[U]) -> Result<Merged> {
        let doc = Self::rebuild(base, updates)?;
        let attributes = doc.projection();
        self.schemas.validate_document(&attributes)?;
        Ok(Merged {
            state: doc.encode_state(),
            attributes,
        })
    }

    /// Build the initial state for a new node. `attributes` must already
    /// carry `type` and (for non-roots) `parentId`.
    pub fn create_node(&self, attributes: &Attributes) -> Result<LocalEdit> {
        self.schemas.validate_node(attributes)?;
        let doc = AttributeDoc::new();
        doc.write(attributes)?;
        let state = doc.encode_state();
        Ok(LocalEdit {
            delta: state.clone(),
            merged: Merged {
                state,
                attributes: doc.projection(),
            },
        })
    }

    /// Apply `updater` to the projection of `base + pending` and capture the
    /// resulting delta. The node type cannot be changed by an edit.
    pub fn edit_node<U, F>(&self, base: &[u8], pending: &[U], updater: F) -> Result<LocalEdit>
    where
        U: AsRef<[u8]>,
        F: FnOnce(Attributes) -> Result<Attributes>,
    {
        let doc = Self::rebuild(base, pending)?;
        let before = doc.projection();
        let node_type = SchemaRegistry::node_type_of(&before)?;
        let target = updater(before)?;
        if SchemaRegistry::node_type_of(&target)? != node_type {
            return Err(crate::error::SyncError::Validation(
                "node type cannot change".to_string(),
            ));
        }
        self.schemas.validate_node(&target)?;
        let delta = doc.write(&target)?;
        Ok(LocalEdit {
            delta,
            merged: Merged {
                state: doc.encode_state(),
                attributes: doc.projection(),
            },
        })
    }

    /// Document counterpart of [`edit_node`](Self::edit_node). An empty
    /// `base` starts a fresh document.
    pub fn edit_document<U, F>(&self, base: &[u8], pending: &[U], updater: F) -> Result<LocalEdit>
    where
        U: AsRef<[u8]>,
        F: FnOnce(Attributes) -> Result<Attributes>,
    {
        let doc = Self::rebuild(base, pending)?;
        let target = updater(doc.projection())?;
        self.schemas.validate_document(&target)?;
        let delta = doc.write(&target)?;
        Ok(LocalEdit {
            delta,
            merged: Merged {
                state: doc.encode_state(),
                attributes: doc.projection(),
            },
        })
    }

    /// Consolidate several deltas into one.
    pub fn merge_deltas(&self, deltas: &[Vec<u8>]) -> Result<Vec<u8>> {
        merge_deltas(deltas)
    }

    pub fn node_type_of(&self, attributes: &Attributes) -> Result<NodeType> {
        SchemaRegistry::node_type_of(attributes)
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(Arc::new(SchemaRegistry::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::{Value, json};

    fn attrs(v: Value) -> Attributes {
        v.as_object().cloned().unwrap()
    }

    fn page() -> Attributes {
        attrs(json!({"type": "page", "parentId": "f1", "name": "Draft"}))
    }

    fn set(key: &'static str, value: Value) -> impl FnOnce(Attributes) -> Result<Attributes> {
        move |mut a| {
            a.insert(key.to_string(), value);
            Ok(a)
        }
    }

    #[test]
    fn test_create_validates() {
        let engine = MergeEngine::default();
        let created = engine.create_node(&page()).unwrap();
        assert_eq!(created.merged.attributes, page());
        assert_eq!(created.delta, created.merged.state);

        let invalid = attrs(json!({"type": "page", "parentId": "f1"}));
        assert!(matches!(
            engine.create_node(&invalid),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let engine = MergeEngine::default();
        let base = engine.create_node(&page()).unwrap().merged.state;
        let none: [&[u8]; 0] = [];

        let a = engine
            .edit_node(&base, &none, set("name", json!("Renamed")))
            .unwrap();
        let b = engine
            .edit_node(&base, &none, set("index", json!("a0")))
            .unwrap();

        let ab = engine.merge_node(&base, &[&a.delta, &b.delta]).unwrap();
        let ba = engine.merge_node(&base, &[&b.delta, &a.delta]).unwrap();
        assert_eq!(ab.attributes, ba.attributes);
        assert_eq!(ab.attributes["name"], json!("Renamed"));
        assert_eq!(ab.attributes["index"], json!("a0"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let engine = MergeEngine::default();
        let base = engine.create_node(&page()).unwrap().merged.state;
        let edit = engine
            .edit_node(&base, &[] as &[Vec<u8>], set("name", json!("Once")))
            .unwrap();
        let once = engine.merge_node(&base, &[&edit.delta]).unwrap();
        let twice = engine
            .merge_node(&base, &[&edit.delta, &edit.delta])
            .unwrap();
        assert_eq!(once.attributes, twice.attributes);
        let again = engine.merge_node(&once.state, &[&edit.delta]).unwrap();
        assert_eq!(again.attributes, once.attributes);
    }

    #[test]
    fn test_invalid_edit_is_rejected() {
        let engine = MergeEngine::default();
        let base = engine.create_node(&page()).unwrap().merged.state;
        let none: [&[u8]; 0] = [];
        let err = engine
            .edit_node(&base, &none, set("name", json!(42)))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = engine
            .edit_node(&base, &none, set("type", json!("folder")))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_pending_updates_are_replayed() {
        let engine = MergeEngine::default();
        let base = engine.create_node(&page()).unwrap().merged.state;
        let first = engine
            .edit_node(&base, &[] as &[Vec<u8>], set("name", json!("One")))
            .unwrap();
        let second = engine
            .edit_node(&base, &[first.delta.clone()], set("index", json!("b")))
            .unwrap();
        let projected = engine
            .project(&base, &[first.delta, second.delta])
            .unwrap();
        assert_eq!(projected["name"], json!("One"));
        assert_eq!(projected["index"], json!("b"));
    }

    #[test]
    fn test_document_edits() {
        let engine = MergeEngine::default();
        let edit = engine
            .edit_document(&[], &[] as &[Vec<u8>], set("content", json!({"text": "hi"})))
            .unwrap();
        let merged = engine.merge_document(&[], &[&edit.delta]).unwrap();
        assert_eq!(merged.attributes["content"], json!({"text": "hi"}));
        assert!(engine
            .edit_document(&[], &[] as &[Vec<u8>], Ok)
            .is_err());
    }
}
