//! Thin wrapper over a yrs document holding a flat attribute map.
//!
//! Each top-level attribute is stored as a JSON string under its key in the
//! `attributes` Y.Map, so concurrent edits of *different* keys merge
//! cleanly while edits of the same key resolve by yrs' map semantics.

use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use crate::error::{Result, SyncError};
use crate::model::Attributes;

/// Name of the root map inside every node/document CRDT.
pub const ATTRIBUTES_MAP: &str = "attributes";

/// A working, in-memory CRDT document. Never persisted directly; callers
/// encode it back to bytes and drop it.
pub struct AttributeDoc {
    doc: Doc,
    map: MapRef,
}

impl AttributeDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let map = doc.get_or_insert_map(ATTRIBUTES_MAP);
        Self { doc, map }
    }

    /// Rebuild a document from an encoded snapshot (empty means blank).
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let doc = Self::new();
        if !state.is_empty() {
            doc.apply(state)?;
        }
        Ok(doc)
    }

    /// Apply an encoded v1 update. Re-applying a known update is a no-op.
    pub fn apply(&self, update: &[u8]) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Decode the document into plain data.
    pub fn projection(&self) -> Attributes {
        let txn = self.doc.transact();
        let mut out = Attributes::new();
        for (key, value) in self.map.iter(&txn) {
            let raw = value.to_string(&txn);
            let parsed = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            out.insert(key.to_string(), parsed);
        }
        out
    }

    /// Make the document's projection equal `target`, touching only the keys
    /// that differ. Returns the encoded delta (empty if nothing changed).
    pub fn write(&self, target: &Attributes) -> Result<Vec<u8>> {
        let current = self.projection();
        let before = self.state_vector();
        let mut changed = false;
        {
            let mut txn = self.doc.transact_mut();
            for key in current.keys() {
                if target.get(key).is_none_or(Value::is_null) {
                    self.map.remove(&mut txn, key);
                    changed = true;
                }
            }
            for (key, value) in target {
                if value.is_null() || current.get(key) == Some(value) {
                    continue;
                }
                let json = serde_json::to_string(value)?;
                self.map.insert(&mut txn, key.as_str(), json);
                changed = true;
            }
        }
        // an untouched document still diffs to its full delete set
        if !changed {
            return Ok(Vec::new());
        }
        Ok(self.diff_since(&before))
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encode everything the given state vector has not seen.
    pub fn diff_since(&self, state_vector: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        let update = txn.encode_state_as_update_v1(state_vector);
        if update == Self::empty_update() {
            Vec::new()
        } else {
            update
        }
    }

    /// Encode the full document as a single self-contained snapshot.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn empty_update() -> Vec<u8> {
        // v1 encoding of an update with no structs and an empty delete set
        vec![0, 0]
    }
}

impl Default for AttributeDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Combine several encoded updates into one equivalent update.
pub fn merge_deltas(deltas: &[Vec<u8>]) -> Result<Vec<u8>> {
    let slices: Vec<&[u8]> = deltas
        .iter()
        .filter(|d| !d.is_empty())
        .map(Vec::as_slice)
        .collect();
    match slices.len() {
        0 => Ok(Vec::new()),
        1 => Ok(slices[0].to_vec()),
        _ => yrs::merge_updates_v1(slices.as_slice())
            .map_err(|e| SyncError::Crdt(format!("Failed to merge updates: {}", e))),
    }
}
