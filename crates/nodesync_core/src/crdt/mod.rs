//! CRDT merge engine.
//!
//! Entity state is an encoded yrs document; its plain-data projection is
//! derived on every write and validated against the [`SchemaRegistry`].

mod document;
mod merge;
mod schema;

pub use document::{ATTRIBUTES_MAP, AttributeDoc, merge_deltas};
pub use merge::{LocalEdit, MergeEngine, Merged};
pub use schema::{FieldKind, FieldSpec, NodeSchema, SchemaRegistry};
