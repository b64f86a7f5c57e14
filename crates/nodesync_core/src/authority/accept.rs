//! Accepting pushed mutations.
//!
//! Every mutation is decided on its own: merge, permission check against
//! the ancestry index, then a revision compare-and-swap. A rejected
//! mutation leaves no trace; an accepted one commits its entity change, its
//! change-log rows and its applied marker in one transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{Connection, params};

use super::changes::{ChangeNotifier, append_change, changes_since};
use super::store::{AuthorityStore, UpdateLog, append_update, delete_updates, is_applied, mark_applied};
use crate::ancestry;
use crate::crdt::{MergeEngine, Merged};
use crate::encoding::now_millis;
use crate::error::{Result, SyncError};
use crate::model::{
    ChangeBatch, ChangePayload, ConsumerKey, CreateNodePayload, DeleteNodePayload, Document,
    InteractionPayload, Mutation, MutationPayload, MutationResult, Node, NodeInteraction,
    NodeReaction, ReactionPayload, UpdateDocumentPayload, UpdateNodePayload,
};
use crate::permission;
use crate::store;

/// Roots touched by a commit and the highest change id written for each.
type Touched = BTreeMap<String, i64>;

struct PreparedNodeUpdate {
    node: Node,
    merged: Merged,
    new_parent: Option<String>,
}

struct PreparedDocumentUpdate {
    root_id: String,
    current: Option<Document>,
    merged: Merged,
}

/// The authoritative store of one workspace.
pub struct Authority {
    store: Arc<AuthorityStore>,
    engine: MergeEngine,
    notifier: ChangeNotifier,
    cas_retries: u32,
}

impl Authority {
    pub fn new(store: Arc<AuthorityStore>, engine: MergeEngine, cas_retries: u32) -> Self {
        Self {
            store,
            engine,
            notifier: ChangeNotifier::default(),
            cas_retries: cas_retries.max(1),
        }
    }

    pub fn store(&self) -> &Arc<AuthorityStore> {
        &self.store
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.store.with_conn(|c| store::get_node(c, id))
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.store.with_conn(|c| store::get_document(c, id))
    }

    pub fn ancestors(&self, id: &str) -> Result<Vec<Node>> {
        self.store.with_conn(|c| ancestry::ancestors_of(c, id))
    }

    /// Decide every mutation in `mutations` for `actor_id`.
    ///
    /// Always returns one result per input, in input order. Mutations that
    /// were already applied are reported as accepted again.
    pub fn push_mutations(&self, actor_id: &str, mutations: Vec<Mutation>) -> Vec<MutationResult> {
        let mut results = Vec::with_capacity(mutations.len());
        for mutation in &mutations {
            let result = match self.accept(actor_id, mutation) {
                Ok(touched) => {
                    for (root_id, cursor) in touched {
                        self.notifier.notify(&root_id, cursor);
                    }
                    MutationResult::accepted(&mutation.id)
                }
                Err(e) => {
                    log::debug!(
                        "rejected {} {} from {}: {}",
                        mutation.mutation_type(),
                        mutation.id,
                        actor_id,
                        e
                    );
                    MutationResult::rejected(&mutation.id, e.reject_reason(), e.to_string())
                }
            };
            results.push(result);
        }
        let accepted = results.iter().filter(|r| r.is_accepted()).count();
        log::info!(
            "push from {}: {} mutations, {} accepted",
            actor_id,
            results.len(),
            accepted
        );
        results
    }

    fn accept(&self, actor_id: &str, mutation: &Mutation) -> Result<Touched> {
        if mutation.actor_id != actor_id {
            return Err(SyncError::Permission(format!(
                "mutation {} was issued by another actor",
                mutation.id
            )));
        }
        if self.store.with_conn(|c| is_applied(c, &mutation.id))? {
            return Ok(Touched::new());
        }
        match &mutation.payload {
            MutationPayload::CreateNode(p) => self.create_node(mutation, p),
            MutationPayload::UpdateNode(p) => self.update_node(mutation, p),
            MutationPayload::DeleteNode(p) => self.delete_node(mutation, p),
            MutationPayload::UpdateDocument(p) => self.update_document(mutation, p),
            MutationPayload::CreateReaction(p) => self.write_reaction(mutation, p, true),
            MutationPayload::DeleteReaction(p) => self.write_reaction(mutation, p, false),
            MutationPayload::MarkSeen(p) => self.write_interaction(mutation, p, false),
            MutationPayload::MarkOpened(p) => self.write_interaction(mutation, p, true),
        }
    }

    // ==================== Nodes ====================

    fn create_node(&self, mutation: &Mutation, payload: &CreateNodePayload) -> Result<Touched> {
        let actor_id = &mutation.actor_id;
        self.store.with_tx(|tx| {
            if store::get_node(tx, &payload.node_id)?.is_some() {
                return Err(SyncError::Validation(format!(
                    "node {} already exists",
                    payload.node_id
                )));
            }
            let chain = match &payload.parent_id {
                Some(parent) => {
                    let chain = ancestry::ancestors_of(tx, parent)?;
                    let parent_node = chain
                        .last()
                        .ok_or_else(|| SyncError::NotFound(format!("parent {}", parent)))?;
                    if parent_node.root_id != payload.root_id {
                        return Err(SyncError::Validation("root does not match parent".into()));
                    }
                    chain
                }
                None if payload.root_id == payload.node_id => Vec::new(),
                None => {
                    return Err(SyncError::Validation(
                        "a root node must be its own root".into(),
                    ));
                }
            };

            let merged = self.engine.merge_node(&[], &[&payload.state])?;
            if self.engine.node_type_of(&merged.attributes)? != payload.node_type {
                return Err(SyncError::Validation("type does not match state".into()));
            }
            let declared_parent = merged.attributes.get("parentId").and_then(|v| v.as_str());
            if declared_parent != payload.parent_id.as_deref() {
                return Err(SyncError::Validation("parentId does not match state".into()));
            }
            permission::check_create(
                self.engine.schemas(),
                &chain,
                actor_id,
                payload.node_type,
                &merged.attributes,
            )?;

            let now = now_millis();
            let node = Node {
                id: payload.node_id.clone(),
                node_type: payload.node_type,
                parent_id: payload.parent_id.clone(),
                root_id: payload.root_id.clone(),
                attributes: merged.attributes,
                state: merged.state,
                revision: 0,
                created_at: payload.created_at,
                created_by: actor_id.clone(),
                updated_at: None,
                updated_by: None,
                server_created_at: Some(now),
                server_updated_at: None,
            };
            store::upsert_node(tx, &node)?;
            ancestry::insert_node(tx, &node.id, node.parent_id.as_deref())?;
            append_update(tx, UpdateLog::Node, &node.id, &mutation.id, &payload.state)?;
            let cursor = append_change(
                tx,
                &node.root_id,
                &ChangePayload::NodeUpserted {
                    node: node.clone(),
                    update_ids: Vec::new(),
                },
            )?;
            mark_applied(tx, &mutation.id, actor_id)?;
            Ok(Touched::from([(node.root_id, cursor)]))
        })
    }

    fn update_node(&self, mutation: &Mutation, payload: &UpdateNodePayload) -> Result<Touched> {
        let mut expected = payload.base_revision;
        for attempt in 0..self.cas_retries {
            let prepared = self.prepare_node_update(&mutation.actor_id, payload)?;
            if attempt > 0 {
                expected = prepared.node.revision;
            }
            if let Some(touched) = self.commit_node_update(mutation, payload, &prepared, expected)? {
                if attempt > 0 {
                    log::debug!(
                        "update {} of {} accepted after {} retries",
                        mutation.id,
                        payload.node_id,
                        attempt
                    );
                }
                return Ok(touched);
            }
        }
        Err(SyncError::ConcurrencyConflict {
            id: payload.node_id.clone(),
            expected,
        })
    }

    fn prepare_node_update(&self, actor_id: &str, payload: &UpdateNodePayload) -> Result<PreparedNodeUpdate> {
        self.store.with_conn(|conn| {
            let chain = ancestry::ancestors_of(conn, &payload.node_id)?;
            let node = chain
                .last()
                .cloned()
                .ok_or_else(|| SyncError::NotFound(payload.node_id.clone()))?;
            permission::check_update(&chain, actor_id)?;

            let merged = self.engine.merge_node(&node.state, &[&payload.data])?;
            if merged.attributes.get("type") != node.attributes.get("type") {
                return Err(SyncError::Validation("node type cannot change".into()));
            }
            let new_parent = match merged.attributes.get("parentId").and_then(|v| v.as_str()) {
                Some(parent) if node.parent_id.as_deref() != Some(parent) => {
                    self.check_move(conn, &node, parent, actor_id, &merged)?;
                    Some(parent.to_string())
                }
                _ => None,
            };
            Ok(PreparedNodeUpdate {
                node,
                merged,
                new_parent,
            })
        })
    }

    fn check_move(&self, conn: &Connection, node: &Node, parent: &str, actor_id: &str, merged: &Merged) -> Result<()> {
        let target_chain = ancestry::ancestors_of(conn, parent)?;
        let target = target_chain
            .last()
            .ok_or_else(|| SyncError::NotFound(format!("parent {}", parent)))?;
        if target.root_id != node.root_id {
            return Err(SyncError::Validation("nodes cannot move between roots".into()));
        }
        if target_chain.iter().any(|n| n.id == node.id) {
            return Err(SyncError::Validation(format!(
                "cannot move {} under its own descendant {}",
                node.id, parent
            )));
        }
        permission::check_create(
            self.engine.schemas(),
            &target_chain,
            actor_id,
            node.node_type,
            &merged.attributes,
        )
    }

    /// Returns `None` when the stored revision no longer matches `expected`.
    fn commit_node_update(
        &self,
        mutation: &Mutation,
        payload: &UpdateNodePayload,
        prepared: &PreparedNodeUpdate,
        expected: i64,
    ) -> Result<Option<Touched>> {
        let node = &prepared.node;
        let now = now_millis();
        self.store.with_tx(|tx| {
            let parent_id = prepared
                .new_parent
                .clone()
                .or_else(|| node.parent_id.clone());
            let rows = tx.execute(
                "UPDATE nodes SET attributes = ?1, state = ?2, parent_id = ?3,
                    revision = revision + 1, updated_at = ?4, updated_by = ?5, server_updated_at = ?6
                 WHERE id = ?7 AND revision = ?8",
                params![
                    serde_json::to_string(&prepared.merged.attributes)?,
                    prepared.merged.state,
                    parent_id,
                    payload.created_at,
                    mutation.actor_id,
                    now,
                    node.id,
                    expected
                ],
            )?;
            if rows == 0 {
                return Ok(None);
            }
            if let Some(parent) = &prepared.new_parent {
                ancestry::reparent(tx, &node.id, parent)?;
            }
            append_update(tx, UpdateLog::Node, &node.id, &mutation.id, &payload.data)?;
            let stored = store::get_node(tx, &node.id)?
                .ok_or_else(|| SyncError::NotFound(node.id.clone()))?;
            let cursor = append_change(
                tx,
                &stored.root_id,
                &ChangePayload::NodeUpserted {
                    node: stored.clone(),
                    update_ids: payload.update_ids.clone(),
                },
            )?;
            mark_applied(tx, &mutation.id, &mutation.actor_id)?;
            Ok(Some(Touched::from([(stored.root_id, cursor)])))
        })
    }

    fn delete_node(&self, mutation: &Mutation, payload: &DeleteNodePayload) -> Result<Touched> {
        self.store.with_tx(|tx| {
            let chain = ancestry::ancestors_of(tx, &payload.node_id)?;
            let Some(node) = chain.last() else {
                // already gone
                mark_applied(tx, &mutation.id, &mutation.actor_id)?;
                return Ok(Touched::new());
            };
            permission::check_delete(&chain, &mutation.actor_id)?;

            let root_id = node.root_id.clone();
            let mut ids = ancestry::descendants_of(tx, &payload.node_id)?;
            ids.push(payload.node_id.clone());
            let mut cursor = 0;
            for id in &ids {
                tx.execute("DELETE FROM nodes WHERE id = ?", params![id])?;
                store::delete_node_satellites(tx, id)?;
                delete_updates(tx, UpdateLog::Node, id)?;
                delete_updates(tx, UpdateLog::Document, id)?;
                ancestry::delete_node(tx, id)?;
                cursor = append_change(
                    tx,
                    &root_id,
                    &ChangePayload::NodeDeleted {
                        node_id: id.clone(),
                        deleted_at: payload.deleted_at,
                    },
                )?;
            }
            mark_applied(tx, &mutation.id, &mutation.actor_id)?;
            log::debug!("deleted {} ({} nodes)", payload.node_id, ids.len());
            Ok(Touched::from([(root_id, cursor)]))
        })
    }

    // ==================== Documents ====================

    fn update_document(&self, mutation: &Mutation, payload: &UpdateDocumentPayload) -> Result<Touched> {
        let mut expected = payload.base_revision;
        for attempt in 0..self.cas_retries {
            let prepared = self.prepare_document_update(&mutation.actor_id, payload)?;
            if attempt > 0 {
                expected = prepared.current.as_ref().map_or(0, |d| d.revision);
            }
            if let Some(touched) = self.commit_document_update(mutation, payload, &prepared, expected)? {
                return Ok(touched);
            }
        }
        Err(SyncError::ConcurrencyConflict {
            id: payload.document_id.clone(),
            expected,
        })
    }

    fn prepare_document_update(
        &self,
        actor_id: &str,
        payload: &UpdateDocumentPayload,
    ) -> Result<PreparedDocumentUpdate> {
        self.store.with_conn(|conn| {
            let chain = ancestry::ancestors_of(conn, &payload.document_id)?;
            let node = chain
                .last()
                .ok_or_else(|| SyncError::NotFound(payload.document_id.clone()))?;
            if !self.engine.schemas().get(node.node_type)?.has_document {
                return Err(SyncError::Validation(format!(
                    "{} nodes have no document",
                    node.node_type
                )));
            }
            permission::check_document_edit(&chain, actor_id)?;

            let current = store::get_document(conn, &payload.document_id)?;
            let base = current.as_ref().map(|d| d.state.as_slice()).unwrap_or(&[]);
            let merged = self.engine.merge_document(base, &[&payload.data])?;
            Ok(PreparedDocumentUpdate {
                root_id: node.root_id.clone(),
                current,
                merged,
            })
        })
    }

    fn commit_document_update(
        &self,
        mutation: &Mutation,
        payload: &UpdateDocumentPayload,
        prepared: &PreparedDocumentUpdate,
        expected: i64,
    ) -> Result<Option<Touched>> {
        let content = serde_json::to_string(&prepared.merged.attributes)?;
        self.store.with_tx(|tx| {
            let rows = if expected == 0 {
                tx.execute(
                    "INSERT OR IGNORE INTO documents
                        (id, root_id, content, state, revision, created_at, created_by, updated_at, updated_by)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?5, ?6)",
                    params![
                        payload.document_id,
                        prepared.root_id,
                        content,
                        prepared.merged.state,
                        payload.created_at,
                        mutation.actor_id
                    ],
                )?
            } else {
                tx.execute(
                    "UPDATE documents SET content = ?1, state = ?2, revision = revision + 1,
                        updated_at = ?3, updated_by = ?4
                     WHERE id = ?5 AND revision = ?6",
                    params![
                        content,
                        prepared.merged.state,
                        payload.created_at,
                        mutation.actor_id,
                        payload.document_id,
                        expected
                    ],
                )?
            };
            if rows == 0 {
                return Ok(None);
            }
            append_update(tx, UpdateLog::Document, &payload.document_id, &mutation.id, &payload.data)?;
            let document = store::get_document(tx, &payload.document_id)?
                .ok_or_else(|| SyncError::NotFound(payload.document_id.clone()))?;
            let cursor = append_change(
                tx,
                &prepared.root_id,
                &ChangePayload::DocumentUpdated {
                    document,
                    update_ids: payload.update_ids.clone(),
                },
            )?;
            mark_applied(tx, &mutation.id, &mutation.actor_id)?;
            Ok(Some(Touched::from([(prepared.root_id.clone(), cursor)])))
        })
    }

    // ==================== Reactions & interactions ====================

    fn write_reaction(&self, mutation: &Mutation, payload: &ReactionPayload, create: bool) -> Result<Touched> {
        let actor_id = &mutation.actor_id;
        self.store.with_tx(|tx| {
            let chain = ancestry::ancestors_of(tx, &payload.node_id)?;
            let node = chain
                .last()
                .ok_or_else(|| SyncError::NotFound(payload.node_id.clone()))?;
            permission::check_view(&chain, actor_id)?;

            let existing = store::get_reaction(tx, &payload.node_id, actor_id, &payload.reaction)?;
            if !create && existing.as_ref().is_none_or(|r| r.deleted_at.is_some()) {
                mark_applied(tx, &mutation.id, actor_id)?;
                return Ok(Touched::new());
            }
            let reaction = NodeReaction {
                node_id: payload.node_id.clone(),
                collaborator_id: actor_id.clone(),
                reaction: payload.reaction.clone(),
                root_id: node.root_id.clone(),
                revision: existing.as_ref().map_or(1, |r| r.revision + 1),
                created_at: if create {
                    payload.created_at
                } else {
                    existing.as_ref().map_or(payload.created_at, |r| r.created_at)
                },
                deleted_at: (!create).then_some(payload.created_at),
            };
            store::upsert_reaction(tx, &reaction)?;
            let cursor = append_change(tx, &node.root_id, &ChangePayload::ReactionUpserted { reaction })?;
            mark_applied(tx, &mutation.id, actor_id)?;
            Ok(Touched::from([(node.root_id.clone(), cursor)]))
        })
    }

    fn write_interaction(&self, mutation: &Mutation, payload: &InteractionPayload, opened: bool) -> Result<Touched> {
        let actor_id = &mutation.actor_id;
        self.store.with_tx(|tx| {
            let chain = ancestry::ancestors_of(tx, &payload.node_id)?;
            let node = chain
                .last()
                .ok_or_else(|| SyncError::NotFound(payload.node_id.clone()))?;
            permission::check_view(&chain, actor_id)?;

            let mut interaction = store::get_interaction(tx, &payload.node_id, actor_id)?
                .unwrap_or_else(|| NodeInteraction::new(&payload.node_id, actor_id, &node.root_id));
            if opened {
                interaction.opened(payload.at);
            } else {
                interaction.seen(payload.at);
            }
            interaction.revision += 1;
            store::upsert_interaction(tx, &interaction)?;
            let cursor = append_change(
                tx,
                &node.root_id,
                &ChangePayload::InteractionUpserted { interaction },
            )?;
            mark_applied(tx, &mutation.id, actor_id)?;
            Ok(Touched::from([(node.root_id.clone(), cursor)]))
        })
    }

    // ==================== Reads for consumers ====================

    /// The batch a consumer would receive after `cursor`, for `actor_id`.
    pub fn pull_changes(
        &self,
        actor_id: &str,
        key: &ConsumerKey,
        cursor: i64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        self.check_subscription(actor_id, &key.root_id)?;
        let changes = self.changes_since(key, cursor, limit)?;
        let next = changes.last().map_or(cursor, |c| c.id);
        Ok(ChangeBatch {
            consumer_key: key.to_string(),
            changes,
            cursor: next,
        })
    }

    pub(crate) fn changes_since(&self, key: &ConsumerKey, cursor: i64, limit: usize) -> Result<Vec<crate::model::Change>> {
        self.store
            .with_conn(|c| changes_since(c, &key.root_id, key.consumer_type, cursor, limit.max(1)))
    }

    /// `actor_id` may read the streams of `root_id`.
    pub fn check_subscription(&self, actor_id: &str, root_id: &str) -> Result<()> {
        let chain = self.ancestors(root_id)?;
        if chain.is_empty() {
            return Err(SyncError::NotFound(format!("root {}", root_id)));
        }
        permission::check_view(&chain, actor_id)
    }

    /// Trim the update logs to the newest `keep` deltas per entity.
    pub fn compact_update_log(&self, keep: usize) -> Result<usize> {
        self.store.with_tx(|tx| {
            let nodes = super::store::trim_updates(tx, UpdateLog::Node, keep)?;
            let documents = super::store::trim_updates(tx, UpdateLog::Document, keep)?;
            Ok(nodes + documents)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, ConsumerType, MutationStatus, NodeType, RejectReason};
    use serde_json::json;

    fn authority() -> Authority {
        Authority::new(
            Arc::new(AuthorityStore::in_memory().unwrap()),
            MergeEngine::default(),
            5,
        )
    }

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().cloned().unwrap()
    }

    fn create(actor: &str, id: &str, root: &str, parent: Option<&str>, a: serde_json::Value) -> Mutation {
        let engine = MergeEngine::default();
        let a = attrs(a);
        let node_type = engine.node_type_of(&a).unwrap();
        Mutation::new(
            actor,
            MutationPayload::CreateNode(CreateNodePayload {
                node_id: id.into(),
                root_id: root.into(),
                parent_id: parent.map(String::from),
                node_type,
                state: engine.create_node(&a).unwrap().delta,
                created_at: 1,
            }),
        )
    }

    fn update(actor: &str, authority: &Authority, id: &str, base: i64, key: &str, value: serde_json::Value) -> Mutation {
        let node = authority.get_node(id).unwrap().unwrap();
        let key = key.to_string();
        let edit = authority
            .engine()
            .edit_node(&node.state, &[] as &[Vec<u8>], move |mut a| {
                a.insert(key, value);
                Ok(a)
            })
            .unwrap();
        Mutation::new(
            actor,
            MutationPayload::UpdateNode(UpdateNodePayload {
                node_id: id.into(),
                root_id: node.root_id,
                update_ids: vec![format!("u-{}", base)],
                data: edit.delta,
                base_revision: base,
                created_at: 2,
            }),
        )
    }

    fn seed(authority: &Authority) {
        let results = authority.push_mutations(
            "u1",
            vec![
                create(
                    "u1",
                    "s",
                    "s",
                    None,
                    json!({"type": "space", "name": "S", "collaborators": {"u1": "admin", "u2": "viewer", "u3": "editor"}}),
                ),
                create("u1", "p", "s", Some("s"), json!({"type": "page", "parentId": "s", "name": "P"})),
            ],
        );
        assert!(results.iter().all(|r| r.is_accepted()), "{:?}", results);
    }

    #[test]
    fn test_create_writes_change_and_ancestry() {
        let authority = authority();
        seed(&authority);
        let page = authority.get_node("p").unwrap().unwrap();
        assert_eq!(page.revision, 0);
        assert!(page.server_created_at.is_some());
        let chain: Vec<String> = authority.ancestors("p").unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(chain, vec!["s".to_string(), "p".to_string()]);

        let batch = authority
            .pull_changes("u2", &ConsumerKey::new(ConsumerType::Nodes, "s"), 0, 10)
            .unwrap();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.cursor, batch.changes[1].id);
    }

    #[test]
    fn test_repeated_push_is_idempotent() {
        let authority = authority();
        seed(&authority);
        let m = update("u1", &authority, "p", 0, "name", json!("Q"));
        assert!(authority.push_mutations("u1", vec![m.clone()])[0].is_accepted());
        assert!(authority.push_mutations("u1", vec![m])[0].is_accepted());
        assert_eq!(authority.get_node("p").unwrap().unwrap().revision, 1);
    }

    #[test]
    fn test_stale_base_is_remerged() {
        let authority = authority();
        seed(&authority);
        let a = update("u1", &authority, "p", 0, "name", json!("Renamed"));
        let b = update("u3", &authority, "p", 0, "avatar", json!("cat"));
        assert!(authority.push_mutations("u1", vec![a])[0].is_accepted());
        assert!(authority.push_mutations("u3", vec![b])[0].is_accepted());

        let page = authority.get_node("p").unwrap().unwrap();
        assert_eq!(page.revision, 2);
        assert_eq!(page.attributes["name"], json!("Renamed"));
        assert_eq!(page.attributes["avatar"], json!("cat"));
    }

    #[test]
    fn test_interleaved_commit_loses_cas() {
        let authority = authority();
        seed(&authority);
        let m1 = update("u1", &authority, "p", 0, "name", json!("One"));
        let m2 = update("u1", &authority, "p", 0, "name", json!("Two"));
        let (MutationPayload::UpdateNode(p1), MutationPayload::UpdateNode(p2)) = (&m1.payload, &m2.payload) else {
            panic!("expected updates");
        };

        let first = authority.prepare_node_update("u1", p1).unwrap();
        let second = authority.prepare_node_update("u1", p2).unwrap();
        assert!(authority.commit_node_update(&m1, p1, &first, 0).unwrap().is_some());
        assert!(authority.commit_node_update(&m2, p2, &second, 0).unwrap().is_none());

        // the loser goes through the retry loop
        assert!(authority.push_mutations("u1", vec![m2])[0].is_accepted());
        assert_eq!(authority.get_node("p").unwrap().unwrap().revision, 2);
    }

    #[test]
    fn test_rejections_leave_no_change() {
        let authority = authority();
        seed(&authority);
        let key = ConsumerKey::new(ConsumerType::Nodes, "s");
        let before = authority.pull_changes("u1", &key, 0, 100).unwrap().changes.len();

        let viewer_edit = update("u2", &authority, "p", 0, "name", json!("X"));
        let result = &authority.push_mutations("u2", vec![viewer_edit])[0];
        assert!(matches!(
            result.result,
            MutationStatus::Rejected {
                reason: RejectReason::Permission,
                ..
            }
        ));

        let orphan = create("u1", "x", "s", Some("missing"), json!({"type": "page", "parentId": "missing", "name": "X"}));
        let result = &authority.push_mutations("u1", vec![orphan])[0];
        assert!(matches!(
            result.result,
            MutationStatus::Rejected {
                reason: RejectReason::NotFound,
                ..
            }
        ));

        let forged = update("u1", &authority, "p", 0, "name", json!("Y"));
        assert!(!authority.push_mutations("u3", vec![forged])[0].is_accepted());

        let after = authority.pull_changes("u1", &key, 0, 100).unwrap().changes.len();
        assert_eq!(before, after);
        assert_eq!(authority.get_node("p").unwrap().unwrap().revision, 0);
    }

    #[test]
    fn test_delete_emits_change_per_node() {
        let authority = authority();
        seed(&authority);
        authority.push_mutations(
            "u1",
            vec![create("u1", "c", "s", Some("p"), json!({"type": "page", "parentId": "p", "name": "C"}))],
        );
        let delete = Mutation::new(
            "u1",
            MutationPayload::DeleteNode(DeleteNodePayload {
                node_id: "p".into(),
                root_id: "s".into(),
                deleted_at: 3,
            }),
        );
        assert!(authority.push_mutations("u1", vec![delete])[0].is_accepted());
        assert!(authority.get_node("c").unwrap().is_none());
        assert!(authority.ancestors("c").unwrap().is_empty());

        let key = ConsumerKey::new(ConsumerType::Nodes, "s");
        let deleted: Vec<String> = authority
            .pull_changes("u1", &key, 0, 100)
            .unwrap()
            .changes
            .into_iter()
            .filter_map(|c| match c.payload {
                ChangePayload::NodeDeleted { node_id, .. } => Some(node_id),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["c".to_string(), "p".to_string()]);

        // deleting again is a no-op
        let again = Mutation::new(
            "u1",
            MutationPayload::DeleteNode(DeleteNodePayload {
                node_id: "p".into(),
                root_id: "s".into(),
                deleted_at: 4,
            }),
        );
        assert!(authority.push_mutations("u1", vec![again])[0].is_accepted());
    }

    #[test]
    fn test_reaction_revisions_increase() {
        let authority = authority();
        seed(&authority);
        let reaction = |create: bool| {
            let payload = ReactionPayload {
                node_id: "p".into(),
                root_id: "s".into(),
                reaction: "+1".into(),
                created_at: 5,
            };
            Mutation::new(
                "u2",
                if create {
                    MutationPayload::CreateReaction(payload)
                } else {
                    MutationPayload::DeleteReaction(payload)
                },
            )
        };
        authority.push_mutations("u2", vec![reaction(true), reaction(false), reaction(true)]);
        let stored = authority
            .store()
            .with_conn(|c| store::get_reaction(c, "p", "u2", "+1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.revision, 3);
        assert!(stored.deleted_at.is_none());
    }

    #[test]
    fn test_compaction_trims_update_log() {
        let authority = authority();
        seed(&authority);
        for base in 0..3 {
            let m = update("u1", &authority, "p", base, "name", json!(format!("v{}", base)));
            authority.push_mutations("u1", vec![m]);
        }
        assert!(authority.compact_update_log(1).unwrap() >= 3);
        assert_eq!(authority.get_node("p").unwrap().unwrap().attributes["name"], json!("v2"));
    }
}
