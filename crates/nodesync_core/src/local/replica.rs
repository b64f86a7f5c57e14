//! Local replica operations.
//!
//! Every write runs the permission check against the local ancestry index,
//! derives the new state through the merge engine, and persists the entity
//! change together with its outbox mutation in one transaction.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};

use super::outbox;
use super::store::{
    self as local, LocalStore, PendingKind, PendingUpdate, TombstoneRecord, get_cursor,
    set_cursor,
};
use crate::ancestry;
use crate::crdt::{LocalEdit, MergeEngine};
use crate::encoding::{generate_id, now_millis};
use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::model::{
    Attributes, Change, ChangeBatch, ChangePayload, ConsumerKey, ConsumerType, CreateNodePayload,
    DeleteNodePayload, Document, InteractionPayload, Mutation, MutationPayload, Node,
    NodeInteraction, NodeReaction, NodeType, ReactionPayload, UpdateDocumentPayload,
    UpdateNodePayload,
};
use crate::permission;
use crate::store;

/// Result of the read half of a local node update.
pub(crate) struct PreparedNodeUpdate {
    node: Node,
    local_revision: i64,
    edit: LocalEdit,
    new_parent: Option<String>,
}

pub(crate) struct PreparedDocumentUpdate {
    node: Node,
    document: Option<Document>,
    local_revision: Option<i64>,
    edit: LocalEdit,
}

/// Entry point for local reads and writes on one replica.
pub struct Replica {
    store: Arc<LocalStore>,
    engine: MergeEngine,
    events: EventBus,
    update_retries: u32,
}

impl Replica {
    pub fn new(
        store: Arc<LocalStore>,
        engine: MergeEngine,
        events: EventBus,
        update_retries: u32,
    ) -> Self {
        Self {
            store,
            engine,
            events,
            update_retries: update_retries.max(1),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn emit_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn queued(mutation: &Mutation) -> EngineEvent {
        EngineEvent::MutationQueued {
            mutation_id: mutation.id.clone(),
            mutation_type: mutation.mutation_type(),
        }
    }

    // ==================== Reads ====================

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.store.with_conn(|c| store::get_node(c, id))
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.store.with_conn(|c| store::get_document(c, id))
    }

    /// Ancestors of a node including itself, root first.
    pub fn ancestors(&self, id: &str) -> Result<Vec<Node>> {
        self.store.with_conn(|c| ancestry::ancestors_of(c, id))
    }

    pub fn nodes_in_root(&self, root_id: &str) -> Result<Vec<Node>> {
        self.store.with_conn(|c| store::list_nodes_in_root(c, root_id))
    }

    pub fn reactions(&self, node_id: &str) -> Result<Vec<NodeReaction>> {
        self.store.with_conn(|c| store::list_reactions(c, node_id))
    }

    pub fn interaction(&self, node_id: &str, actor_id: &str) -> Result<Option<NodeInteraction>> {
        self.store
            .with_conn(|c| store::get_interaction(c, node_id, actor_id))
    }

    pub fn root_ids(&self) -> Result<Vec<String>> {
        self.store.with_conn(local::root_ids)
    }

    /// Last change id applied for a consumer key (`type:root`).
    pub fn cursor(&self, consumer_key: &str) -> Result<i64> {
        self.store.with_conn(|c| get_cursor(c, consumer_key))
    }

    /// Start tracking a root shared by someone else. Its consumers are
    /// initialized on the next consumer sync.
    pub fn follow_root(&self, root_id: &str) -> Result<()> {
        self.store.with_tx(|tx| {
            for consumer_type in ConsumerType::ALL {
                set_cursor(tx, &ConsumerKey::new(consumer_type, root_id).to_string(), 0)?;
            }
            Ok(())
        })
    }

    // ==================== Nodes ====================

    /// Create a node and queue its creation. Returns the new id.
    ///
    /// `type` and `parentId` are set from the arguments; roots must grant
    /// `actor_id` the admin role in their `collaborators` attribute.
    pub fn create_node(
        &self,
        actor_id: &str,
        node_type: NodeType,
        mut attributes: Attributes,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let id = generate_id();
        let now = now_millis();
        attributes.insert("type".into(), node_type.as_str().into());
        match parent_id {
            Some(parent) => attributes.insert("parentId".into(), parent.into()),
            None => attributes.remove("parentId"),
        };

        let (mutation, root_id) = self.store.with_tx(|tx| {
            let (root_id, chain) = match parent_id {
                Some(parent) => {
                    let chain = ancestry::ancestors_of(tx, parent)?;
                    let root_id = chain
                        .last()
                        .map(|p| p.root_id.clone())
                        .ok_or_else(|| SyncError::NotFound(format!("parent {}", parent)))?;
                    (root_id, chain)
                }
                None => (id.clone(), Vec::new()),
            };
            permission::check_create(self.engine.schemas(), &chain, actor_id, node_type, &attributes)?;
            let created = self.engine.create_node(&attributes)?;

            let node = Node {
                id: id.clone(),
                node_type,
                parent_id: parent_id.map(String::from),
                root_id: root_id.clone(),
                attributes: created.merged.attributes,
                state: created.merged.state,
                revision: 0,
                created_at: now,
                created_by: actor_id.to_string(),
                updated_at: None,
                updated_by: None,
                server_created_at: None,
                server_updated_at: None,
            };
            store::upsert_node(tx, &node)?;
            ancestry::insert_node(tx, &id, parent_id)?;

            let mutation = Mutation::new(
                actor_id,
                MutationPayload::CreateNode(CreateNodePayload {
                    node_id: id.clone(),
                    root_id: root_id.clone(),
                    parent_id: parent_id.map(String::from),
                    node_type,
                    state: created.delta,
                    created_at: now,
                }),
            );
            outbox::enqueue(tx, &mutation)?;
            Ok((mutation, root_id))
        })?;

        log::debug!("created {} {} in {}", node_type, id, root_id);
        self.emit_all(vec![
            EngineEvent::NodeCreated {
                node_id: id.clone(),
                root_id,
                node_type,
            },
            Self::queued(&mutation),
        ]);
        Ok(id)
    }

    /// Read-modify-write a node's attributes.
    ///
    /// The updater sees the current projection and returns the desired one.
    /// If another local write lands between the read and the commit, the
    /// whole cycle is retried.
    pub fn update_node<F>(&self, id: &str, actor_id: &str, updater: F) -> Result<()>
    where
        F: Fn(Attributes) -> Result<Attributes>,
    {
        let mut last_seen = 0;
        for attempt in 0..self.update_retries {
            let Some(prepared) = self.prepare_node_update(id, actor_id, &updater)? else {
                return Ok(());
            };
            last_seen = prepared.local_revision;
            if let Some(mutation) = self.commit_node_update(actor_id, &prepared)? {
                self.emit_all(vec![
                    EngineEvent::NodeUpdated {
                        node_id: id.to_string(),
                        root_id: prepared.node.root_id.clone(),
                    },
                    Self::queued(&mutation),
                ]);
                return Ok(());
            }
            log::debug!("local update of {} raced (attempt {})", id, attempt + 1);
        }
        Err(SyncError::ConcurrencyConflict {
            id: id.to_string(),
            expected: last_seen,
        })
    }

    pub(crate) fn prepare_node_update<F>(
        &self,
        id: &str,
        actor_id: &str,
        updater: &F,
    ) -> Result<Option<PreparedNodeUpdate>>
    where
        F: Fn(Attributes) -> Result<Attributes>,
    {
        self.store.with_conn(|conn| {
            let node =
                store::get_node(conn, id)?.ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            let local_revision = local::local_revision(conn, "nodes", id)?
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            let chain = ancestry::ancestors_of(conn, id)?;
            permission::check_update(&chain, actor_id)?;

            let pending = pending_data(conn, id, PendingKind::Node)?;
            let edit = self.engine.edit_node(&node.state, &pending, updater)?;
            if edit.is_noop() {
                return Ok(None);
            }

            let target = edit
                .merged
                .attributes
                .get("parentId")
                .and_then(|v| v.as_str())
                .map(String::from);
            let new_parent = match target {
                Some(parent) if node.parent_id.as_deref() != Some(parent.as_str()) => {
                    let target_chain = ancestry::ancestors_of(conn, &parent)?;
                    let target_node = target_chain
                        .last()
                        .ok_or_else(|| SyncError::NotFound(format!("parent {}", parent)))?;
                    if target_node.root_id != node.root_id {
                        return Err(SyncError::Validation(
                            "nodes cannot move between roots".into(),
                        ));
                    }
                    permission::check_create(
                        self.engine.schemas(),
                        &target_chain,
                        actor_id,
                        node.node_type,
                        &edit.merged.attributes,
                    )?;
                    Some(parent)
                }
                _ => None,
            };

            Ok(Some(PreparedNodeUpdate {
                node,
                local_revision,
                edit,
                new_parent,
            }))
        })
    }

    /// Commit a prepared update if the node is still at the revision it
    /// was read at. Returns `None` if another write got there first.
    pub(crate) fn commit_node_update(
        &self,
        actor_id: &str,
        prepared: &PreparedNodeUpdate,
    ) -> Result<Option<Mutation>> {
        let node = &prepared.node;
        let now = now_millis();
        self.store.with_tx(|tx| {
            let parent_id = prepared
                .new_parent
                .clone()
                .or_else(|| node.parent_id.clone());
            let rows = tx.execute(
                "UPDATE nodes SET attributes = ?1, parent_id = ?2, updated_at = ?3, updated_by = ?4,
                    local_revision = local_revision + 1
                 WHERE id = ?5 AND local_revision = ?6",
                params![
                    serde_json::to_string(&prepared.edit.merged.attributes)?,
                    parent_id,
                    now,
                    actor_id,
                    node.id,
                    prepared.local_revision
                ],
            )?;
            if rows == 0 {
                return Ok(None);
            }
            if let Some(parent) = &prepared.new_parent {
                ancestry::reparent(tx, &node.id, parent)?;
            }

            let pending = PendingUpdate {
                id: generate_id(),
                entity_id: node.id.clone(),
                kind: PendingKind::Node,
                data: prepared.edit.delta.clone(),
                created_at: now,
            };
            local::insert_pending(tx, &pending)?;

            let mutation = Mutation::new(
                actor_id,
                MutationPayload::UpdateNode(UpdateNodePayload {
                    node_id: node.id.clone(),
                    root_id: node.root_id.clone(),
                    update_ids: vec![pending.id],
                    data: prepared.edit.delta.clone(),
                    base_revision: node.revision,
                    created_at: now,
                }),
            );
            outbox::enqueue(tx, &mutation)?;
            Ok(Some(mutation))
        })
    }

    /// Delete a node and its subtree. The removed rows are kept as
    /// tombstones until the delete settles.
    pub fn delete_node(&self, id: &str, actor_id: &str) -> Result<()> {
        let now = now_millis();
        let (mutation, removed) = self.store.with_tx(|tx| {
            let chain = ancestry::ancestors_of(tx, id)?;
            let node = chain
                .last()
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            permission::check_delete(&chain, actor_id)?;

            let mutation = Mutation::new(
                actor_id,
                MutationPayload::DeleteNode(DeleteNodePayload {
                    node_id: id.to_string(),
                    root_id: node.root_id.clone(),
                    deleted_at: now,
                }),
            );
            let removed = remove_subtree(tx, id, Some((&mutation.id, now)))?;
            outbox::enqueue(tx, &mutation)?;
            Ok((mutation, removed))
        })?;

        let mut events: Vec<EngineEvent> = removed
            .into_iter()
            .map(|n| EngineEvent::NodeDeleted {
                node_id: n.id,
                root_id: n.root_id,
            })
            .collect();
        events.push(Self::queued(&mutation));
        self.emit_all(events);
        Ok(())
    }

    // ==================== Documents ====================

    /// Read-modify-write the collaborative document owned by a node.
    pub fn update_document<F>(&self, id: &str, actor_id: &str, updater: F) -> Result<()>
    where
        F: Fn(Attributes) -> Result<Attributes>,
    {
        for attempt in 0..self.update_retries {
            let Some(prepared) = self.prepare_document_update(id, actor_id, &updater)? else {
                return Ok(());
            };
            if let Some(mutation) = self.commit_document_update(actor_id, &prepared)? {
                self.emit_all(vec![
                    EngineEvent::DocumentUpdated {
                        document_id: id.to_string(),
                        root_id: prepared.node.root_id.clone(),
                    },
                    Self::queued(&mutation),
                ]);
                return Ok(());
            }
            log::debug!("local document update of {} raced (attempt {})", id, attempt + 1);
        }
        Err(SyncError::ConcurrencyConflict {
            id: id.to_string(),
            expected: 0,
        })
    }

    fn prepare_document_update<F>(
        &self,
        id: &str,
        actor_id: &str,
        updater: &F,
    ) -> Result<Option<PreparedDocumentUpdate>>
    where
        F: Fn(Attributes) -> Result<Attributes>,
    {
        self.store.with_conn(|conn| {
            let chain = ancestry::ancestors_of(conn, id)?;
            let node = chain
                .last()
                .cloned()
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            if !self.engine.schemas().get(node.node_type)?.has_document {
                return Err(SyncError::Validation(format!(
                    "{} nodes have no document",
                    node.node_type
                )));
            }
            permission::check_document_edit(&chain, actor_id)?;

            let document = store::get_document(conn, id)?;
            let local_revision = local::local_revision(conn, "documents", id)?;
            let base = document.as_ref().map(|d| d.state.clone()).unwrap_or_default();
            let pending = pending_data(conn, id, PendingKind::Document)?;
            let edit = self.engine.edit_document(&base, &pending, updater)?;
            if edit.is_noop() {
                return Ok(None);
            }
            Ok(Some(PreparedDocumentUpdate {
                node,
                document,
                local_revision,
                edit,
            }))
        })
    }

    fn commit_document_update(
        &self,
        actor_id: &str,
        prepared: &PreparedDocumentUpdate,
    ) -> Result<Option<Mutation>> {
        let node = &prepared.node;
        let now = now_millis();
        let content = serde_json::to_string(&prepared.edit.merged.attributes)?;
        self.store.with_tx(|tx| {
            let rows = match prepared.local_revision {
                Some(local_revision) => tx.execute(
                    "UPDATE documents SET content = ?1, updated_at = ?2, updated_by = ?3,
                        local_revision = local_revision + 1
                     WHERE id = ?4 AND local_revision = ?5",
                    params![content, now, actor_id, node.id, local_revision],
                )?,
                None => tx.execute(
                    "INSERT OR IGNORE INTO documents
                        (id, root_id, content, state, revision, created_at, created_by, local_revision)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, 1)",
                    params![node.id, node.root_id, content, Vec::<u8>::new(), now, actor_id],
                )?,
            };
            if rows == 0 {
                return Ok(None);
            }

            let pending = PendingUpdate {
                id: generate_id(),
                entity_id: node.id.clone(),
                kind: PendingKind::Document,
                data: prepared.edit.delta.clone(),
                created_at: now,
            };
            local::insert_pending(tx, &pending)?;

            let mutation = Mutation::new(
                actor_id,
                MutationPayload::UpdateDocument(UpdateDocumentPayload {
                    document_id: node.id.clone(),
                    root_id: node.root_id.clone(),
                    update_ids: vec![pending.id],
                    data: prepared.edit.delta.clone(),
                    base_revision: prepared.document.as_ref().map_or(0, |d| d.revision),
                    created_at: now,
                }),
            );
            outbox::enqueue(tx, &mutation)?;
            Ok(Some(mutation))
        })
    }

    // ==================== Reactions & interactions ====================

    pub fn create_reaction(&self, node_id: &str, actor_id: &str, reaction: &str) -> Result<()> {
        self.write_reaction(node_id, actor_id, reaction, true)
    }

    pub fn delete_reaction(&self, node_id: &str, actor_id: &str, reaction: &str) -> Result<()> {
        self.write_reaction(node_id, actor_id, reaction, false)
    }

    fn write_reaction(&self, node_id: &str, actor_id: &str, reaction: &str, create: bool) -> Result<()> {
        if reaction.is_empty() {
            return Err(SyncError::InvalidInput("empty reaction".into()));
        }
        let now = now_millis();
        let mutation = self.store.with_tx(|tx| {
            let chain = ancestry::ancestors_of(tx, node_id)?;
            let node = chain
                .last()
                .ok_or_else(|| SyncError::NotFound(node_id.to_string()))?;
            permission::check_view(&chain, actor_id)?;

            let existing = store::get_reaction(tx, node_id, actor_id, reaction)?;
            let live = existing.as_ref().is_some_and(|r| r.deleted_at.is_none());
            if live == create {
                return Ok(None);
            }
            let row = NodeReaction {
                node_id: node_id.to_string(),
                collaborator_id: actor_id.to_string(),
                reaction: reaction.to_string(),
                root_id: node.root_id.clone(),
                revision: existing.as_ref().map_or(0, |r| r.revision),
                created_at: if create {
                    now
                } else {
                    existing.as_ref().map_or(now, |r| r.created_at)
                },
                deleted_at: (!create).then_some(now),
            };
            store::upsert_reaction(tx, &row)?;

            let payload = ReactionPayload {
                node_id: node_id.to_string(),
                root_id: node.root_id.clone(),
                reaction: reaction.to_string(),
                created_at: now,
            };
            let mutation = Mutation::new(
                actor_id,
                if create {
                    MutationPayload::CreateReaction(payload)
                } else {
                    MutationPayload::DeleteReaction(payload)
                },
            );
            outbox::enqueue(tx, &mutation)?;
            Ok(Some(mutation))
        })?;

        if let Some(mutation) = mutation {
            let event = if create {
                EngineEvent::ReactionCreated {
                    node_id: node_id.to_string(),
                    collaborator_id: actor_id.to_string(),
                    reaction: reaction.to_string(),
                }
            } else {
                EngineEvent::ReactionDeleted {
                    node_id: node_id.to_string(),
                    collaborator_id: actor_id.to_string(),
                    reaction: reaction.to_string(),
                }
            };
            self.emit_all(vec![event, Self::queued(&mutation)]);
        }
        Ok(())
    }

    pub fn mark_seen(&self, node_id: &str, actor_id: &str) -> Result<()> {
        self.write_interaction(node_id, actor_id, false)
    }

    pub fn mark_opened(&self, node_id: &str, actor_id: &str) -> Result<()> {
        self.write_interaction(node_id, actor_id, true)
    }

    fn write_interaction(&self, node_id: &str, actor_id: &str, opened: bool) -> Result<()> {
        let now = now_millis();
        let mutation = self.store.with_tx(|tx| {
            let chain = ancestry::ancestors_of(tx, node_id)?;
            let node = chain
                .last()
                .ok_or_else(|| SyncError::NotFound(node_id.to_string()))?;
            permission::check_view(&chain, actor_id)?;

            let mut interaction = store::get_interaction(tx, node_id, actor_id)?
                .unwrap_or_else(|| NodeInteraction::new(node_id, actor_id, &node.root_id));
            let payload = InteractionPayload {
                node_id: node_id.to_string(),
                root_id: node.root_id.clone(),
                at: now,
            };
            let payload = if opened {
                interaction.opened(now);
                MutationPayload::MarkOpened(payload)
            } else {
                interaction.seen(now);
                MutationPayload::MarkSeen(payload)
            };
            store::upsert_interaction(tx, &interaction)?;
            let mutation = Mutation::new(actor_id, payload);
            outbox::enqueue(tx, &mutation)?;
            Ok(mutation)
        })?;
        self.emit_all(vec![
            EngineEvent::InteractionUpdated {
                node_id: node_id.to_string(),
                collaborator_id: actor_id.to_string(),
            },
            Self::queued(&mutation),
        ]);
        Ok(())
    }

    // ==================== Incoming changes ====================

    /// Apply a change batch and advance its cursor in one transaction.
    ///
    /// Changes at or below the stored cursor are skipped, so redelivered
    /// batches are no-ops. Returns how many changes were applied.
    pub fn apply_batch(&self, batch: &ChangeBatch) -> Result<usize> {
        let (applied, events) = self.store.with_tx(|tx| {
            let cursor = get_cursor(tx, &batch.consumer_key)?;
            let mut events = Vec::new();
            let mut applied = 0;
            for change in batch.changes.iter().filter(|c| c.id > cursor) {
                self.apply_change(tx, change, &mut events)?;
                applied += 1;
            }
            set_cursor(tx, &batch.consumer_key, batch.cursor)?;
            Ok((applied, events))
        })?;

        if applied > 0 {
            log::debug!(
                "applied {} changes for {} (cursor {})",
                applied,
                batch.consumer_key,
                batch.cursor
            );
            self.emit_all(events);
            self.events.emit(EngineEvent::SyncCompleted { pushed: 0, applied });
        }
        Ok(applied)
    }

    fn apply_change(
        &self,
        conn: &Connection,
        change: &Change,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        match &change.payload {
            ChangePayload::NodeUpserted { node, update_ids } => {
                local::remove_pending(conn, update_ids)?;
                match store::get_node(conn, &node.id)? {
                    None => {
                        // deleted here, delete not yet settled: keep the saved
                        // copy current in case the delete is reverted
                        let refreshed = local::update_tombstone(conn, &node.id, |record| {
                            record.pending.retain(|p| !update_ids.contains(&p.id));
                            if node.revision > record.node.revision
                                || record.node.server_created_at.is_none()
                            {
                                let parent_id = record.node.parent_id.take();
                                record.node = node.clone();
                                record.node.parent_id = parent_id;
                            }
                        })?;
                        if refreshed {
                            return Ok(());
                        }
                        store::upsert_node(conn, node)?;
                        ancestry::insert_node(conn, &node.id, node.parent_id.as_deref())?;
                        recompute_node(conn, &self.engine, &node.id)?;
                        events.push(EngineEvent::NodeCreated {
                            node_id: node.id.clone(),
                            root_id: node.root_id.clone(),
                            node_type: node.node_type,
                        });
                    }
                    Some(current) => {
                        if node.revision > current.revision || current.server_created_at.is_none() {
                            store::upsert_node(conn, node)?;
                            // keep the indexed parent until the projection says otherwise
                            conn.execute(
                                "UPDATE nodes SET parent_id = ?1 WHERE id = ?2",
                                params![current.parent_id, node.id],
                            )?;
                        }
                        recompute_node(conn, &self.engine, &node.id)?;
                        events.push(EngineEvent::NodeUpdated {
                            node_id: node.id.clone(),
                            root_id: node.root_id.clone(),
                        });
                    }
                }
            }
            ChangePayload::NodeDeleted { node_id, .. } => {
                let removed = remove_subtree(conn, node_id, None)?;
                let ids: Vec<String> = removed.iter().map(|n| n.id.clone()).collect();
                outbox::delete_for_nodes(conn, &ids, None)?;
                events.extend(removed.into_iter().map(|n| EngineEvent::NodeDeleted {
                    node_id: n.id,
                    root_id: n.root_id,
                }));
            }
            ChangePayload::DocumentUpdated {
                document,
                update_ids,
            } => {
                local::remove_pending(conn, update_ids)?;
                if store::get_node(conn, &document.id)?.is_none()
                    && local::update_tombstone(conn, &document.id, |record| {
                        record.pending.retain(|p| !update_ids.contains(&p.id));
                        if record
                            .document
                            .as_ref()
                            .is_none_or(|d| document.revision > d.revision)
                        {
                            record.document = Some(document.clone());
                        }
                    })?
                {
                    return Ok(());
                }
                let current = store::get_document(conn, &document.id)?;
                if current.is_none_or(|c| document.revision > c.revision) {
                    store::upsert_document(conn, document)?;
                }
                recompute_document(conn, &self.engine, &document.id)?;
                events.push(EngineEvent::DocumentUpdated {
                    document_id: document.id.clone(),
                    root_id: document.root_id.clone(),
                });
            }
            ChangePayload::ReactionUpserted { reaction } => {
                if store::get_node(conn, &reaction.node_id)?.is_none()
                    && local::update_tombstone(conn, &reaction.node_id, |record| {
                        match record.reactions.iter_mut().find(|r| {
                            r.collaborator_id == reaction.collaborator_id && r.reaction == reaction.reaction
                        }) {
                            Some(r) if reaction.revision > r.revision => *r = reaction.clone(),
                            Some(_) => {}
                            None => record.reactions.push(reaction.clone()),
                        }
                    })?
                {
                    return Ok(());
                }
                let current = store::get_reaction(
                    conn,
                    &reaction.node_id,
                    &reaction.collaborator_id,
                    &reaction.reaction,
                )?;
                if current.is_none_or(|c| reaction.revision > c.revision) {
                    store::upsert_reaction(conn, reaction)?;
                    let (node_id, collaborator_id, name) = (
                        reaction.node_id.clone(),
                        reaction.collaborator_id.clone(),
                        reaction.reaction.clone(),
                    );
                    events.push(if reaction.deleted_at.is_some() {
                        EngineEvent::ReactionDeleted {
                            node_id,
                            collaborator_id,
                            reaction: name,
                        }
                    } else {
                        EngineEvent::ReactionCreated {
                            node_id,
                            collaborator_id,
                            reaction: name,
                        }
                    });
                }
            }
            ChangePayload::InteractionUpserted { interaction } => {
                if store::get_node(conn, &interaction.node_id)?.is_none()
                    && local::update_tombstone(conn, &interaction.node_id, |record| {
                        match record
                            .interactions
                            .iter_mut()
                            .find(|i| i.collaborator_id == interaction.collaborator_id)
                        {
                            Some(i) if interaction.revision > i.revision => *i = interaction.clone(),
                            Some(_) => {}
                            None => record.interactions.push(interaction.clone()),
                        }
                    })?
                {
                    return Ok(());
                }
                let current =
                    store::get_interaction(conn, &interaction.node_id, &interaction.collaborator_id)?;
                if current.is_none_or(|c| interaction.revision > c.revision) {
                    store::upsert_interaction(conn, interaction)?;
                    events.push(EngineEvent::InteractionUpdated {
                        node_id: interaction.node_id.clone(),
                        collaborator_id: interaction.collaborator_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn pending_data(conn: &Connection, id: &str, kind: PendingKind) -> Result<Vec<Vec<u8>>> {
    Ok(local::pending_updates(conn, id, kind)?
        .into_iter()
        .map(|p| p.data)
        .collect())
}

/// Recompute a node's stored projection from snapshot + pending tail, and
/// follow a changed `parentId` in the ancestry index.
pub(crate) fn recompute_node(conn: &Connection, engine: &MergeEngine, id: &str) -> Result<Option<Attributes>> {
    let Some(node) = store::get_node(conn, id)? else {
        return Ok(None);
    };
    let pending = pending_data(conn, id, PendingKind::Node)?;
    let attributes = engine.project(&node.state, &pending)?;
    local::write_node_projection(conn, id, &attributes)?;

    let parent = attributes.get("parentId").and_then(|v| v.as_str());
    if let Some(parent) = parent
        && node.parent_id.as_deref() != Some(parent)
        && store::get_node(conn, parent)?.is_some()
    {
        match ancestry::reparent(conn, id, parent) {
            Ok(_) => {
                conn.execute(
                    "UPDATE nodes SET parent_id = ?1 WHERE id = ?2",
                    params![parent, id],
                )?;
            }
            Err(e) => log::warn!("could not move {} under {}: {}", id, parent, e),
        }
    }
    Ok(Some(attributes))
}

pub(crate) fn recompute_document(conn: &Connection, engine: &MergeEngine, id: &str) -> Result<Option<Attributes>> {
    let Some(document) = store::get_document(conn, id)? else {
        return Ok(None);
    };
    let pending = pending_data(conn, id, PendingKind::Document)?;
    let content = engine.project(&document.state, &pending)?;
    local::write_document_projection(conn, id, &content)?;
    Ok(Some(content))
}

/// Remove a node and its descendants with everything attached to them.
///
/// With `tombstone = Some((mutation_id, deleted_at))` each removed node is
/// first saved so the delete can be reverted. Returns the removed nodes,
/// deepest first.
pub(crate) fn remove_subtree(
    conn: &Connection,
    id: &str,
    tombstone: Option<(&str, i64)>,
) -> Result<Vec<Node>> {
    let mut ids = ancestry::descendants_of(conn, id)?;
    ids.push(id.to_string());

    let mut removed = Vec::with_capacity(ids.len());
    for node_id in ids {
        let node = store::get_node(conn, &node_id)?;
        if let (Some(node), Some((mutation_id, deleted_at))) = (&node, tombstone) {
            let level: i64 = conn
                .query_row(
                    "SELECT level FROM node_paths WHERE ancestor_id = ?1 AND descendant_id = ?2",
                    params![id, node_id],
                    |r| r.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let mut pending = local::pending_updates(conn, &node_id, PendingKind::Node)?;
            pending.extend(local::pending_updates(conn, &node_id, PendingKind::Document)?);
            let record = TombstoneRecord {
                node: node.clone(),
                pending,
                document: store::get_document(conn, &node_id)?,
                reactions: store::list_reactions(conn, &node_id)?,
                interactions: store::list_interactions(conn, &node_id)?,
            };
            local::insert_tombstone(conn, mutation_id, level, &record, deleted_at)?;
        }

        conn.execute("DELETE FROM nodes WHERE id = ?", params![node_id])?;
        local::remove_pending_for(conn, &node_id)?;
        store::delete_node_satellites(conn, &node_id)?;
        ancestry::delete_node(conn, &node_id)?;
        if let Some(node) = node {
            removed.push(node);
        }
    }
    Ok(removed)
}

/// Put back the subtree saved by a delete mutation. Returns restored nodes,
/// shallowest first.
pub(crate) fn restore_tombstones(conn: &Connection, mutation_id: &str) -> Result<Vec<Node>> {
    let records = local::take_tombstones(conn, mutation_id)?;
    let mut restored = Vec::with_capacity(records.len());
    for record in records {
        store::upsert_node(conn, &record.node)?;
        ancestry::insert_node(conn, &record.node.id, record.node.parent_id.as_deref())?;
        for pending in &record.pending {
            local::insert_pending(conn, pending)?;
        }
        if let Some(document) = &record.document {
            store::upsert_document(conn, document)?;
        }
        for reaction in &record.reactions {
            store::upsert_reaction(conn, reaction)?;
        }
        for interaction in &record.interactions {
            store::upsert_interaction(conn, interaction)?;
        }
        restored.push(record.node);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::revert::Reverter;
    use crate::model::MutationType;
    use serde_json::json;

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().cloned().unwrap()
    }

    fn replica() -> Replica {
        Replica::new(
            Arc::new(LocalStore::in_memory().unwrap()),
            MergeEngine::default(),
            EventBus::default(),
            10,
        )
    }

    fn space(replica: &Replica) -> String {
        replica
            .create_node(
                "u1",
                NodeType::Space,
                attrs(json!({"name": "Home", "collaborators": {"u1": "admin", "u2": "viewer"}})),
                None,
            )
            .unwrap()
    }

    fn queue(replica: &Replica) -> Vec<Mutation> {
        replica
            .store()
            .with_conn(|c| outbox::load_queue(c, None))
            .unwrap()
    }

    /// Forget queued work, as if the authority had accepted it.
    fn settle_all(replica: &Replica) {
        replica
            .store()
            .with_conn(|c| {
                c.execute("DELETE FROM mutations", [])?;
                Ok(())
            })
            .unwrap();
    }

    fn consolidate(replica: &Replica) {
        replica
            .store()
            .with_tx(|tx| {
                let queue = outbox::load_queue(tx, None)?;
                let subtrees = local::tombstoned_subtrees(tx)?;
                outbox::apply_plan(tx, &outbox::plan_consolidation(&queue, &subtrees))
            })
            .unwrap();
    }

    fn revert_last(replica: &Replica) -> Vec<EngineEvent> {
        let mutation = queue(replica).pop().unwrap();
        let reverter = Reverter::new(MergeEngine::default());
        replica
            .store()
            .with_tx(|tx| reverter.revert(tx, &mutation, "denied"))
            .unwrap()
    }

    #[test]
    fn test_create_indexes_and_queues() {
        let replica = replica();
        let root = space(&replica);
        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "Notes"})), Some(&root))
            .unwrap();

        let node = replica.get_node(&page).unwrap().unwrap();
        assert_eq!(node.root_id, root);
        assert_eq!(node.parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(node.attributes["parentId"], json!(root));
        assert_eq!(node.revision, 0);

        let chain: Vec<String> = replica.ancestors(&page).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(chain, vec![root.clone(), page.clone()]);
        assert_eq!(queue(&replica).len(), 2);
        assert_eq!(replica.root_ids().unwrap(), vec![root]);
    }

    #[test]
    fn test_root_creator_must_be_admin() {
        let replica = replica();
        let err = replica
            .create_node(
                "u1",
                NodeType::Space,
                attrs(json!({"name": "Home", "collaborators": {"u1": "editor"}})),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Permission(_)));
        assert!(queue(&replica).is_empty());
    }

    #[test]
    fn test_viewer_cannot_edit() {
        let replica = replica();
        let root = space(&replica);
        let err = replica
            .update_node(&root, "u2", |mut a| {
                a.insert("name".into(), json!("Mine"));
                Ok(a)
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Permission(_)));
    }

    #[test]
    fn test_update_keeps_pending_tail() {
        let replica = replica();
        let root = space(&replica);
        replica
            .update_node(&root, "u1", |mut a| {
                a.insert("name".into(), json!("Renamed"));
                Ok(a)
            })
            .unwrap();

        let node = replica.get_node(&root).unwrap().unwrap();
        assert_eq!(node.attributes["name"], json!("Renamed"));
        let pending = replica
            .store()
            .with_conn(|c| local::pending_updates(c, &root, PendingKind::Node))
            .unwrap();
        assert_eq!(pending.len(), 1);

        let q = queue(&replica);
        let MutationPayload::UpdateNode(payload) = &q[1].payload else {
            panic!("expected update");
        };
        assert_eq!(payload.update_ids, vec![pending[0].id.clone()]);

        // an edit that changes nothing queues nothing
        replica.update_node(&root, "u1", Ok).unwrap();
        assert_eq!(queue(&replica).len(), 2);
    }

    #[test]
    fn test_move_updates_ancestry() {
        let replica = replica();
        let root = space(&replica);
        let folder = replica
            .create_node("u1", NodeType::Folder, attrs(json!({"name": "F"})), Some(&root))
            .unwrap();
        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&root))
            .unwrap();
        let target = folder.clone();
        replica
            .update_node(&page, "u1", move |mut a| {
                a.insert("parentId".into(), json!(target));
                Ok(a)
            })
            .unwrap();

        let chain: Vec<String> = replica.ancestors(&page).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(chain, vec![root, folder.clone(), page.clone()]);
        assert_eq!(
            replica.get_node(&page).unwrap().unwrap().parent_id.as_deref(),
            Some(folder.as_str())
        );
    }

    #[test]
    fn test_delete_and_revert_restores_subtree() {
        let replica = replica();
        let root = space(&replica);
        let folder = replica
            .create_node("u1", NodeType::Folder, attrs(json!({"name": "F"})), Some(&root))
            .unwrap();
        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&folder))
            .unwrap();
        replica.create_reaction(&page, "u1", "+1").unwrap();

        replica.delete_node(&folder, "u1").unwrap();
        assert!(replica.get_node(&folder).unwrap().is_none());
        assert!(replica.get_node(&page).unwrap().is_none());
        assert!(replica.reactions(&page).unwrap().is_empty());

        let delete = queue(&replica).pop().unwrap();
        assert_eq!(delete.mutation_type(), MutationType::DeleteNode);
        let reverter = Reverter::new(MergeEngine::default());
        let events = replica
            .store()
            .with_tx(|tx| reverter.revert(tx, &delete, "denied"))
            .unwrap();
        assert!(matches!(events.last(), Some(EngineEvent::MutationReverted { .. })));

        assert!(replica.get_node(&folder).unwrap().is_some());
        let chain: Vec<String> = replica.ancestors(&page).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(chain, vec![root, folder, page.clone()]);
        assert_eq!(replica.reactions(&page).unwrap().len(), 1);
    }

    #[test]
    fn test_revert_create_removes_node_and_followups() {
        let replica = replica();
        let root = space(&replica);
        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&root))
            .unwrap();
        replica.mark_opened(&page, "u1").unwrap();

        let create = queue(&replica)
            .into_iter()
            .find(|m| m.payload.node_id() == page && m.mutation_type() == MutationType::CreateNode)
            .unwrap();
        let reverter = Reverter::new(MergeEngine::default());
        replica
            .store()
            .with_tx(|tx| reverter.revert(tx, &create, "invalid"))
            .unwrap();

        assert!(replica.get_node(&page).unwrap().is_none());
        assert!(queue(&replica).iter().all(|m| m.payload.node_id() != page));
    }

    #[test]
    fn test_reactions_toggle() {
        let replica = replica();
        let root = space(&replica);
        replica.create_reaction(&root, "u2", "heart").unwrap();
        replica.create_reaction(&root, "u2", "heart").unwrap();
        assert_eq!(replica.reactions(&root).unwrap().len(), 1);
        replica.delete_reaction(&root, "u2", "heart").unwrap();
        assert!(replica.reactions(&root).unwrap().is_empty());
        // space create + reaction create + reaction delete
        assert_eq!(queue(&replica).len(), 3);
    }

    #[test]
    fn test_interactions_record_first_and_last() {
        let replica = replica();
        let root = space(&replica);
        replica.mark_seen(&root, "u2").unwrap();
        replica.mark_opened(&root, "u2").unwrap();
        let interaction = replica.interaction(&root, "u2").unwrap().unwrap();
        assert!(interaction.first_seen_at.is_some());
        assert!(interaction.first_opened_at.is_some());
        assert!(interaction.last_opened_at >= interaction.first_seen_at);
    }

    #[test]
    fn test_document_on_page_only() {
        let replica = replica();
        let root = space(&replica);
        let err = replica
            .update_document(&root, "u1", |mut c| {
                c.insert("content".into(), json!({"text": "x"}));
                Ok(c)
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&root))
            .unwrap();
        replica
            .update_document(&page, "u1", |mut c| {
                c.insert("content".into(), json!({"text": "hello"}));
                Ok(c)
            })
            .unwrap();
        let document = replica.get_document(&page).unwrap().unwrap();
        assert_eq!(document.content["content"], json!({"text": "hello"}));
        assert_eq!(document.revision, 0);
    }

    #[test]
    fn test_apply_batch_is_idempotent() {
        let source = replica();
        let root = space(&source);
        let mut node = source.get_node(&root).unwrap().unwrap();
        node.revision = 1;
        node.server_created_at = Some(5);
        let batch = ChangeBatch {
            consumer_key: format!("nodes:{}", root),
            changes: vec![Change {
                id: 7,
                root_id: root.clone(),
                payload: ChangePayload::NodeUpserted {
                    node,
                    update_ids: vec![],
                },
                created_at: 5,
            }],
            cursor: 7,
        };

        let target = replica();
        assert_eq!(target.apply_batch(&batch).unwrap(), 1);
        assert_eq!(target.apply_batch(&batch).unwrap(), 0);
        assert_eq!(target.cursor(&batch.consumer_key).unwrap(), 7);
        let copy = target.get_node(&root).unwrap().unwrap();
        assert_eq!(copy.attributes["name"], json!("Home"));
        assert_eq!(copy.revision, 1);
        assert!(queue(&target).is_empty());
    }

    #[test]
    fn test_apply_batch_ignores_stale_revision() {
        let replica = replica();
        let root = space(&replica);
        let mut newer = replica.get_node(&root).unwrap().unwrap();
        newer.revision = 3;
        newer.server_created_at = Some(1);
        let mut older = newer.clone();
        older.revision = 2;
        older.attributes.insert("name".into(), json!("Old"));

        let change = |id: i64, node: Node| Change {
            id,
            root_id: root.clone(),
            payload: ChangePayload::NodeUpserted {
                node,
                update_ids: vec![],
            },
            created_at: 0,
        };
        let key = format!("nodes:{}", root);
        replica
            .apply_batch(&ChangeBatch {
                consumer_key: key.clone(),
                changes: vec![change(1, newer)],
                cursor: 1,
            })
            .unwrap();
        replica
            .apply_batch(&ChangeBatch {
                consumer_key: key,
                changes: vec![change(2, older)],
                cursor: 2,
            })
            .unwrap();
        assert_eq!(replica.get_node(&root).unwrap().unwrap().revision, 3);
    }

    #[test]
    fn test_reverted_delete_requeues_folded_update() {
        let replica = replica();
        let root = space(&replica);
        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&root))
            .unwrap();
        settle_all(&replica);

        replica
            .update_node(&page, "u1", |mut a| {
                a.insert("name".into(), json!("Local"));
                Ok(a)
            })
            .unwrap();
        replica.delete_node(&page, "u1").unwrap();
        consolidate(&replica);
        let q = queue(&replica);
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].mutation_type(), MutationType::DeleteNode);

        let events = revert_last(&replica);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::MutationQueued { .. })));

        let node = replica.get_node(&page).unwrap().unwrap();
        assert_eq!(node.attributes["name"], json!("Local"));
        let pending = replica
            .store()
            .with_conn(|c| local::pending_updates(c, &page, PendingKind::Node))
            .unwrap();
        let q = queue(&replica);
        assert_eq!(q.len(), 1);
        let MutationPayload::UpdateNode(payload) = &q[0].payload else {
            panic!("expected update");
        };
        assert_eq!(payload.update_ids, vec![pending[0].id.clone()]);
    }

    #[test]
    fn test_delete_cancels_locally_created_subtree() {
        let replica = replica();
        let root = space(&replica);
        settle_all(&replica);

        let folder = replica
            .create_node("u1", NodeType::Folder, attrs(json!({"name": "F"})), Some(&root))
            .unwrap();
        let child = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&folder))
            .unwrap();
        replica
            .update_document(&child, "u1", |mut c| {
                c.insert("content".into(), json!({"text": "draft"}));
                Ok(c)
            })
            .unwrap();
        replica.delete_node(&folder, "u1").unwrap();
        consolidate(&replica);

        assert!(queue(&replica).is_empty());
        let tombstones: i64 = replica
            .store()
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM node_tombstones", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(tombstones, 0);
    }

    #[test]
    fn test_remote_changes_refresh_deleted_node() {
        let replica = replica();
        let root = space(&replica);
        let page = replica
            .create_node("u1", NodeType::Page, attrs(json!({"name": "P"})), Some(&root))
            .unwrap();
        let mut remote = replica.get_node(&page).unwrap().unwrap();
        replica.delete_node(&page, "u1").unwrap();

        let edit = replica
            .engine()
            .edit_node(&remote.state, &[] as &[Vec<u8>], |mut a| {
                a.insert("name".into(), json!("Remote"));
                Ok::<_, SyncError>(a)
            })
            .unwrap();
        remote.state = edit.merged.state;
        remote.attributes = edit.merged.attributes;
        remote.revision = 2;
        remote.server_created_at = Some(1);
        let reaction = NodeReaction {
            node_id: page.clone(),
            collaborator_id: "u2".into(),
            reaction: "heart".into(),
            root_id: root.clone(),
            revision: 1,
            created_at: 1,
            deleted_at: None,
        };
        let changes = vec![
            Change {
                id: 1,
                root_id: root.clone(),
                payload: ChangePayload::NodeUpserted {
                    node: remote,
                    update_ids: vec![],
                },
                created_at: 1,
            },
            Change {
                id: 2,
                root_id: root.clone(),
                payload: ChangePayload::ReactionUpserted { reaction },
                created_at: 1,
            },
        ];
        replica
            .apply_batch(&ChangeBatch {
                consumer_key: format!("nodes:{}", root),
                changes,
                cursor: 2,
            })
            .unwrap();
        // still deleted here
        assert!(replica.get_node(&page).unwrap().is_none());
        assert!(replica.reactions(&page).unwrap().is_empty());

        revert_last(&replica);
        let node = replica.get_node(&page).unwrap().unwrap();
        assert_eq!(node.revision, 2);
        assert_eq!(node.server_created_at, Some(1));
        assert_eq!(node.attributes["name"], json!("Remote"));
        assert_eq!(node.parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(replica.reactions(&page).unwrap().len(), 1);
    }
}
