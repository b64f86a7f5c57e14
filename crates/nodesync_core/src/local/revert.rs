//! Compensation for mutations the authority will never accept.
//!
//! Each mutation type has a handler that undoes its optimistic local
//! effect. Handlers run inside the transaction that settles the push
//! results, so the undo and the removal from the outbox commit together.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{Connection, params};

use super::outbox;
use super::replica::{recompute_document, recompute_node, remove_subtree, restore_tombstones};
use super::store as local;
use crate::crdt::MergeEngine;
use crate::encoding::now_millis;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::model::{Mutation, MutationPayload, MutationType};
use crate::store;

/// Undo the local effect of one mutation type.
pub trait Compensation: Send + Sync {
    fn revert(
        &self,
        conn: &Connection,
        engine: &MergeEngine,
        mutation: &Mutation,
    ) -> Result<Vec<EngineEvent>>;
}

struct RevertCreateNode;

impl Compensation for RevertCreateNode {
    fn revert(&self, conn: &Connection, _: &MergeEngine, mutation: &Mutation) -> Result<Vec<EngineEvent>> {
        let removed = remove_subtree(conn, mutation.payload.node_id(), None)?;
        let ids: Vec<String> = removed.iter().map(|n| n.id.clone()).collect();
        // queued work on a node that never existed remotely is moot
        outbox::delete_for_nodes(conn, &ids, Some(&mutation.id))?;
        Ok(removed
            .into_iter()
            .map(|n| EngineEvent::NodeDeleted {
                node_id: n.id,
                root_id: n.root_id,
            })
            .collect())
    }
}

struct RevertUpdateNode;

impl Compensation for RevertUpdateNode {
    fn revert(&self, conn: &Connection, engine: &MergeEngine, mutation: &Mutation) -> Result<Vec<EngineEvent>> {
        let MutationPayload::UpdateNode(payload) = &mutation.payload else {
            return Ok(Vec::new());
        };
        local::remove_pending(conn, &payload.update_ids)?;
        Ok(match recompute_node(conn, engine, &payload.node_id)? {
            Some(_) => vec![EngineEvent::NodeUpdated {
                node_id: payload.node_id.clone(),
                root_id: payload.root_id.clone(),
            }],
            None => Vec::new(),
        })
    }
}

struct RevertDeleteNode;

impl Compensation for RevertDeleteNode {
    fn revert(&self, conn: &Connection, engine: &MergeEngine, mutation: &Mutation) -> Result<Vec<EngineEvent>> {
        let restored = restore_tombstones(conn, &mutation.id)?;
        let mut events = Vec::with_capacity(restored.len());
        for node in restored {
            recompute_node(conn, engine, &node.id)?;
            if store::get_document(conn, &node.id)?.is_some() {
                recompute_document(conn, engine, &node.id)?;
            }
            events.push(EngineEvent::NodeCreated {
                node_id: node.id,
                root_id: node.root_id,
                node_type: node.node_type,
            });
        }
        // work folded away by the delete goes back on the queue
        for stashed in local::take_stash(conn, &mutation.id)? {
            outbox::enqueue(conn, &stashed)?;
            events.push(EngineEvent::MutationQueued {
                mutation_type: stashed.mutation_type(),
                mutation_id: stashed.id,
            });
        }
        Ok(events)
    }
}

struct RevertUpdateDocument;

impl Compensation for RevertUpdateDocument {
    fn revert(&self, conn: &Connection, engine: &MergeEngine, mutation: &Mutation) -> Result<Vec<EngineEvent>> {
        let MutationPayload::UpdateDocument(payload) = &mutation.payload else {
            return Ok(Vec::new());
        };
        local::remove_pending(conn, &payload.update_ids)?;
        let document = store::get_document(conn, &payload.document_id)?;
        match document {
            // never acknowledged: drop the optimistic row
            Some(d) if d.revision == 0 && d.state.is_empty() && !has_pending_document(conn, &d.id)? => {
                conn.execute("DELETE FROM documents WHERE id = ?", params![d.id])?;
            }
            Some(_) => {
                recompute_document(conn, engine, &payload.document_id)?;
            }
            None => return Ok(Vec::new()),
        }
        Ok(vec![EngineEvent::DocumentUpdated {
            document_id: payload.document_id.clone(),
            root_id: payload.root_id.clone(),
        }])
    }
}

fn has_pending_document(conn: &Connection, id: &str) -> Result<bool> {
    Ok(!local::pending_updates(conn, id, local::PendingKind::Document)?.is_empty())
}

/// Flip a reaction back. `restore` undeletes, otherwise the reaction is
/// soft-deleted.
struct RevertReaction {
    restore: bool,
}

impl Compensation for RevertReaction {
    fn revert(&self, conn: &Connection, _: &MergeEngine, mutation: &Mutation) -> Result<Vec<EngineEvent>> {
        let (MutationPayload::CreateReaction(payload) | MutationPayload::DeleteReaction(payload)) =
            &mutation.payload
        else {
            return Ok(Vec::new());
        };
        let Some(mut reaction) =
            store::get_reaction(conn, &payload.node_id, &mutation.actor_id, &payload.reaction)?
        else {
            return Ok(Vec::new());
        };
        reaction.deleted_at = if self.restore { None } else { Some(now_millis()) };
        store::upsert_reaction(conn, &reaction)?;

        let (node_id, collaborator_id, reaction) =
            (reaction.node_id, reaction.collaborator_id, reaction.reaction);
        Ok(vec![if self.restore {
            EngineEvent::ReactionCreated {
                node_id,
                collaborator_id,
                reaction,
            }
        } else {
            EngineEvent::ReactionDeleted {
                node_id,
                collaborator_id,
                reaction,
            }
        }])
    }
}

/// Seen/opened timestamps are informational; a rejected one is just dropped.
struct Discard;

impl Compensation for Discard {
    fn revert(&self, _: &Connection, _: &MergeEngine, _: &Mutation) -> Result<Vec<EngineEvent>> {
        Ok(Vec::new())
    }
}

/// Dispatches reverts to the handler registered for each mutation type.
pub struct Reverter {
    engine: MergeEngine,
    handlers: HashMap<MutationType, Arc<dyn Compensation>>,
}

impl Reverter {
    pub fn new(engine: MergeEngine) -> Self {
        let mut reverter = Self {
            engine,
            handlers: HashMap::new(),
        };
        reverter.register(MutationType::CreateNode, Arc::new(RevertCreateNode));
        reverter.register(MutationType::UpdateNode, Arc::new(RevertUpdateNode));
        reverter.register(MutationType::DeleteNode, Arc::new(RevertDeleteNode));
        reverter.register(MutationType::UpdateDocument, Arc::new(RevertUpdateDocument));
        reverter.register(
            MutationType::CreateReaction,
            Arc::new(RevertReaction { restore: false }),
        );
        reverter.register(
            MutationType::DeleteReaction,
            Arc::new(RevertReaction { restore: true }),
        );
        reverter.register(MutationType::MarkSeen, Arc::new(Discard));
        reverter.register(MutationType::MarkOpened, Arc::new(Discard));
        reverter
    }

    /// Replace the handler for a mutation type.
    pub fn register(&mut self, mutation_type: MutationType, handler: Arc<dyn Compensation>) {
        self.handlers.insert(mutation_type, handler);
    }

    /// Undo `mutation` locally and remove it from the outbox.
    pub fn revert(&self, conn: &Connection, mutation: &Mutation, message: &str) -> Result<Vec<EngineEvent>> {
        let mut events = match self.handlers.get(&mutation.mutation_type()) {
            Some(handler) => handler.revert(conn, &self.engine, mutation)?,
            None => Vec::new(),
        };
        outbox::delete_mutation(conn, &mutation.id)?;
        log::warn!(
            "reverted {} {} on {}: {}",
            mutation.mutation_type(),
            mutation.id,
            mutation.payload.node_id(),
            message
        );
        events.push(EngineEvent::MutationReverted {
            mutation_id: mutation.id.clone(),
            mutation_type: mutation.mutation_type(),
            node_id: mutation.payload.node_id().to_string(),
            message: message.to_string(),
        });
        Ok(events)
    }
}
