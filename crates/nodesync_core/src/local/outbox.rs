//! Mutation outbox.
//!
//! Mutations are appended in the same transaction as the local write they
//! describe. Before each push the queue is consolidated (newest to oldest):
//!
//! - a delete covers every node its local subtree removal took with it; if
//!   each of those nodes was created by a queued mutation, the delete and
//!   everything queued for the subtree are dropped together
//! - otherwise older document, reaction and interaction mutations on the
//!   subtree, and older updates of the deleted node itself, are stashed
//!   with the delete and queued again if the delete is reverted
//! - repeated node/document updates fold into the newest one, carrying the
//!   merged delta of all of them
//! - for reactions and interactions only the newest per key survives

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rusqlite::{Connection, Row, params};

use super::revert::Reverter;
use super::store::{self as local, LocalStore};
use crate::crdt::merge_deltas;
use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::model::{Mutation, MutationPayload, MutationStatus};
use crate::transport::SyncTransport;

pub(crate) fn enqueue(conn: &Connection, mutation: &Mutation) -> Result<()> {
    conn.execute(
        "INSERT INTO mutations (id, type, node_id, actor_id, payload, created_at, retries)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            mutation.id,
            mutation.mutation_type().as_str(),
            mutation.payload.node_id(),
            mutation.actor_id,
            serde_json::to_string(&mutation.payload)?,
            mutation.created_at,
            mutation.retries,
        ],
    )?;
    Ok(())
}

fn mutation_from_row(row: &Row) -> rusqlite::Result<Mutation> {
    let payload: String = row.get(2)?;
    Ok(Mutation {
        id: row.get(0)?,
        actor_id: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: row.get(3)?,
        retries: row.get(4)?,
    })
}

/// Queued mutations, oldest first.
pub(crate) fn load_queue(conn: &Connection, limit: Option<usize>) -> Result<Vec<Mutation>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(
        "SELECT id, actor_id, payload, created_at, retries FROM mutations ORDER BY seq LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![limit], mutation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn delete_mutation(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM mutations WHERE id = ?", params![id])? > 0)
}

pub(crate) fn bump_retries(conn: &Connection, id: &str) -> Result<u32> {
    conn.execute(
        "UPDATE mutations SET retries = retries + 1 WHERE id = ?",
        params![id],
    )?;
    Ok(conn.query_row(
        "SELECT retries FROM mutations WHERE id = ?",
        params![id],
        |r| r.get(0),
    )?)
}

/// Drop queued mutations touching any of `node_ids`, except `keep`.
pub(crate) fn delete_for_nodes(conn: &Connection, node_ids: &[String], keep: Option<&str>) -> Result<usize> {
    let mut removed = 0;
    for node_id in node_ids {
        removed += conn.execute(
            "DELETE FROM mutations WHERE node_id = ?1 AND id != ?2",
            params![node_id, keep.unwrap_or("")],
        )?;
    }
    Ok(removed)
}

/// What consolidation decided for a queue snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidationPlan {
    /// Mutation ids to remove.
    pub dropped: Vec<String>,
    /// Survivors whose payload absorbed older updates.
    pub rewritten: Vec<Mutation>,
    /// Dropped mutations to keep with a delete, by delete id, oldest first.
    pub stashed: BTreeMap<String, Vec<Mutation>>,
}

impl ConsolidationPlan {
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty() && self.rewritten.is_empty()
    }
}

/// Compute the consolidation of `queue` (oldest first). Pure.
///
/// `subtrees` maps a queued delete's id to the node ids it removed locally,
/// the deleted node included. A delete without an entry covers only its
/// own node.
pub fn plan_consolidation(
    queue: &[Mutation],
    subtrees: &HashMap<String, HashSet<String>>,
) -> ConsolidationPlan {
    let mut dropped: HashSet<usize> = HashSet::new();
    let mut stashed: BTreeMap<String, Vec<Mutation>> = BTreeMap::new();

    for (idx, delete) in queue.iter().enumerate().rev() {
        let MutationPayload::DeleteNode(payload) = &delete.payload else {
            continue;
        };
        if dropped.contains(&idx) {
            continue;
        }
        let own = HashSet::from([payload.node_id.clone()]);
        let removed = subtrees.get(&delete.id).unwrap_or(&own);
        let older: Vec<usize> = (0..idx)
            .filter(|i| !dropped.contains(i) && removed.contains(queue[*i].payload.node_id()))
            .collect();
        let created: HashSet<&str> = older
            .iter()
            .filter_map(|&i| match &queue[i].payload {
                MutationPayload::CreateNode(p) => Some(p.node_id.as_str()),
                _ => None,
            })
            .collect();

        if removed.iter().all(|id| created.contains(id.as_str())) {
            // the whole subtree only ever existed here
            dropped.extend(older);
            dropped.insert(idx);
            continue;
        }
        for i in older {
            match &queue[i].payload {
                // creates and moves of other nodes decide what the delete reaches
                MutationPayload::CreateNode(_) => {}
                MutationPayload::UpdateNode(p) if p.node_id != payload.node_id => {}
                MutationPayload::DeleteNode(_) => {
                    dropped.insert(i);
                }
                _ => {
                    dropped.insert(i);
                    stashed
                        .entry(delete.id.clone())
                        .or_default()
                        .push(queue[i].clone());
                }
            }
        }
    }

    let mut survivors: HashMap<String, usize> = HashMap::new();
    // survivor index -> absorbed older update indices, newest first
    let mut absorbed: HashMap<usize, Vec<usize>> = HashMap::new();

    for (idx, mutation) in queue.iter().enumerate().rev() {
        if dropped.contains(&idx) {
            continue;
        }
        let payload = &mutation.payload;
        if matches!(
            payload,
            MutationPayload::CreateNode(_) | MutationPayload::DeleteNode(_)
        ) {
            continue;
        }
        let key = payload.supersede_key();
        match survivors.get(&key) {
            None => {
                survivors.insert(key, idx);
            }
            Some(&survivor) => {
                dropped.insert(idx);
                if matches!(
                    payload,
                    MutationPayload::UpdateNode(_) | MutationPayload::UpdateDocument(_)
                ) {
                    absorbed.entry(survivor).or_default().push(idx);
                }
            }
        }
    }

    let mut rewritten = Vec::new();
    for (survivor, older) in absorbed {
        // chronological: oldest absorbed first, survivor last
        let chain: Vec<&Mutation> = older
            .iter()
            .rev()
            .map(|&i| &queue[i])
            .chain(std::iter::once(&queue[survivor]))
            .collect();
        match fold_updates(&chain) {
            Ok(folded) => rewritten.push(folded),
            Err(e) => {
                log::warn!(
                    "outbox: could not fold updates into {}: {}",
                    queue[survivor].id,
                    e
                );
                for i in older {
                    dropped.remove(&i);
                }
            }
        }
    }

    let mut dropped: Vec<usize> = dropped.into_iter().collect();
    dropped.sort_unstable();
    rewritten.sort_by(|a, b| a.id.cmp(&b.id));
    ConsolidationPlan {
        dropped: dropped.into_iter().map(|i| queue[i].id.clone()).collect(),
        rewritten,
        stashed,
    }
}

/// Fold a chronological run of same-entity updates into the last one.
fn fold_updates(chain: &[&Mutation]) -> Result<Mutation> {
    let last = chain
        .last()
        .ok_or_else(|| SyncError::InvalidInput("empty update chain".into()))?;
    let mut deltas = Vec::with_capacity(chain.len());
    let mut update_ids = Vec::new();
    let mut base_revision = None;
    for mutation in chain {
        let (data, ids, base) = match &mutation.payload {
            MutationPayload::UpdateNode(p) => (&p.data, &p.update_ids, p.base_revision),
            MutationPayload::UpdateDocument(p) => (&p.data, &p.update_ids, p.base_revision),
            other => {
                return Err(SyncError::InvalidInput(format!(
                    "cannot fold {}",
                    other.mutation_type()
                )));
            }
        };
        deltas.push(data.clone());
        update_ids.extend(ids.iter().cloned());
        base_revision.get_or_insert(base);
    }
    let data = merge_deltas(&deltas)?;
    let base_revision = base_revision.unwrap_or_default();

    let mut folded = (*last).clone();
    folded.retries = chain.iter().map(|m| m.retries).max().unwrap_or(0);
    match &mut folded.payload {
        MutationPayload::UpdateNode(p) => {
            p.data = data;
            p.update_ids = update_ids;
            p.base_revision = base_revision;
        }
        MutationPayload::UpdateDocument(p) => {
            p.data = data;
            p.update_ids = update_ids;
            p.base_revision = base_revision;
        }
        _ => {}
    }
    Ok(folded)
}

/// Apply a consolidation plan inside a transaction.
pub(crate) fn apply_plan(conn: &Connection, plan: &ConsolidationPlan) -> Result<()> {
    for id in &plan.dropped {
        delete_mutation(conn, id)?;
        // a cancelled delete can no longer be reverted
        local::discard_tombstones(conn, id)?;
    }
    for (delete_id, mutations) in &plan.stashed {
        for mutation in mutations {
            local::stash_mutation(conn, delete_id, mutation)?;
        }
    }
    for mutation in &plan.rewritten {
        conn.execute(
            "UPDATE mutations SET payload = ?1, retries = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&mutation.payload)?,
                mutation.retries,
                mutation.id
            ],
        )?;
    }
    Ok(())
}

/// Outcome of one [`Outbox::flush`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub reverted: usize,
    /// The queue was empty when the flush stopped.
    pub drained: bool,
}

/// Local queue of unacknowledged mutations and the logic that pushes it.
pub struct Outbox {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    reverter: Arc<Reverter>,
    events: EventBus,
    batch_size: usize,
    retry_ceiling: u32,
    flushing: tokio::sync::Mutex<()>,
}

impl Outbox {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        reverter: Arc<Reverter>,
        events: EventBus,
        batch_size: usize,
        retry_ceiling: u32,
    ) -> Self {
        Self {
            store,
            transport,
            reverter,
            events,
            batch_size: batch_size.max(1),
            retry_ceiling: retry_ceiling.max(1),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Append a mutation on its own. Replica writes enqueue inside their
    /// own transaction instead.
    pub fn enqueue(&self, mutation: &Mutation) -> Result<()> {
        self.store.with_tx(|tx| enqueue(tx, mutation))
    }

    /// Queued mutations, oldest first.
    pub fn pending(&self) -> Result<Vec<Mutation>> {
        self.store.with_conn(|c| load_queue(c, None))
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .store
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM mutations", [], |r| r.get(0))?))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Consolidate the queue in place.
    pub fn consolidate(&self) -> Result<ConsolidationPlan> {
        self.store.with_tx(|tx| {
            let queue = load_queue(tx, None)?;
            let subtrees = local::tombstoned_subtrees(tx)?;
            let plan = plan_consolidation(&queue, &subtrees);
            if !plan.is_empty() {
                log::debug!(
                    "outbox: consolidated {} mutations ({} dropped, {} folded)",
                    queue.len(),
                    plan.dropped.len(),
                    plan.rewritten.len()
                );
                apply_plan(tx, &plan)?;
            }
            Ok(plan)
        })
    }

    /// Push queued mutations in batches until the queue is drained or a
    /// batch makes no progress.
    ///
    /// Transport failures abort the flush with `SyncError::Transport`
    /// without touching retry counters. Only one flush runs at a time.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            self.consolidate()?;
            let batch = self
                .store
                .with_conn(|c| load_queue(c, Some(self.batch_size)))?;
            if batch.is_empty() {
                report.drained = true;
                break;
            }

            report.sent += batch.len();
            let results = self.transport.push_mutations(batch.clone()).await?;
            let (progress, events) = self.settle(&batch, &results, &mut report)?;
            for event in events {
                self.events.emit(event);
            }
            if !progress {
                break;
            }
        }

        if report.sent > 0 {
            log::info!(
                "outbox: flushed {} (accepted {}, rejected {}, reverted {})",
                report.sent,
                report.accepted,
                report.rejected,
                report.reverted
            );
            self.events.emit(EngineEvent::SyncCompleted {
                pushed: report.accepted,
                applied: 0,
            });
        }
        Ok(report)
    }

    /// Record per-item results. Returns whether any item left the queue.
    fn settle(
        &self,
        batch: &[Mutation],
        results: &[crate::model::MutationResult],
        report: &mut FlushReport,
    ) -> Result<(bool, Vec<EngineEvent>)> {
        let by_id: HashMap<&str, &Mutation> = batch.iter().map(|m| (m.id.as_str(), m)).collect();
        self.store.with_tx(|tx| {
            let mut progress = false;
            let mut events = Vec::new();
            for result in results {
                let Some(mutation) = by_id.get(result.id.as_str()) else {
                    log::warn!("outbox: result for unknown mutation {}", result.id);
                    continue;
                };
                match &result.result {
                    MutationStatus::Accepted => {
                        delete_mutation(tx, &mutation.id)?;
                        report.accepted += 1;
                        progress = true;
                    }
                    MutationStatus::Rejected { reason, message } => {
                        report.rejected += 1;
                        if reason.is_terminal() {
                            log::warn!(
                                "outbox: {} {} rejected ({:?}): {}",
                                mutation.mutation_type(),
                                mutation.id,
                                reason,
                                message
                            );
                            events.extend(self.reverter.revert(tx, mutation, message)?);
                            report.reverted += 1;
                            progress = true;
                            continue;
                        }
                        let retries = bump_retries(tx, &mutation.id)?;
                        if retries >= self.retry_ceiling {
                            let exhausted = SyncError::RetryExhausted(mutation.id.clone());
                            events.extend(self.reverter.revert(
                                tx,
                                mutation,
                                &format!("{}: {}", exhausted, message),
                            )?);
                            report.reverted += 1;
                            progress = true;
                        }
                    }
                }
            }
            Ok((progress, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CreateNodePayload, DeleteNodePayload, InteractionPayload, NodeType, ReactionPayload,
        UpdateDocumentPayload, UpdateNodePayload,
    };

    fn create(node: &str) -> Mutation {
        Mutation::new(
            "u1",
            MutationPayload::CreateNode(CreateNodePayload {
                node_id: node.into(),
                root_id: "r".into(),
                parent_id: Some("r".into()),
                node_type: NodeType::Page,
                state: vec![],
                created_at: 0,
            }),
        )
    }

    fn update(node: &str, data: Vec<u8>, update_id: &str, base: i64) -> Mutation {
        Mutation::new(
            "u1",
            MutationPayload::UpdateNode(UpdateNodePayload {
                node_id: node.into(),
                root_id: "r".into(),
                update_ids: vec![update_id.into()],
                data,
                base_revision: base,
                created_at: 0,
            }),
        )
    }

    fn delete(node: &str) -> Mutation {
        Mutation::new(
            "u1",
            MutationPayload::DeleteNode(DeleteNodePayload {
                node_id: node.into(),
                root_id: "r".into(),
                deleted_at: 0,
            }),
        )
    }

    fn reaction(node: &str, emoji: &str, create: bool) -> Mutation {
        let payload = ReactionPayload {
            node_id: node.into(),
            root_id: "r".into(),
            reaction: emoji.into(),
            created_at: 0,
        };
        Mutation::new(
            "u1",
            if create {
                MutationPayload::CreateReaction(payload)
            } else {
                MutationPayload::DeleteReaction(payload)
            },
        )
    }

    fn seen(node: &str, at: i64) -> Mutation {
        Mutation::new(
            "u1",
            MutationPayload::MarkSeen(InteractionPayload {
                node_id: node.into(),
                root_id: "r".into(),
                at,
            }),
        )
    }

    fn ids(queue: &[Mutation], idx: &[usize]) -> Vec<String> {
        let mut ids: Vec<String> = idx.iter().map(|&i| queue[i].id.clone()).collect();
        ids.sort();
        ids
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_create_then_delete_cancels_out() {
        let queue = vec![create("a"), update("a", vec![], "p1", 0), delete("a")];
        let plan = plan_consolidation(&queue, &HashMap::new());
        assert_eq!(sorted(plan.dropped), ids(&queue, &[0, 1, 2]));
        assert!(plan.rewritten.is_empty());
    }

    #[test]
    fn test_delete_of_synced_node_survives() {
        let queue = vec![update("b", vec![], "p1", 3), delete("b")];
        let plan = plan_consolidation(&queue, &HashMap::new());
        assert_eq!(sorted(plan.dropped), ids(&queue, &[0]));
        // the update is kept with the delete in case it is reverted
        assert_eq!(plan.stashed.len(), 1);
        assert_eq!(plan.stashed[&queue[1].id][0].id, queue[0].id);
    }

    #[test]
    fn test_delete_cancels_created_subtree() {
        let folder = create("f");
        let child = create("c");
        let edit = update("c", vec![], "p1", 0);
        let del = delete("f");
        let queue = vec![folder, child, edit, seen("c", 1), del];
        let subtrees = HashMap::from([(
            queue[4].id.clone(),
            HashSet::from(["f".to_string(), "c".to_string()]),
        )]);
        let plan = plan_consolidation(&queue, &subtrees);
        assert_eq!(sorted(plan.dropped), ids(&queue, &[0, 1, 2, 3, 4]));
        assert!(plan.stashed.is_empty());
    }

    #[test]
    fn test_delete_of_synced_folder_stashes_subtree_work() {
        // "f" exists remotely, "c" was created under it here
        let queue = vec![
            create("c"),
            update("f", vec![], "p1", 2),
            update("c", vec![], "p2", 0),
            seen("c", 1),
            delete("f"),
        ];
        let subtrees = HashMap::from([(
            queue[4].id.clone(),
            HashSet::from(["f".to_string(), "c".to_string()]),
        )]);
        let plan = plan_consolidation(&queue, &subtrees);
        // the create and the child's update may move things, they still go out
        assert_eq!(sorted(plan.dropped), ids(&queue, &[1, 3]));
        let stashed: Vec<&str> = plan.stashed[&queue[4].id].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(stashed, vec![queue[1].id.as_str(), queue[3].id.as_str()]);
    }

    #[test]
    fn test_repeated_deletes_keep_newest() {
        let queue = vec![delete("b"), delete("b")];
        let plan = plan_consolidation(&queue, &HashMap::new());
        assert_eq!(plan.dropped, vec![queue[0].id.clone()]);
    }

    #[test]
    fn test_reactions_and_interactions_keep_latest() {
        let queue = vec![
            reaction("n", "+1", true),
            reaction("n", "+1", false),
            reaction("n", "heart", true),
            seen("n", 1),
            seen("n", 2),
        ];
        let plan = plan_consolidation(&queue, &HashMap::new());
        assert_eq!(sorted(plan.dropped), ids(&queue, &[0, 3]));
    }

    #[test]
    fn test_updates_fold_into_newest() {
        use crate::crdt::MergeEngine;
        use serde_json::json;

        let engine = MergeEngine::default();
        let attrs = json!({"type": "page", "parentId": "r", "name": "A"});
        let base = engine
            .create_node(attrs.as_object().unwrap())
            .unwrap()
            .merged
            .state;
        let set = |key: &'static str, value: serde_json::Value| {
            move |mut a: crate::model::Attributes| {
                a.insert(key.into(), value);
                Ok::<_, SyncError>(a)
            }
        };
        let v1 = engine
            .edit_node(&base, &[] as &[Vec<u8>], set("name", json!("v1")))
            .unwrap();
        let v2 = engine
            .edit_node(&base, &[v1.delta.clone()], set("name", json!("v2")))
            .unwrap();

        let queue = vec![
            update("b", v1.delta.clone(), "p1", 4),
            update("b", v2.delta.clone(), "p2", 5),
        ];
        let plan = plan_consolidation(&queue, &HashMap::new());
        assert_eq!(plan.dropped, vec![queue[0].id.clone()]);
        assert_eq!(plan.rewritten.len(), 1);

        let folded = &plan.rewritten[0];
        assert_eq!(folded.id, queue[1].id);
        let MutationPayload::UpdateNode(p) = &folded.payload else {
            panic!("expected update");
        };
        assert_eq!(p.update_ids, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(p.base_revision, 4);
        let merged = engine.merge_node(&base, &[&p.data]).unwrap();
        assert_eq!(merged.attributes["name"], json!("v2"));
    }

    #[test]
    fn test_document_updates_fold_separately_from_node() {
        let doc = |id: &str| {
            Mutation::new(
                "u1",
                MutationPayload::UpdateDocument(UpdateDocumentPayload {
                    document_id: "n".into(),
                    root_id: "r".into(),
                    update_ids: vec![id.into()],
                    data: vec![],
                    base_revision: 0,
                    created_at: 0,
                }),
            )
        };
        let queue = vec![doc("d1"), update("n", vec![], "p1", 0), doc("d2")];
        let plan = plan_consolidation(&queue, &HashMap::new());
        assert_eq!(plan.dropped, vec![queue[0].id.clone()]);
        let MutationPayload::UpdateDocument(p) = &plan.rewritten[0].payload else {
            panic!("expected document update");
        };
        assert_eq!(p.update_ids, vec!["d1".to_string(), "d2".to_string()]);
    }

    #[test]
    fn test_apply_plan_on_store() {
        let store = LocalStore::in_memory().unwrap();
        let queue = vec![create("a"), delete("a"), seen("x", 1), seen("x", 2)];
        store
            .with_tx(|tx| {
                for m in &queue {
                    enqueue(tx, m)?;
                }
                Ok(())
            })
            .unwrap();
        store
            .with_tx(|tx| {
                let plan = plan_consolidation(&load_queue(tx, None)?, &HashMap::new());
                apply_plan(tx, &plan)
            })
            .unwrap();
        let left = store.with_conn(|c| load_queue(c, None)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, queue[3].id);
        assert_eq!(store.with_conn(|c| bump_retries(c, &queue[3].id)).unwrap(), 1);
    }

    #[test]
    fn test_apply_plan_stashes_for_delete() {
        let store = LocalStore::in_memory().unwrap();
        let queue = vec![update("b", vec![], "p1", 1), seen("b", 1), delete("b")];
        store
            .with_tx(|tx| {
                for m in &queue {
                    enqueue(tx, m)?;
                }
                let plan = plan_consolidation(&load_queue(tx, None)?, &HashMap::new());
                apply_plan(tx, &plan)
            })
            .unwrap();
        let left = store.with_conn(|c| load_queue(c, None)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, queue[2].id);

        let stash = store.with_tx(|tx| local::take_stash(tx, &queue[2].id)).unwrap();
        let stashed: Vec<&str> = stash.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(stashed, vec![queue[0].id.as_str(), queue[1].id.as_str()]);
        assert!(store.with_tx(|tx| local::take_stash(tx, &queue[2].id)).unwrap().is_empty());
    }
}
