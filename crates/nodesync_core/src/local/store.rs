//! SQLite storage for one local replica.
//!
//! `nodes.state` / `documents.state` hold the last snapshot acknowledged by
//! the authority. Local, unacknowledged deltas sit in `pending_updates`
//! until a change carrying their ids comes back. The stored `attributes`
//! and `content` are always the projection of snapshot + pending tail.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::encoding::{base64_bytes, now_millis};
use crate::error::{Result, SyncError};
use crate::model::{Document, Mutation, Node, NodeInteraction, NodeReaction};
use crate::store::SHARED_SCHEMA;

const LOCAL_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        parent_id TEXT,
        root_id TEXT NOT NULL,
        attributes TEXT NOT NULL,
        state BLOB NOT NULL,
        revision INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        created_by TEXT NOT NULL,
        updated_at INTEGER,
        updated_by TEXT,
        server_created_at INTEGER,
        server_updated_at INTEGER,
        -- bumped by every local write, used for optimistic local updates
        local_revision INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_root ON nodes(root_id);
    CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);

    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        root_id TEXT NOT NULL,
        content TEXT NOT NULL,
        state BLOB NOT NULL,
        revision INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        created_by TEXT NOT NULL,
        updated_at INTEGER,
        updated_by TEXT,
        local_revision INTEGER NOT NULL DEFAULT 0
    );

    -- Local CRDT deltas not yet absorbed by an acknowledged snapshot
    CREATE TABLE IF NOT EXISTS pending_updates (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        entity_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        data BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_updates_entity ON pending_updates(entity_id, kind, seq);

    -- Outbox
    CREATE TABLE IF NOT EXISTS mutations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL,
        node_id TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        retries INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_mutations_node ON mutations(node_id);

    -- Subtrees removed by a local delete, kept until the delete is settled
    CREATE TABLE IF NOT EXISTS node_tombstones (
        node_id TEXT PRIMARY KEY,
        mutation_id TEXT NOT NULL,
        level INTEGER NOT NULL,
        payload TEXT NOT NULL,
        deleted_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_node_tombstones_mutation ON node_tombstones(mutation_id);

    -- Mutations folded away by a queued delete, queued again if it is reverted
    CREATE TABLE IF NOT EXISTS stashed_mutations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        delete_id TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_stashed_mutations_delete ON stashed_mutations(delete_id, seq);

    CREATE TABLE IF NOT EXISTS consumer_cursors (
        consumer_key TEXT PRIMARY KEY,
        cursor INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
"#;

/// Which entity table a pending update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Node,
    Document,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Node => "node",
            PendingKind::Document => "document",
        }
    }
}

/// A local delta waiting for acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub id: String,
    pub entity_id: String,
    pub kind: PendingKind,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub created_at: i64,
}

/// Everything needed to restore one node removed by a local delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstoneRecord {
    pub node: Node,
    #[serde(default)]
    pub pending: Vec<PendingUpdate>,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub reactions: Vec<NodeReaction>,
    #[serde(default)]
    pub interactions: Vec<NodeInteraction>,
}

/// Local replica database.
///
/// The connection is wrapped in a `Mutex`; every logical operation takes
/// the lock once and runs in a single transaction.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create a replica database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory replica database for testing.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(LOCAL_SCHEMA)?;
        conn.execute_batch(SHARED_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the connection without a transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction, committing only if it succeeds.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

pub(crate) fn local_revision(conn: &Connection, table: &str, id: &str) -> Result<Option<i64>> {
    let sql = format!("SELECT local_revision FROM {} WHERE id = ?", table);
    Ok(conn.query_row(&sql, params![id], |r| r.get(0)).optional()?)
}

pub(crate) fn pending_updates(
    conn: &Connection,
    entity_id: &str,
    kind: PendingKind,
) -> Result<Vec<PendingUpdate>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_id, data, created_at FROM pending_updates
         WHERE entity_id = ? AND kind = ? ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![entity_id, kind.as_str()], |row| {
            Ok(PendingUpdate {
                id: row.get(0)?,
                entity_id: row.get(1)?,
                kind,
                data: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn insert_pending(conn: &Connection, update: &PendingUpdate) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO pending_updates (id, entity_id, kind, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            update.id,
            update.entity_id,
            update.kind.as_str(),
            update.data,
            update.created_at
        ],
    )?;
    Ok(())
}

/// Remove pending updates by id. Returns how many were removed.
pub(crate) fn remove_pending(conn: &Connection, ids: &[String]) -> Result<usize> {
    let mut removed = 0;
    for id in ids {
        removed += conn.execute("DELETE FROM pending_updates WHERE id = ?", params![id])?;
    }
    Ok(removed)
}

pub(crate) fn remove_pending_for(conn: &Connection, entity_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_updates WHERE entity_id = ?",
        params![entity_id],
    )?;
    Ok(())
}

/// Persist the stored projection for a node after a snapshot/pending change.
pub(crate) fn write_node_projection(
    conn: &Connection,
    id: &str,
    attributes: &crate::model::Attributes,
) -> Result<()> {
    conn.execute(
        "UPDATE nodes SET attributes = ?1, local_revision = local_revision + 1 WHERE id = ?2",
        params![serde_json::to_string(attributes)?, id],
    )?;
    Ok(())
}

pub(crate) fn write_document_projection(
    conn: &Connection,
    id: &str,
    content: &crate::model::Attributes,
) -> Result<()> {
    conn.execute(
        "UPDATE documents SET content = ?1, local_revision = local_revision + 1 WHERE id = ?2",
        params![serde_json::to_string(content)?, id],
    )?;
    Ok(())
}

pub(crate) fn get_cursor(conn: &Connection, consumer_key: &str) -> Result<i64> {
    Ok(conn
        .query_row(
            "SELECT cursor FROM consumer_cursors WHERE consumer_key = ?",
            params![consumer_key],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

/// Advance a cursor; never moves it backwards.
pub(crate) fn set_cursor(conn: &Connection, consumer_key: &str, cursor: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO consumer_cursors (consumer_key, cursor, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(consumer_key) DO UPDATE SET
            cursor = MAX(cursor, excluded.cursor), updated_at = excluded.updated_at",
        params![consumer_key, cursor, now_millis()],
    )?;
    Ok(())
}

pub(crate) fn insert_tombstone(
    conn: &Connection,
    mutation_id: &str,
    level: i64,
    record: &TombstoneRecord,
    deleted_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO node_tombstones (node_id, mutation_id, level, payload, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.node.id,
            mutation_id,
            level,
            serde_json::to_string(record)?,
            deleted_at
        ],
    )?;
    Ok(())
}

/// Tombstones written by one delete mutation, shallowest first.
pub(crate) fn take_tombstones(conn: &Connection, mutation_id: &str) -> Result<Vec<TombstoneRecord>> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM node_tombstones WHERE mutation_id = ? ORDER BY level, node_id",
    )?;
    let payloads = stmt
        .query_map(params![mutation_id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(
        "DELETE FROM node_tombstones WHERE mutation_id = ?",
        params![mutation_id],
    )?;
    payloads
        .iter()
        .map(|p| serde_json::from_str::<TombstoneRecord>(p).map_err(SyncError::from))
        .collect()
}

/// Node ids removed by each delete that still has tombstones, keyed by the
/// delete mutation id.
pub(crate) fn tombstoned_subtrees(conn: &Connection) -> Result<HashMap<String, HashSet<String>>> {
    let mut stmt = conn.prepare("SELECT mutation_id, node_id FROM node_tombstones")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut subtrees: HashMap<String, HashSet<String>> = HashMap::new();
    for (mutation_id, node_id) in rows {
        subtrees.entry(mutation_id).or_default().insert(node_id);
    }
    Ok(subtrees)
}

/// Rewrite the tombstone of a deleted node in place. Returns false if the
/// node has no tombstone.
pub(crate) fn update_tombstone(
    conn: &Connection,
    node_id: &str,
    f: impl FnOnce(&mut TombstoneRecord),
) -> Result<bool> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM node_tombstones WHERE node_id = ?",
            params![node_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(payload) = payload else {
        return Ok(false);
    };
    let mut record: TombstoneRecord = serde_json::from_str(&payload)?;
    f(&mut record);
    conn.execute(
        "UPDATE node_tombstones SET payload = ?1 WHERE node_id = ?2",
        params![serde_json::to_string(&record)?, node_id],
    )?;
    Ok(true)
}

pub(crate) fn discard_tombstones(conn: &Connection, mutation_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM node_tombstones WHERE mutation_id = ?",
        params![mutation_id],
    )?;
    conn.execute(
        "DELETE FROM stashed_mutations WHERE delete_id = ?",
        params![mutation_id],
    )?;
    Ok(())
}

pub(crate) fn stash_mutation(conn: &Connection, delete_id: &str, mutation: &Mutation) -> Result<()> {
    conn.execute(
        "INSERT INTO stashed_mutations (delete_id, payload) VALUES (?1, ?2)",
        params![delete_id, serde_json::to_string(mutation)?],
    )?;
    Ok(())
}

/// Mutations stashed under a delete, oldest first. They are removed.
pub(crate) fn take_stash(conn: &Connection, delete_id: &str) -> Result<Vec<Mutation>> {
    let mut stmt =
        conn.prepare("SELECT payload FROM stashed_mutations WHERE delete_id = ? ORDER BY seq")?;
    let payloads = stmt
        .query_map(params![delete_id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(
        "DELETE FROM stashed_mutations WHERE delete_id = ?",
        params![delete_id],
    )?;
    payloads
        .iter()
        .map(|p| serde_json::from_str::<Mutation>(p).map_err(SyncError::from))
        .collect()
}

/// Remove tombstones older than `before` whose delete has left the outbox,
/// and every stash whose delete has.
pub(crate) fn purge_tombstones(conn: &Connection, before: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM stashed_mutations WHERE delete_id NOT IN (SELECT id FROM mutations)",
        [],
    )?;
    Ok(conn.execute(
        "DELETE FROM node_tombstones
         WHERE deleted_at < ?1 AND mutation_id NOT IN (SELECT id FROM mutations)",
        params![before],
    )?)
}

/// Roots the replica holds nodes for or has a consumer cursor for.
pub(crate) fn root_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT root_id FROM nodes
         UNION
         SELECT substr(consumer_key, instr(consumer_key, ':') + 1) FROM consumer_cursors
         ORDER BY 1",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str, entity: &str, data: u8) -> PendingUpdate {
        PendingUpdate {
            id: id.into(),
            entity_id: entity.into(),
            kind: PendingKind::Node,
            data: vec![data],
            created_at: 1,
        }
    }

    #[test]
    fn test_pending_updates_keep_insert_order() {
        let store = LocalStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                insert_pending(tx, &pending("b", "n1", 2))?;
                insert_pending(tx, &pending("a", "n1", 1))?;
                insert_pending(tx, &pending("c", "n2", 3))?;
                Ok(())
            })
            .unwrap();
        let rows = store
            .with_conn(|c| pending_updates(c, "n1", PendingKind::Node))
            .unwrap();
        assert_eq!(rows.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);

        let removed = store
            .with_conn(|c| remove_pending(c, &["b".to_string(), "zz".to_string()]))
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_cursor_never_moves_back() {
        let store = LocalStore::in_memory().unwrap();
        store
            .with_conn(|c| {
                assert_eq!(get_cursor(c, "nodes:r")?, 0);
                set_cursor(c, "nodes:r", 10)?;
                set_cursor(c, "nodes:r", 4)?;
                assert_eq!(get_cursor(c, "nodes:r")?, 10);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = LocalStore::in_memory().unwrap();
        let result: Result<()> = store.with_tx(|tx| {
            insert_pending(tx, &pending("a", "n1", 1))?;
            Err(crate::error::SyncError::Validation("nope".into()))
        });
        assert!(result.is_err());
        let rows = store
            .with_conn(|c| pending_updates(c, "n1", PendingKind::Node))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        {
            let store = LocalStore::open(&path).unwrap();
            store.with_conn(|c| set_cursor(c, "k", 3)).unwrap();
        }
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.with_conn(|c| get_cursor(c, "k")).unwrap(), 3);
    }
}
