//! SQLite storage for the authoritative side of one workspace.
//!
//! Besides the entity tables this holds the append-only change log, the
//! update log of every accepted CRDT delta, per-device consumer cursors
//! and the ids of mutations already applied.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::encoding::now_millis;
use crate::error::Result;
use crate::store::SHARED_SCHEMA;

const AUTHORITY_SCHEMA: &str = r#"
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
        server_updated_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_root ON nodes(root_id);

    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        root_id TEXT NOT NULL,
        content TEXT NOT NULL,
        state BLOB NOT NULL,
        revision INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        created_by TEXT NOT NULL,
        updated_at INTEGER,
        updated_by TEXT
    );

    -- Accepted CRDT deltas, trimmed by compaction
    CREATE TABLE IF NOT EXISTS node_updates (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        mutation_id TEXT NOT NULL,
        data BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_node_updates_node ON node_updates(node_id, seq);

    CREATE TABLE IF NOT EXISTS document_updates (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id TEXT NOT NULL,
        mutation_id TEXT NOT NULL,
        data BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_document_updates_document ON document_updates(document_id, seq);

    -- Change log; id is the consumer cursor
    CREATE TABLE IF NOT EXISTS changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        root_id TEXT NOT NULL,
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_changes_root_type ON changes(root_id, type, id);

    -- Keyed by device/type:root
    CREATE TABLE IF NOT EXISTS consumer_cursors (
        consumer_key TEXT PRIMARY KEY,
        cursor INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS applied_mutations (
        id TEXT PRIMARY KEY,
        actor_id TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    );
"#;

/// Which update log a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateLog {
    Node,
    Document,
}

impl UpdateLog {
    fn table(&self) -> &'static str {
        match self {
            UpdateLog::Node => "node_updates",
            UpdateLog::Document => "document_updates",
        }
    }

    fn entity_column(&self) -> &'static str {
        match self {
            UpdateLog::Node => "node_id",
            UpdateLog::Document => "document_id",
        }
    }
}

/// Authoritative database for one workspace.
pub struct AuthorityStore {
    conn: Mutex<Connection>,
}

impl AuthorityStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(AUTHORITY_SCHEMA)?;
        conn.execute_batch(SHARED_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

pub(crate) fn is_applied(conn: &Connection, mutation_id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM applied_mutations WHERE id = ?)",
        params![mutation_id],
        |r| r.get(0),
    )?)
}

pub(crate) fn mark_applied(conn: &Connection, mutation_id: &str, actor_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO applied_mutations (id, actor_id, applied_at) VALUES (?1, ?2, ?3)",
        params![mutation_id, actor_id, now_millis()],
    )?;
    Ok(())
}

pub(crate) fn append_update(
    conn: &Connection,
    log: UpdateLog,
    entity_id: &str,
    mutation_id: &str,
    data: &[u8],
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}, mutation_id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
        log.table(),
        log.entity_column()
    );
    conn.execute(&sql, params![entity_id, mutation_id, data, now_millis()])?;
    Ok(())
}

/// Accepted deltas for one entity, oldest first.
pub(crate) fn list_updates(conn: &Connection, log: UpdateLog, entity_id: &str) -> Result<Vec<Vec<u8>>> {
    let sql = format!(
        "SELECT data FROM {} WHERE {} = ? ORDER BY seq",
        log.table(),
        log.entity_column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![entity_id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
    Ok(rows)
}

pub(crate) fn delete_updates(conn: &Connection, log: UpdateLog, entity_id: &str) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE {} = ?", log.table(), log.entity_column());
    conn.execute(&sql, params![entity_id])?;
    Ok(())
}

/// Keep only the newest `keep` deltas per entity. Returns rows removed.
pub(crate) fn trim_updates(conn: &Connection, log: UpdateLog, keep: usize) -> Result<usize> {
    let sql = format!(
        "DELETE FROM {table} WHERE seq IN (
            SELECT seq FROM (
                SELECT seq, ROW_NUMBER() OVER (PARTITION BY {entity} ORDER BY seq DESC) AS rn
                FROM {table}
            ) WHERE rn > ?1
        )",
        table = log.table(),
        entity = log.entity_column()
    );
    Ok(conn.execute(&sql, params![keep as i64])?)
}

pub(crate) fn get_cursor(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT cursor FROM consumer_cursors WHERE consumer_key = ?",
            params![key],
            |r| r.get(0),
        )
        .optional()?)
}

/// Persist an acknowledged cursor; never moves it backwards.
pub(crate) fn set_cursor(conn: &Connection, key: &str, cursor: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO consumer_cursors (consumer_key, cursor, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(consumer_key) DO UPDATE SET
            cursor = MAX(cursor, excluded.cursor), updated_at = excluded.updated_at",
        params![key, cursor, now_millis()],
    )?;
    Ok(())
}
