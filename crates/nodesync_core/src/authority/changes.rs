//! Append-only change log and commit notifications.

use rusqlite::{Connection, params};
use tokio::sync::broadcast;

use crate::encoding::now_millis;
use crate::error::{Result, SyncError};
use crate::model::{Change, ChangePayload, ConsumerType};

/// Append one change scoped to `root_id`. Returns its id (the cursor).
pub(crate) fn append_change(conn: &Connection, root_id: &str, payload: &ChangePayload) -> Result<i64> {
    conn.execute(
        "INSERT INTO changes (root_id, type, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            root_id,
            payload.consumer_type().as_str(),
            serde_json::to_string(payload)?,
            now_millis()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Changes of one consumer stream after `cursor`, oldest first.
pub(crate) fn changes_since(
    conn: &Connection,
    root_id: &str,
    consumer_type: ConsumerType,
    cursor: i64,
    limit: usize,
) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare(
        "SELECT id, root_id, payload, created_at FROM changes
         WHERE root_id = ?1 AND type = ?2 AND id > ?3 ORDER BY id LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(
            params![root_id, consumer_type.as_str(), cursor, limit as i64],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, root_id, payload, created_at)| {
            Ok(Change {
                id,
                root_id,
                payload: serde_json::from_str(&payload).map_err(SyncError::from)?,
                created_at,
            })
        })
        .collect()
}

pub(crate) fn latest_change_id(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM changes", [], |r| r.get(0))?)
}

/// Sent after a commit appended changes for `root_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub root_id: String,
    pub cursor: i64,
}

/// Broadcast of [`ChangeNotice`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeNotice>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.tx.subscribe()
    }

    pub fn notify(&self, root_id: &str, cursor: i64) {
        let _ = self.tx.send(ChangeNotice {
            root_id: root_id.to_string(),
            cursor,
        });
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthorityStore;

    #[test]
    fn test_changes_filtered_by_stream() {
        let store = AuthorityStore::in_memory().unwrap();
        let deleted = |id: &str| ChangePayload::NodeDeleted {
            node_id: id.into(),
            deleted_at: 1,
        };
        store
            .with_tx(|tx| {
                append_change(tx, "s1", &deleted("a"))?;
                append_change(tx, "s2", &deleted("b"))?;
                append_change(tx, "s1", &deleted("c"))?;
                Ok(())
            })
            .unwrap();

        let all = store
            .with_conn(|c| changes_since(c, "s1", ConsumerType::Nodes, 0, 10))
            .unwrap();
        assert_eq!(all.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 3]);
        let after = store
            .with_conn(|c| changes_since(c, "s1", ConsumerType::Nodes, 1, 10))
            .unwrap();
        assert_eq!(after.len(), 1);
        let docs = store
            .with_conn(|c| changes_since(c, "s1", ConsumerType::Documents, 0, 10))
            .unwrap();
        assert!(docs.is_empty());
        assert_eq!(store.with_conn(latest_change_id).unwrap(), 3);
    }
}
