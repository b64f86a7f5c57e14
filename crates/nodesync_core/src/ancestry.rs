//! Ancestry index over the `node_paths` closure table.
//!
//! Every node has a level-0 self row plus one row per ancestor. All
//! functions take a plain connection so they run inside the caller's
//! transaction alongside the node write they index.

use rusqlite::{Connection, params};

use crate::error::{Result, SyncError};
use crate::model::Node;
use crate::store::{NODE_COLUMNS, node_from_row};

/// Edge counts touched by a reparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReparentStats {
    /// Number of nodes moved (the node and its descendants).
    pub moved: usize,
    pub removed: usize,
    pub inserted: usize,
}

/// Index a newly inserted node under `parent_id`.
pub fn insert_node(conn: &Connection, node_id: &str, parent_id: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO node_paths (ancestor_id, descendant_id, level) VALUES (?1, ?1, 0)",
        params![node_id],
    )?;
    if let Some(parent_id) = parent_id {
        conn.execute(
            "INSERT OR IGNORE INTO node_paths (ancestor_id, descendant_id, level)
             SELECT ancestor_id, ?1, level + 1 FROM node_paths WHERE descendant_id = ?2",
            params![node_id, parent_id],
        )?;
    }
    Ok(())
}

/// Move `node_id` (with its subtree) under `new_parent_id`.
///
/// Rows linking the subtree to its old ancestors are dropped and rebuilt
/// from the new parent's ancestor rows. Rows inside the subtree (between
/// the node and its descendants) are kept as they are.
pub fn reparent(conn: &Connection, node_id: &str, new_parent_id: &str) -> Result<ReparentStats> {
    let cycle: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM node_paths WHERE ancestor_id = ?1 AND descendant_id = ?2)",
        params![node_id, new_parent_id],
        |row| row.get(0),
    )?;
    if cycle {
        return Err(SyncError::Validation(format!(
            "cannot move {} under its own descendant {}",
            node_id, new_parent_id
        )));
    }

    let moved: i64 = conn.query_row(
        "SELECT COUNT(*) FROM node_paths WHERE ancestor_id = ?",
        params![node_id],
        |row| row.get(0),
    )?;
    let moved = moved as usize;

    let removed = conn.execute(
        "DELETE FROM node_paths
         WHERE descendant_id IN (SELECT descendant_id FROM node_paths WHERE ancestor_id = ?1)
           AND ancestor_id NOT IN (SELECT descendant_id FROM node_paths WHERE ancestor_id = ?1)",
        params![node_id],
    )?;

    let inserted = conn.execute(
        "INSERT INTO node_paths (ancestor_id, descendant_id, level)
         SELECT up.ancestor_id, down.descendant_id, up.level + down.level + 1
         FROM node_paths up, node_paths down
         WHERE up.descendant_id = ?2 AND down.ancestor_id = ?1",
        params![node_id, new_parent_id],
    )?;

    log::debug!(
        "reparented {} under {}: {} nodes, -{} +{} edges",
        node_id,
        new_parent_id,
        moved,
        removed,
        inserted
    );
    Ok(ReparentStats {
        moved,
        removed,
        inserted,
    })
}

/// Drop every row where `node_id` is ancestor or descendant.
pub fn delete_node(conn: &Connection, node_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM node_paths WHERE ancestor_id = ?1 OR descendant_id = ?1",
        params![node_id],
    )?;
    Ok(())
}

/// Ancestors of `node_id` including itself, ordered root-to-leaf.
pub fn ancestors_of(conn: &Connection, node_id: &str) -> Result<Vec<Node>> {
    let columns = NODE_COLUMNS
        .split(", ")
        .map(|c| format!("n.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM node_paths p JOIN nodes n ON n.id = p.ancestor_id
         WHERE p.descendant_id = ? ORDER BY p.level DESC",
        columns
    );
    let mut stmt = conn.prepare(&sql)?;
    let nodes = stmt
        .query_map(params![node_id], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Descendant ids of `node_id` (excluding itself), deepest first.
pub fn descendants_of(conn: &Connection, node_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT descendant_id FROM node_paths
         WHERE ancestor_id = ? AND level > 0 ORDER BY level DESC, descendant_id",
    )?;
    let ids = stmt
        .query_map(params![node_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Ancestor ids of `node_id` (excluding itself), nearest first.
pub fn ancestor_ids(conn: &Connection, node_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT ancestor_id FROM node_paths
         WHERE descendant_id = ? AND level > 0 ORDER BY level",
    )?;
    let ids = stmt
        .query_map(params![node_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SHARED_SCHEMA;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SHARED_SCHEMA).unwrap();
        conn
    }

    fn edges(conn: &Connection) -> Vec<(String, String, i64)> {
        let mut stmt = conn
            .prepare("SELECT ancestor_id, descendant_id, level FROM node_paths ORDER BY 1, 2")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    fn level(conn: &Connection, ancestor: &str, descendant: &str) -> Option<i64> {
        conn.query_row(
            "SELECT level FROM node_paths WHERE ancestor_id = ? AND descendant_id = ?",
            params![ancestor, descendant],
            |r| r.get(0),
        )
        .ok()
    }

    /// root -> a -> b -> c, root -> x -> y
    fn tree(conn: &Connection) {
        insert_node(conn, "root", None).unwrap();
        insert_node(conn, "a", Some("root")).unwrap();
        insert_node(conn, "b", Some("a")).unwrap();
        insert_node(conn, "c", Some("b")).unwrap();
        insert_node(conn, "x", Some("root")).unwrap();
        insert_node(conn, "y", Some("x")).unwrap();
    }

    #[test]
    fn test_insert_builds_closure() {
        let conn = conn();
        tree(&conn);
        assert_eq!(level(&conn, "c", "c"), Some(0));
        assert_eq!(level(&conn, "b", "c"), Some(1));
        assert_eq!(level(&conn, "root", "c"), Some(3));
        assert_eq!(ancestor_ids(&conn, "c").unwrap(), vec!["b", "a", "root"]);
        assert_eq!(descendants_of(&conn, "a").unwrap(), vec!["c", "b"]);
    }

    #[test]
    fn test_reparent_subtree() {
        let conn = conn();
        tree(&conn);
        // a has descendants b, c; add a third
        insert_node(&conn, "d", Some("a")).unwrap();
        let internal_before: Vec<_> = edges(&conn)
            .into_iter()
            .filter(|(anc, _, _)| ["a", "b", "c", "d"].contains(&anc.as_str()))
            .collect();

        // y sits at depth 2, so the new ancestor chain is y, x, root.
        let stats = reparent(&conn, "a", "y").unwrap();
        assert_eq!(stats.moved, 4);
        assert_eq!(stats.removed, 4);
        assert_eq!(stats.inserted, 4 * 3);
        // the three descendants account for exactly 3 x depth of the new edges
        let descendant_edges = ["b", "c", "d"]
            .iter()
            .flat_map(|d| ["y", "x", "root"].map(|anc| level(&conn, anc, d)))
            .filter(Option::is_some)
            .count();
        assert_eq!(descendant_edges, 3 * 3);

        assert_eq!(level(&conn, "y", "a"), Some(1));
        assert_eq!(level(&conn, "root", "a"), Some(3));
        assert_eq!(level(&conn, "root", "c"), Some(5));
        assert_eq!(ancestor_ids(&conn, "c").unwrap(), vec!["b", "a", "y", "x", "root"]);

        let internal_after: Vec<_> = edges(&conn)
            .into_iter()
            .filter(|(anc, _, _)| ["a", "b", "c", "d"].contains(&anc.as_str()))
            .collect();
        assert_eq!(internal_before, internal_after);
    }

    #[test]
    fn test_reparent_rejects_cycles() {
        let conn = conn();
        tree(&conn);
        assert!(matches!(
            reparent(&conn, "a", "c"),
            Err(SyncError::Validation(_))
        ));
        assert!(reparent(&conn, "a", "a").is_err());
        assert_eq!(level(&conn, "root", "c"), Some(3));
    }

    #[test]
    fn test_every_node_has_one_self_row() {
        let conn = conn();
        tree(&conn);
        reparent(&conn, "b", "x").unwrap();
        for id in ["root", "a", "b", "c", "x", "y"] {
            let selves: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM node_paths WHERE descendant_id = ?1 AND level = 0",
                    params![id],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(selves, 1, "{}", id);
        }
    }

    #[test]
    fn test_delete_cascades() {
        let conn = conn();
        tree(&conn);
        for id in descendants_of(&conn, "a").unwrap() {
            delete_node(&conn, &id).unwrap();
        }
        delete_node(&conn, "a").unwrap();
        assert!(edges(&conn)
            .iter()
            .all(|(anc, desc, _)| !["a", "b", "c"].contains(&anc.as_str())
                && !["a", "b", "c"].contains(&desc.as_str())));
        assert_eq!(level(&conn, "root", "y"), Some(2));
    }
}
