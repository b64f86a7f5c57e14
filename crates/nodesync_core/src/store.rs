//! Entity store tables and row mapping shared by the local replica and the
//! authority.
//!
//! Each side owns its `nodes` and `documents` tables (the local replica
//! carries extra bookkeeping columns), but both select the same column set,
//! so the mappers here work for either database.

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::Result;
use crate::model::{Attributes, Document, Node, NodeInteraction, NodeReaction};

/// Tables with identical layout on both sides.
pub(crate) const SHARED_SCHEMA: &str = r#"
    -- Closure table: one row per (ancestor, descendant), level 0 is self
    CREATE TABLE IF NOT EXISTS node_paths (
        ancestor_id TEXT NOT NULL,
        descendant_id TEXT NOT NULL,
        level INTEGER NOT NULL,
        PRIMARY KEY (ancestor_id, descendant_id)
    );
    CREATE INDEX IF NOT EXISTS idx_node_paths_descendant ON node_paths(descendant_id, level);

    CREATE TABLE IF NOT EXISTS node_reactions (
        node_id TEXT NOT NULL,
        collaborator_id TEXT NOT NULL,
        reaction TEXT NOT NULL,
        root_id TEXT NOT NULL,
        revision INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER,
        PRIMARY KEY (node_id, collaborator_id, reaction)
    );

    CREATE TABLE IF NOT EXISTS node_interactions (
        node_id TEXT NOT NULL,
        collaborator_id TEXT NOT NULL,
        root_id TEXT NOT NULL,
        revision INTEGER NOT NULL,
        first_seen_at INTEGER,
        last_seen_at INTEGER,
        first_opened_at INTEGER,
        last_opened_at INTEGER,
        PRIMARY KEY (node_id, collaborator_id)
    );
"#;

pub(crate) const NODE_COLUMNS: &str = "id, type, parent_id, root_id, attributes, state, revision, \
     created_at, created_by, updated_at, updated_by, server_created_at, server_updated_at";

pub(crate) const DOCUMENT_COLUMNS: &str =
    "id, root_id, content, state, revision, created_at, created_by, updated_at, updated_by";

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn attributes_column(row: &Row, idx: usize) -> rusqlite::Result<Attributes> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

/// Map a row selected with [`NODE_COLUMNS`].
pub(crate) fn node_from_row(row: &Row) -> rusqlite::Result<Node> {
    let node_type: String = row.get(1)?;
    Ok(Node {
        id: row.get(0)?,
        node_type: node_type.parse().map_err(|e: String| conversion_error(1, e))?,
        parent_id: row.get(2)?,
        root_id: row.get(3)?,
        attributes: attributes_column(row, 4)?,
        state: row.get(5)?,
        revision: row.get(6)?,
        created_at: row.get(7)?,
        created_by: row.get(8)?,
        updated_at: row.get(9)?,
        updated_by: row.get(10)?,
        server_created_at: row.get(11)?,
        server_updated_at: row.get(12)?,
    })
}

/// Map a row selected with [`DOCUMENT_COLUMNS`].
pub(crate) fn document_from_row(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        root_id: row.get(1)?,
        content: attributes_column(row, 2)?,
        state: row.get(3)?,
        revision: row.get(4)?,
        created_at: row.get(5)?,
        created_by: row.get(6)?,
        updated_at: row.get(7)?,
        updated_by: row.get(8)?,
    })
}

pub(crate) fn get_node(conn: &Connection, id: &str) -> Result<Option<Node>> {
    let sql = format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS);
    Ok(conn.query_row(&sql, params![id], node_from_row).optional()?)
}

pub(crate) fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>> {
    let sql = format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], document_from_row)
        .optional()?)
}

/// Nodes sharing `root_id`, parents before children.
pub(crate) fn list_nodes_in_root(conn: &Connection, root_id: &str) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {} FROM nodes n WHERE root_id = ? \
         ORDER BY (SELECT COUNT(*) FROM node_paths p WHERE p.descendant_id = n.id), id",
        NODE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let nodes = stmt
        .query_map(params![root_id], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Insert or overwrite a node row (all shared columns).
pub(crate) fn upsert_node(conn: &Connection, node: &Node) -> Result<()> {
    let sql = format!(
        "INSERT INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
            type = excluded.type, parent_id = excluded.parent_id, root_id = excluded.root_id,
            attributes = excluded.attributes, state = excluded.state,
            revision = excluded.revision, updated_at = excluded.updated_at,
            updated_by = excluded.updated_by, server_created_at = excluded.server_created_at,
            server_updated_at = excluded.server_updated_at",
        NODE_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            node.id,
            node.node_type.as_str(),
            node.parent_id,
            node.root_id,
            serde_json::to_string(&node.attributes)?,
            node.state,
            node.revision,
            node.created_at,
            node.created_by,
            node.updated_at,
            node.updated_by,
            node.server_created_at,
            node.server_updated_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn upsert_document(conn: &Connection, document: &Document) -> Result<()> {
    let sql = format!(
        "INSERT INTO documents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            content = excluded.content, state = excluded.state, revision = excluded.revision,
            updated_at = excluded.updated_at, updated_by = excluded.updated_by",
        DOCUMENT_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            document.id,
            document.root_id,
            serde_json::to_string(&document.content)?,
            document.state,
            document.revision,
            document.created_at,
            document.created_by,
            document.updated_at,
            document.updated_by,
        ],
    )?;
    Ok(())
}

fn reaction_from_row(row: &Row) -> rusqlite::Result<NodeReaction> {
    Ok(NodeReaction {
        node_id: row.get(0)?,
        collaborator_id: row.get(1)?,
        reaction: row.get(2)?,
        root_id: row.get(3)?,
        revision: row.get(4)?,
        created_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

pub(crate) fn get_reaction(
    conn: &Connection,
    node_id: &str,
    collaborator_id: &str,
    reaction: &str,
) -> Result<Option<NodeReaction>> {
    Ok(conn
        .query_row(
            "SELECT node_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at
             FROM node_reactions WHERE node_id = ? AND collaborator_id = ? AND reaction = ?",
            params![node_id, collaborator_id, reaction],
            reaction_from_row,
        )
        .optional()?)
}

/// Live (not soft-deleted) reactions on a node.
pub(crate) fn list_reactions(conn: &Connection, node_id: &str) -> Result<Vec<NodeReaction>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at
         FROM node_reactions WHERE node_id = ? AND deleted_at IS NULL
         ORDER BY created_at, collaborator_id",
    )?;
    let reactions = stmt
        .query_map(params![node_id], reaction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(reactions)
}

pub(crate) fn upsert_reaction(conn: &Connection, reaction: &NodeReaction) -> Result<()> {
    conn.execute(
        "INSERT INTO node_reactions
            (node_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(node_id, collaborator_id, reaction) DO UPDATE SET
            revision = excluded.revision, created_at = excluded.created_at,
            deleted_at = excluded.deleted_at",
        params![
            reaction.node_id,
            reaction.collaborator_id,
            reaction.reaction,
            reaction.root_id,
            reaction.revision,
            reaction.created_at,
            reaction.deleted_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_interaction(
    conn: &Connection,
    node_id: &str,
    collaborator_id: &str,
) -> Result<Option<NodeInteraction>> {
    Ok(conn
        .query_row(
            "SELECT node_id, collaborator_id, root_id, revision,
                    first_seen_at, last_seen_at, first_opened_at, last_opened_at
             FROM node_interactions WHERE node_id = ? AND collaborator_id = ?",
            params![node_id, collaborator_id],
            |row| {
                Ok(NodeInteraction {
                    node_id: row.get(0)?,
                    collaborator_id: row.get(1)?,
                    root_id: row.get(2)?,
                    revision: row.get(3)?,
                    first_seen_at: row.get(4)?,
                    last_seen_at: row.get(5)?,
                    first_opened_at: row.get(6)?,
                    last_opened_at: row.get(7)?,
                })
            },
        )
        .optional()?)
}

pub(crate) fn list_interactions(conn: &Connection, node_id: &str) -> Result<Vec<NodeInteraction>> {
    let mut stmt = conn.prepare(
        "SELECT collaborator_id FROM node_interactions WHERE node_id = ? ORDER BY collaborator_id",
    )?;
    let collaborators = stmt
        .query_map(params![node_id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut interactions = Vec::with_capacity(collaborators.len());
    for collaborator_id in collaborators {
        if let Some(interaction) = get_interaction(conn, node_id, &collaborator_id)? {
            interactions.push(interaction);
        }
    }
    Ok(interactions)
}

pub(crate) fn upsert_interaction(conn: &Connection, interaction: &NodeInteraction) -> Result<()> {
    conn.execute(
        "INSERT INTO node_interactions
            (node_id, collaborator_id, root_id, revision,
             first_seen_at, last_seen_at, first_opened_at, last_opened_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(node_id, collaborator_id) DO UPDATE SET
            revision = excluded.revision,
            first_seen_at = excluded.first_seen_at, last_seen_at = excluded.last_seen_at,
            first_opened_at = excluded.first_opened_at, last_opened_at = excluded.last_opened_at",
        params![
            interaction.node_id,
            interaction.collaborator_id,
            interaction.root_id,
            interaction.revision,
            interaction.first_seen_at,
            interaction.last_seen_at,
            interaction.first_opened_at,
            interaction.last_opened_at,
        ],
    )?;
    Ok(())
}

/// Remove reactions, interactions and the document attached to a node.
pub(crate) fn delete_node_satellites(conn: &Connection, node_id: &str) -> Result<()> {
    conn.execute("DELETE FROM node_reactions WHERE node_id = ?", params![node_id])?;
    conn.execute(
        "DELETE FROM node_interactions WHERE node_id = ?",
        params![node_id],
    )?;
    conn.execute("DELETE FROM documents WHERE id = ?", params![node_id])?;
    Ok(())
}
