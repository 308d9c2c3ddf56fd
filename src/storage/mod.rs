//! Storage layer for Cograph data.
//!
//! This module persists graphs, nodes, edges, notes and comments.
//!
//! The sync core only talks to storage through the [`GraphStore`] trait.
//! [`Storage`] implements it on SQLite:
//!
//! - Node and edge writes are idempotent upserts keyed by `(graph_id, id)`
//! - Notes and comments are append-only and deduplicated by id
//! - Deleting a node cascades to its edges; deleting a graph cascades to everything
//! - `node_count` / `edge_count` are recomputed from live rows after every
//!   structural write, so they can never drift or go negative

use crate::models::{Comment, Edge, EdgeData, Graph, GraphSnapshot, Node, NodeData, Note, Position};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Maximum identifier length in bytes.
pub const MAX_ID_LEN: usize = 128;

/// The persistence contract the sync core depends on.
///
/// Every write is keyed by the entity id so that replays (duplicate delivery,
/// re-sent intents after reconnect) are harmless overwrites.
pub trait GraphStore: Send {
    /// Create a new graph. Fails if the id is taken.
    fn create_graph(&mut self, graph: &Graph) -> Result<()>;

    /// Get a graph by ID.
    fn get_graph(&self, id: &str) -> Result<Graph>;

    /// List all graphs, newest first.
    fn list_graphs(&self) -> Result<Vec<Graph>>;

    /// Delete a graph and everything in it.
    fn delete_graph(&mut self, id: &str) -> Result<()>;

    fn graph_exists(&self, id: &str) -> Result<bool>;

    fn node_exists(&self, graph_id: &str, node_id: &str) -> Result<bool>;

    /// Insert or overwrite a node.
    fn create_node(&mut self, node: &Node) -> Result<()>;

    /// Overwrite an existing node. Fails with `NotFound` if it does not exist.
    fn update_node(&mut self, node: &Node) -> Result<()>;

    /// Delete a node and its incident edges.
    ///
    /// Returns the ids of the edges removed by the cascade. Deleting a node
    /// that does not exist is a no-op.
    fn delete_node(&mut self, graph_id: &str, node_id: &str) -> Result<Vec<String>>;

    /// Insert or overwrite an edge. Both endpoints must exist in the graph.
    fn create_edge(&mut self, edge: &Edge) -> Result<()>;

    /// Overwrite an existing edge.
    fn update_edge(&mut self, edge: &Edge) -> Result<()>;

    /// Delete an edge. Deleting an edge that does not exist is a no-op.
    fn delete_edge(&mut self, graph_id: &str, edge_id: &str) -> Result<()>;

    /// Append a note. Returns `false` if a note with this id already exists.
    fn add_note(&mut self, note: &Note) -> Result<bool>;

    /// Append a comment. Returns `false` if a comment with this id already exists.
    fn add_comment(&mut self, comment: &Comment) -> Result<bool>;

    /// Read the full state of a graph.
    fn read_graph(&self, graph_id: &str) -> Result<GraphSnapshot>;
}

/// Storage handle shared between the sync core and the HTTP layer.
pub type SharedStore = Arc<Mutex<dyn GraphStore>>;

/// SQLite-backed graph store.
pub struct Storage {
    /// Database file, `None` for in-memory stores
    path: Option<PathBuf>,
    conn: Connection,
}

impl Storage {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn,
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { path: None, conn })
    }

    /// Database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Wrap this store for sharing with the server.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS graphs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                creator TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'private',
                contributors TEXT NOT NULL DEFAULT '[]',
                node_count INTEGER NOT NULL DEFAULT 0,
                edge_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                graph_id TEXT NOT NULL,
                id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                x REAL NOT NULL,
                y REAL NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                hidden INTEGER NOT NULL DEFAULT 0,
                draggable INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (graph_id, id),
                FOREIGN KEY (graph_id) REFERENCES graphs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS edges (
                graph_id TEXT NOT NULL,
                id TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (graph_id, id),
                FOREIGN KEY (graph_id) REFERENCES graphs(id) ON DELETE CASCADE,
                FOREIGN KEY (graph_id, source) REFERENCES nodes(graph_id, id) ON DELETE CASCADE,
                FOREIGN KEY (graph_id, target) REFERENCES nodes(graph_id, id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS notes (
                graph_id TEXT NOT NULL,
                id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                author TEXT NOT NULL,
                target_id TEXT NOT NULL,
                color TEXT NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (graph_id, id),
                FOREIGN KEY (graph_id) REFERENCES graphs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS comments (
                graph_id TEXT NOT NULL,
                id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                author TEXT NOT NULL,
                node_id TEXT,
                edge_id TEXT,
                color TEXT NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (graph_id, id),
                FOREIGN KEY (graph_id) REFERENCES graphs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(graph_id, source);
            CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(graph_id, target);
            CREATE INDEX IF NOT EXISTS idx_notes_target ON notes(graph_id, target_id);
            CREATE INDEX IF NOT EXISTS idx_comments_node ON comments(graph_id, node_id);
            CREATE INDEX IF NOT EXISTS idx_comments_edge ON comments(graph_id, edge_id);
            "#,
        )?;
        Ok(())
    }

    /// Recompute the cached counts of a graph from its live rows.
    fn refresh_counts(&self, graph_id: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE graphs SET
                node_count = (SELECT COUNT(*) FROM nodes WHERE graph_id = ?1),
                edge_count = (SELECT COUNT(*) FROM edges WHERE graph_id = ?1),
                updated_at = ?2
            WHERE id = ?1
            "#,
            params![graph_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn require_graph(&self, graph_id: &str) -> Result<()> {
        if self.graph_exists(graph_id)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Graph not found: {}", graph_id)))
        }
    }

    fn edge_exists(&self, graph_id: &str, edge_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE graph_id = ?1 AND id = ?2",
            params![graph_id, edge_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_nodes(&self, graph_id: &str) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare(
            "SELECT graph_id, id, node_type, x, y, data, hidden, draggable
             FROM nodes WHERE graph_id = ?1 ORDER BY rowid",
        )?;
        let nodes = stmt
            .query_map([graph_id], node_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn list_edges(&self, graph_id: &str) -> Result<Vec<Edge>> {
        let mut stmt = self.conn.prepare(
            "SELECT graph_id, id, edge_type, source, target, data
             FROM edges WHERE graph_id = ?1 ORDER BY rowid",
        )?;
        let edges = stmt
            .query_map([graph_id], edge_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    fn list_notes(&self, graph_id: &str) -> Result<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT graph_id, id, created_at, author, target_id, color, text
             FROM notes WHERE graph_id = ?1 ORDER BY created_at, rowid",
        )?;
        let notes = stmt
            .query_map([graph_id], |row| {
                Ok(Note {
                    graph_id: row.get(0)?,
                    id: row.get(1)?,
                    created_at: time_column(row, 2)?,
                    author: row.get(3)?,
                    target_id: row.get(4)?,
                    color: row.get(5)?,
                    text: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    fn list_comments(&self, graph_id: &str) -> Result<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            "SELECT graph_id, id, created_at, author, node_id, edge_id, color, text
             FROM comments WHERE graph_id = ?1 ORDER BY created_at, rowid",
        )?;
        let comments = stmt
            .query_map([graph_id], |row| {
                Ok(Comment {
                    graph_id: row.get(0)?,
                    id: row.get(1)?,
                    created_at: time_column(row, 2)?,
                    author: row.get(3)?,
                    node_id: row.get(4)?,
                    edge_id: row.get(5)?,
                    color: row.get(6)?,
                    text: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(comments)
    }
}

impl GraphStore for Storage {
    fn create_graph(&mut self, graph: &Graph) -> Result<()> {
        validate_id(&graph.id)?;
        if self.graph_exists(&graph.id)? {
            return Err(Error::InvalidInput(format!("Graph already exists: {}", graph.id)));
        }

        self.conn.execute(
            r#"
            INSERT INTO graphs
            (id, title, description, creator, visibility, contributors, node_count, edge_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8)
            "#,
            params![
                graph.id,
                graph.title,
                graph.description,
                graph.creator,
                graph.visibility.as_str(),
                serde_json::to_string(&graph.contributors)?,
                graph.created_at.to_rfc3339(),
                graph.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_graph(&self, id: &str) -> Result<Graph> {
        self.conn
            .query_row(
                "SELECT id, title, description, creator, visibility, contributors,
                        node_count, edge_count, created_at, updated_at
                 FROM graphs WHERE id = ?1",
                [id],
                graph_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Graph not found: {}", id)))
    }

    fn list_graphs(&self) -> Result<Vec<Graph>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, creator, visibility, contributors,
                    node_count, edge_count, created_at, updated_at
             FROM graphs ORDER BY created_at DESC, id",
        )?;
        let graphs = stmt
            .query_map([], graph_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(graphs)
    }

    fn delete_graph(&mut self, id: &str) -> Result<()> {
        let deleted = self.conn.execute("DELETE FROM graphs WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Graph not found: {}", id)));
        }
        Ok(())
    }

    fn graph_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM graphs WHERE id = ?1", [id], |row| row.get(0))?;
        Ok(count > 0)
    }

    fn node_exists(&self, graph_id: &str, node_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE graph_id = ?1 AND id = ?2",
            params![graph_id, node_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_node(&mut self, node: &Node) -> Result<()> {
        validate_id(&node.id)?;
        self.require_graph(&node.graph_id)?;

        self.conn.execute(
            r#"
            INSERT INTO nodes (graph_id, id, node_type, x, y, data, hidden, draggable)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(graph_id, id) DO UPDATE SET
                node_type = excluded.node_type,
                x = excluded.x,
                y = excluded.y,
                data = excluded.data,
                hidden = excluded.hidden,
                draggable = excluded.draggable
            "#,
            params![
                node.graph_id,
                node.id,
                node.node_type,
                node.position.x,
                node.position.y,
                serde_json::to_string(&node.data)?,
                node.hidden,
                node.draggable,
            ],
        )?;
        self.refresh_counts(&node.graph_id)
    }

    fn update_node(&mut self, node: &Node) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE nodes SET node_type = ?3, x = ?4, y = ?5, data = ?6, hidden = ?7, draggable = ?8
            WHERE graph_id = ?1 AND id = ?2
            "#,
            params![
                node.graph_id,
                node.id,
                node.node_type,
                node.position.x,
                node.position.y,
                serde_json::to_string(&node.data)?,
                node.hidden,
                node.draggable,
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!(
                "Node not found: {} in graph {}",
                node.id, node.graph_id
            )));
        }
        Ok(())
    }

    fn delete_node(&mut self, graph_id: &str, node_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM edges WHERE graph_id = ?1 AND (source = ?2 OR target = ?2) ORDER BY rowid",
        )?;
        let cascaded = stmt
            .query_map(params![graph_id, node_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        drop(stmt);

        let deleted = self.conn.execute(
            "DELETE FROM nodes WHERE graph_id = ?1 AND id = ?2",
            params![graph_id, node_id],
        )?;
        if deleted == 0 {
            return Ok(Vec::new());
        }

        self.refresh_counts(graph_id)?;
        Ok(cascaded)
    }

    fn create_edge(&mut self, edge: &Edge) -> Result<()> {
        validate_id(&edge.id)?;
        self.require_graph(&edge.graph_id)?;
        for endpoint in [&edge.source, &edge.target] {
            if !self.node_exists(&edge.graph_id, endpoint)? {
                return Err(Error::InvalidInput(format!(
                    "Edge {} references missing node {} in graph {}",
                    edge.id, endpoint, edge.graph_id
                )));
            }
        }

        self.conn.execute(
            r#"
            INSERT INTO edges (graph_id, id, edge_type, source, target, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(graph_id, id) DO UPDATE SET
                edge_type = excluded.edge_type,
                source = excluded.source,
                target = excluded.target,
                data = excluded.data
            "#,
            params![
                edge.graph_id,
                edge.id,
                edge.edge_type,
                edge.source,
                edge.target,
                serde_json::to_string(&edge.data)?,
            ],
        )?;
        self.refresh_counts(&edge.graph_id)
    }

    fn update_edge(&mut self, edge: &Edge) -> Result<()> {
        if !self.edge_exists(&edge.graph_id, &edge.id)? {
            return Err(Error::NotFound(format!(
                "Edge not found: {} in graph {}",
                edge.id, edge.graph_id
            )));
        }
        self.create_edge(edge)
    }

    fn delete_edge(&mut self, graph_id: &str, edge_id: &str) -> Result<()> {
        let deleted = self.conn.execute(
            "DELETE FROM edges WHERE graph_id = ?1 AND id = ?2",
            params![graph_id, edge_id],
        )?;
        if deleted > 0 {
            self.refresh_counts(graph_id)?;
        }
        Ok(())
    }

    fn add_note(&mut self, note: &Note) -> Result<bool> {
        validate_id(&note.id)?;
        self.require_graph(&note.graph_id)?;

        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO notes (graph_id, id, created_at, author, target_id, color, text)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                note.graph_id,
                note.id,
                note.created_at.to_rfc3339(),
                note.author,
                note.target_id,
                note.color,
                note.text,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn add_comment(&mut self, comment: &Comment) -> Result<bool> {
        validate_id(&comment.id)?;
        if comment.target().is_none() {
            return Err(Error::InvalidInput(format!(
                "Comment {} must target exactly one node or edge",
                comment.id
            )));
        }
        self.require_graph(&comment.graph_id)?;

        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO comments (graph_id, id, created_at, author, node_id, edge_id, color, text)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                comment.graph_id,
                comment.id,
                comment.created_at.to_rfc3339(),
                comment.author,
                comment.node_id,
                comment.edge_id,
                comment.color,
                comment.text,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn read_graph(&self, graph_id: &str) -> Result<GraphSnapshot> {
        let graph = self.get_graph(graph_id)?;
        Ok(GraphSnapshot {
            nodes: self.list_nodes(graph_id)?,
            edges: self.list_edges(graph_id)?,
            notes: self.list_notes(graph_id)?,
            comments: self.list_comments(graph_id)?,
            graph,
        })
    }
}

fn graph_from_row(row: &Row<'_>) -> rusqlite::Result<Graph> {
    let visibility: String = row.get(4)?;
    let node_count: i64 = row.get(6)?;
    let edge_count: i64 = row.get(7)?;
    Ok(Graph {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        creator: row.get(3)?,
        visibility: visibility.parse().unwrap_or_default(),
        contributors: json_column(row, 5)?,
        node_count: node_count.max(0) as u64,
        edge_count: edge_count.max(0) as u64,
        created_at: time_column(row, 8)?,
        updated_at: time_column(row, 9)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let data: NodeData = json_column(row, 5)?;
    Ok(Node {
        graph_id: row.get(0)?,
        id: row.get(1)?,
        node_type: row.get(2)?,
        position: Position::new(row.get(3)?, row.get(4)?),
        data,
        hidden: row.get(6)?,
        draggable: row.get(7)?,
    })
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    let data: EdgeData = json_column(row, 5)?;
    Ok(Edge {
        graph_id: row.get(0)?,
        id: row.get(1)?,
        edge_type: row.get(2)?,
        source: row.get(3)?,
        target: row.get(4)?,
        data,
    })
}

/// Decode a JSON text column.
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode an RFC 3339 timestamp column.
fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Environment variable that relocates the data directory.
pub const DATA_DIR_ENV: &str = "COGRAPH_DATA_DIR";

/// Default database location.
///
/// Uses `$COGRAPH_DATA_DIR` when set, otherwise the platform data directory
/// (e.g. `~/.local/share`), with `cograph/cograph.db` appended.
pub fn default_database_path() -> Result<PathBuf> {
    let data_dir = match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_dir()
            .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?,
    };
    Ok(data_dir.join("cograph").join("cograph.db"))
}

/// Generate a unique ID.
///
/// Format: `<prefix>-<8 hex chars>`, e.g. `g-1a2b3c4d` for graphs.
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    let hash = hasher.finalize();
    let hash_hex = format!("{:x}", hash);
    format!("{}-{}", prefix, &hash_hex[..8])
}

/// Validate an entity identifier.
///
/// Ids are opaque but must be non-empty, at most [`MAX_ID_LEN`] bytes, and
/// free of whitespace and control characters.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId("ID must not be empty".to_string()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidId(format!(
            "ID must be at most {} bytes, got {} bytes",
            MAX_ID_LEN,
            id.len()
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidId(format!(
            "ID must not contain whitespace or control characters: {:?}",
            id
        )));
    }
    Ok(())
}
