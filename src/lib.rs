//! Cograph - real-time synchronization core for collaborative knowledge graphs.
//!
//! This library provides the pieces behind the `cograph` server and CLI:
//! room membership, advisory node locks, per-graph event fan-out, mutation
//! sequencing, force-directed layout stabilization, the chat dispatch queue,
//! and the client-side replica that reconciles remote events.

pub mod agent;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod logging;
pub mod models;
pub mod server;
pub mod storage;
pub mod sync;

/// Test utilities for isolated test environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::models::{Graph, Node, Participant, Position};
    use crate::storage::{GraphStore, SharedStore, Storage};

    /// Graph id seeded by [`seeded_store`].
    pub const GRAPH: &str = "g-test";

    /// Open an in-memory store containing one empty graph.
    pub fn seeded_storage() -> Storage {
        let mut storage = Storage::open_in_memory().unwrap();
        storage
            .create_graph(&Graph::new(GRAPH.to_string(), "Test graph".to_string(), "alice".to_string()))
            .unwrap();
        storage
    }

    /// Shared in-memory store containing one empty graph.
    pub fn seeded_store() -> SharedStore {
        Arc::new(Mutex::new(seeded_storage()))
    }

    /// Participant with a color derived from the user id.
    pub fn participant(user_id: &str) -> Participant {
        Participant {
            user_id: user_id.to_string(),
            display_name: user_id.to_uppercase(),
            color: format!("#{:06x}", user_id.len() * 0x111111),
        }
    }

    /// A concept node in [`GRAPH`] at the given position.
    pub fn node(id: &str, x: f64, y: f64) -> Node {
        Node::new(
            id.to_string(),
            GRAPH.to_string(),
            "concept".to_string(),
            Position::new(x, y),
        )
    }
}

/// Library-level error type for Cograph operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Node {node_id} is locked by session {holder}")]
    LockConflict { node_id: String, holder: String },

    #[error("Session is not a member of room {0}")]
    NotInRoom(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Cograph operations.
pub type Result<T> = std::result::Result<T, Error>;
