//! Data models for Cograph entities.
//!
//! This module defines the core data structures:
//! - `Graph` - A shared knowledge graph with sharing metadata and counts
//! - `Node` - A concept placed on the canvas, with a free-form typed payload
//! - `Edge` - A typed, directed relationship between two nodes of one graph
//! - `Note` / `Comment` - Append-only annotations attached to nodes or edges
//! - `Presence` - Ephemeral per-session membership and cursor state
//! - `ChatMessage` - A message queued for the conversational agent

pub mod graph;

pub use graph::GraphSnapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who can see a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            _ => Err(format!("Invalid visibility: {}", s)),
        }
    }
}

/// A shared knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Unique identifier (e.g., "g-1a2b3c4d")
    pub id: String,

    /// Graph title
    pub title: String,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// User that created the graph
    pub creator: String,

    /// Public or private
    #[serde(default)]
    pub visibility: Visibility,

    /// Users the graph has been shared with
    #[serde(default)]
    pub contributors: Vec<String>,

    /// Live node count, maintained by storage
    #[serde(default)]
    pub node_count: u64,

    /// Live edge count, maintained by storage
    #[serde(default)]
    pub edge_count: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Graph {
    /// Create a new empty private graph.
    pub fn new(id: String, title: String, creator: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            description: None,
            creator,
            visibility: Visibility::default(),
            contributors: Vec::new(),
            node_count: 0,
            edge_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A point on the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Free-form node payload.
///
/// `title` and `description` are common to every node type; anything else a
/// client sends (domain-specific fields) is kept verbatim in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Set while a participant is dragging the node
    #[serde(default)]
    pub is_moving: bool,

    /// Color of the participant currently interacting with the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picker_color: Option<String>,

    /// Session holding the edit lock, as last seen by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<SessionId>,

    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// A concept on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier, usually generated by the client that created it
    pub id: String,

    /// Owning graph
    pub graph_id: String,

    /// Type tag (e.g., "concept", "paper", "question")
    #[serde(rename = "type")]
    pub node_type: String,

    pub position: Position,

    #[serde(default)]
    pub data: NodeData,

    /// Hidden from the canvas
    #[serde(default)]
    pub hidden: bool,

    /// Whether participants may drag the node
    #[serde(default = "default_true")]
    pub draggable: bool,
}

impl Node {
    /// Create a new node with an empty payload.
    pub fn new(id: String, graph_id: String, node_type: String, position: Position) -> Self {
        Self {
            id,
            graph_id,
            node_type,
            position,
            data: NodeData::default(),
            hidden: false,
            draggable: true,
        }
    }

    /// Builder-style title setter.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.data.title = title.into();
        self
    }

    /// Copy of this node placed at `position`.
    pub fn moved_to(&self, position: Position) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }
}

/// Edge payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A typed, directed relationship between two nodes of the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,

    pub graph_id: String,

    /// Type tag (e.g., "supports", "contradicts", "cites")
    #[serde(rename = "type")]
    pub edge_type: String,

    /// Source node ID
    pub source: String,

    /// Target node ID
    pub target: String,

    #[serde(default)]
    pub data: EdgeData,
}

impl Edge {
    /// Create a new edge with an empty payload.
    pub fn new(id: String, graph_id: String, edge_type: String, source: String, target: String) -> Self {
        Self {
            id,
            graph_id,
            edge_type,
            source,
            target,
            data: EdgeData::default(),
        }
    }

    /// Whether either endpoint is `node_id`.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }

    /// The endpoint opposite to `node_id`, if the edge touches it.
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.source == node_id {
            Some(&self.target)
        } else if self.target == node_id {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// A sticky note attached to a node or edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub graph_id: String,
    pub created_at: DateTime<Utc>,
    pub author: String,
    /// Node or edge the note is pinned to
    pub target_id: String,
    pub color: String,
    pub text: String,
}

/// An inline comment on exactly one node or one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub graph_id: String,
    pub created_at: DateTime<Utc>,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub color: String,
    pub text: String,
}

impl Comment {
    /// The commented entity, if exactly one of `node_id` / `edge_id` is set.
    pub fn target(&self) -> Option<&str> {
        match (&self.node_id, &self.edge_id) {
            (Some(node), None) => Some(node),
            (None, Some(edge)) => Some(edge),
            _ => None,
        }
    }
}

/// Identifier of one live connection.
///
/// Lock holders and presence entries are keyed by session, not by user, so
/// one user with two open tabs holds two independent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Server-internal session used for layout write-back.
    pub const SYSTEM: SessionId = SessionId(Uuid::nil());

    /// Allocate a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn is_system(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the user behind a session, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    /// Display color used for cursors and lock indicators
    pub color: String,
}

/// Ephemeral presence of one session in one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub session_id: SessionId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
}

impl Presence {
    pub fn new(session_id: SessionId, participant: &Participant) -> Self {
        Self {
            session_id,
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            color: participant.color.clone(),
            cursor: None,
        }
    }
}

/// A message queued for the conversational agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub graph_id: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(graph_id: String, author: String, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            graph_id,
            author,
            text,
            created_at: Utc::now(),
        }
    }
}

/// Final position of one node after layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub node_id: String,
    pub position: Position,
}
