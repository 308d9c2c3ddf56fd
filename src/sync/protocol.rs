//! WebSocket protocol types for the sync server.
//!
//! # Protocol Overview
//!
//! The server exposes a WebSocket endpoint at `/ws`. Messages are JSON-encoded
//! and use a `type` field for discrimination.
//!
//! ## Client → Server Messages ([`ClientMessage`])
//! - `join` / `leave`: Enter or exit a graph room
//! - `mutate`: Submit a [`Mutation`] intent
//! - `lock` / `unlock`: Take or give back the edit lock on a node
//! - `cursor`: Move the remote cursor
//! - `chat`: Queue a message for the agent
//! - `layout`: Ask for a layout pass
//! - `ping`: Keepalive ping
//!
//! ## Server → Client Messages ([`ServerMessage`])
//! - `welcome`: Session id assigned on connect
//! - `joined` + `snapshot`: Roster, locks and full graph state after a join
//! - `event`: A room [`Event`] produced by another session (or the server)
//! - `ack` / `rejected`: Outcome of the session's own intent
//! - `resync`: The session fell behind and must re-join
//! - `left`, `pong`, `error`

use serde::{Deserialize, Serialize};
use std::fmt;

use super::locks::{LockConflict, LockInfo};
use crate::models::{
    ChatMessage, Comment, Edge, GraphSnapshot, Node, NodePosition, Note, Position, Presence,
    SessionId,
};

// ============================================================================
// Room events
// ============================================================================

/// Events fanned out to the members of one room.
///
/// Every mutation event carries the full entity so replicas can apply it as
/// an id-keyed overwrite without reading storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AddNode { node: Node },
    AddEdge { edge: Edge },
    /// Sibling node plus the edge connecting it, emitted as one event.
    AddNodeEdge { node: Node, edge: Edge },
    MoveNode { node: Node },
    StopNode { node: Node },
    UpdateNode { node: Node },
    UpdateEdge { edge: Edge },
    /// Incident edges are removed implicitly.
    DeleteNode { node_id: String },
    DeleteEdge { edge_id: String },
    LockNode {
        node_id: String,
        holder: SessionId,
        color: String,
    },
    UnlockNode { node_id: String },
    UpdateRemoteCursor { presence: Presence },
    AddComment { comment: Comment },
    AddNote { note: Note },
    Chat { message: ChatMessage },
    ChatComplete {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Updated roster after a join or leave.
    Presence { roster: Vec<Presence> },
    /// A layout run converged; positions were already sent as `update_node`.
    LayoutSettled {
        positions: Vec<NodePosition>,
        ticks: u32,
    },
}

impl Event {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AddNode { .. } => "add_node",
            Event::AddEdge { .. } => "add_edge",
            Event::AddNodeEdge { .. } => "add_node_edge",
            Event::MoveNode { .. } => "move_node",
            Event::StopNode { .. } => "stop_node",
            Event::UpdateNode { .. } => "update_node",
            Event::UpdateEdge { .. } => "update_edge",
            Event::DeleteNode { .. } => "delete_node",
            Event::DeleteEdge { .. } => "delete_edge",
            Event::LockNode { .. } => "lock_node",
            Event::UnlockNode { .. } => "unlock_node",
            Event::UpdateRemoteCursor { .. } => "update_remote_cursor",
            Event::AddComment { .. } => "add_comment",
            Event::AddNote { .. } => "add_note",
            Event::Chat { .. } => "chat",
            Event::ChatComplete { .. } => "chat_complete",
            Event::Presence { .. } => "presence",
            Event::LayoutSettled { .. } => "layout_settled",
        }
    }
}

// ============================================================================
// Mutation intents
// ============================================================================

/// A mutation intent submitted by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    AddNode { node: Node },
    AddEdge { edge: Edge },
    AddNodeEdge { node: Node, edge: Edge },
    MoveNode { node: Node },
    StopNode { node: Node },
    UpdateNode { node: Node },
    UpdateEdge { edge: Edge },
    DeleteNode { node_id: String },
    DeleteEdge { edge_id: String },
    AddComment { comment: Comment },
    AddNote { note: Note },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::AddNode { .. } => "add_node",
            Mutation::AddEdge { .. } => "add_edge",
            Mutation::AddNodeEdge { .. } => "add_node_edge",
            Mutation::MoveNode { .. } => "move_node",
            Mutation::StopNode { .. } => "stop_node",
            Mutation::UpdateNode { .. } => "update_node",
            Mutation::UpdateEdge { .. } => "update_edge",
            Mutation::DeleteNode { .. } => "delete_node",
            Mutation::DeleteEdge { .. } => "delete_edge",
            Mutation::AddComment { .. } => "add_comment",
            Mutation::AddNote { .. } => "add_note",
        }
    }

    /// Whether the graph's shape changes, which re-triggers layout.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Mutation::AddNode { .. }
                | Mutation::AddEdge { .. }
                | Mutation::AddNodeEdge { .. }
                | Mutation::DeleteNode { .. }
                | Mutation::DeleteEdge { .. }
        )
    }

    /// The node whose lock gates this mutation, if any.
    pub fn gated_node(&self) -> Option<&str> {
        match self {
            Mutation::MoveNode { node }
            | Mutation::StopNode { node }
            | Mutation::UpdateNode { node } => Some(&node.id),
            Mutation::DeleteNode { node_id } => Some(node_id),
            _ => None,
        }
    }

    /// The node this mutation creates, if any.
    pub fn created_node(&self) -> Option<&str> {
        match self {
            Mutation::AddNode { node } | Mutation::AddNodeEdge { node, .. } => Some(&node.id),
            _ => None,
        }
    }

    /// The room event announcing this mutation.
    pub fn to_event(&self) -> Event {
        match self.clone() {
            Mutation::AddNode { node } => Event::AddNode { node },
            Mutation::AddEdge { edge } => Event::AddEdge { edge },
            Mutation::AddNodeEdge { node, edge } => Event::AddNodeEdge { node, edge },
            Mutation::MoveNode { node } => Event::MoveNode { node },
            Mutation::StopNode { node } => Event::StopNode { node },
            Mutation::UpdateNode { node } => Event::UpdateNode { node },
            Mutation::UpdateEdge { edge } => Event::UpdateEdge { edge },
            Mutation::DeleteNode { node_id } => Event::DeleteNode { node_id },
            Mutation::DeleteEdge { edge_id } => Event::DeleteEdge { edge_id },
            Mutation::AddComment { comment } => Event::AddComment { comment },
            Mutation::AddNote { note } => Event::AddNote { note },
        }
    }
}

// ============================================================================
// Refusals
// ============================================================================

/// Why an intent was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// Another session holds the node's lock.
    LockHeld {
        node_id: String,
        holder: SessionId,
        color: String,
    },
    UnknownGraph { graph_id: String },
    /// The session has not joined the room it addressed.
    NotJoined { graph_id: String },
    /// Malformed ids, cross-graph references, missing endpoints.
    Invalid { message: String },
}

impl Rejection {
    pub fn invalid(message: impl Into<String>) -> Self {
        Rejection::Invalid {
            message: message.into(),
        }
    }
}

impl From<LockConflict> for Rejection {
    fn from(conflict: LockConflict) -> Self {
        Rejection::LockHeld {
            node_id: conflict.node_id,
            holder: conflict.holder,
            color: conflict.color,
        }
    }
}

impl From<Rejection> for crate::Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::LockHeld {
                node_id, holder, ..
            } => crate::Error::LockConflict {
                node_id,
                holder: holder.to_string(),
            },
            Rejection::UnknownGraph { graph_id } => {
                crate::Error::NotFound(format!("Graph not found: {}", graph_id))
            }
            Rejection::NotJoined { graph_id } => crate::Error::NotInRoom(graph_id),
            Rejection::Invalid { message } => crate::Error::InvalidInput(message),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::LockHeld {
                node_id, holder, ..
            } => write!(f, "node {} is locked by session {}", node_id, holder),
            Rejection::UnknownGraph { graph_id } => write!(f, "unknown graph {}", graph_id),
            Rejection::NotJoined { graph_id } => write!(f, "not joined to graph {}", graph_id),
            Rejection::Invalid { message } => write!(f, "invalid: {}", message),
        }
    }
}

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Messages sent from clients to the sync server.
///
/// # Examples
///
/// ```json
/// {"type": "join", "graph_id": "g-1a2b3c4d", "user_id": "u1", "color": "#e91e63"}
/// {"type": "lock", "graph_id": "g-1a2b3c4d", "node_id": "n1"}
/// {"type": "mutate", "graph_id": "g-1a2b3c4d", "mutation": {"kind": "move_node", "node": {...}}}
/// {"type": "ping"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        graph_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        color: String,
    },
    Leave {
        graph_id: String,
    },
    Mutate {
        graph_id: String,
        mutation: Mutation,
    },
    Lock {
        graph_id: String,
        node_id: String,
    },
    Unlock {
        graph_id: String,
        node_id: String,
    },
    Cursor {
        graph_id: String,
        position: Position,
    },
    Chat {
        graph_id: String,
        text: String,
    },
    Layout {
        graph_id: String,
    },
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Messages sent from the sync server to clients.
///
/// # Examples
///
/// ```json
/// {"type": "welcome", "session_id": "8d3c..."}
/// {"type": "event", "graph_id": "g-1a2b3c4d", "origin": "8d3c...", "event": {"type": "move_node", "node": {...}}}
/// {"type": "rejected", "graph_id": "g-1a2b3c4d", "rejection": {"reason": "lock_held", ...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        session_id: SessionId,
    },
    Joined {
        graph_id: String,
        session_id: SessionId,
        roster: Vec<Presence>,
        locks: Vec<LockInfo>,
    },
    Snapshot {
        graph_id: String,
        /// Boxed to keep the enum small.
        snapshot: Box<GraphSnapshot>,
    },
    Event {
        graph_id: String,
        /// Originating session, absent for server-generated events.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<SessionId>,
        event: Event,
    },
    /// The session's own request was accepted.
    Ack {
        graph_id: String,
        /// Request kind: a mutation kind, or `lock`, `unlock`, `chat`, `layout`
        kind: String,
        /// Node the request addressed, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// The session's own request was refused. Sent only to that session.
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        graph_id: Option<String>,
        kind: String,
        rejection: Rejection,
    },
    /// Events were dropped for this session; re-join to recover.
    Resync {
        graph_id: String,
        missed: u64,
    },
    Left {
        graph_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}
