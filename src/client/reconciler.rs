//! Client-side replica of one graph.
//!
//! The replica applies the participant's own edits optimistically, applies
//! remote events as id-keyed overwrites, and rolls back an optimistic edit
//! when the server refuses it. Remote application is idempotent, so a
//! duplicate delivery (for example the overlap between a re-join snapshot
//! and buffered events) changes nothing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::models::{ChatMessage, Comment, Edge, GraphSnapshot, Node, Note, Presence, SessionId};
use crate::sync::{Event, LockInfo, Mutation, Rejection};
use crate::{Error, Result};

/// What the caller should do after a refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// The optimistic copy was replaced with the last confirmed one.
    Restored(String),
    /// Local state cannot be repaired in place; re-join to re-fetch it.
    Resync,
    /// Nothing to undo.
    Unchanged,
}

/// An intent sent but not yet acknowledged.
#[derive(Debug, Clone)]
struct InFlight {
    kind: &'static str,
    node_id: Option<String>,
}

/// Local copy of one graph as seen by one session.
#[derive(Debug, Default)]
pub struct Replica {
    graph_id: String,
    session: Option<SessionId>,
    color: String,
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Edge>,
    notes: BTreeMap<String, Note>,
    comments: BTreeMap<String, Comment>,
    roster: Vec<Presence>,
    locks: HashMap<String, LockInfo>,
    chat: Vec<ChatMessage>,
    replies: HashMap<String, String>,
    /// Last server-confirmed version of nodes with pending local edits;
    /// `None` means the node did not exist before the edit
    confirmed: HashMap<String, Option<Node>>,
    in_flight: VecDeque<InFlight>,
}

impl Replica {
    pub fn new(graph_id: &str) -> Self {
        Self {
            graph_id: graph_id.to_string(),
            ..Self::default()
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Record who this replica belongs to.
    pub fn set_identity(&mut self, session: SessionId, color: &str) {
        self.session = Some(session);
        self.color = color.to_string();
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Replace all state with a fresh snapshot (initial join or re-join).
    pub fn load_snapshot(&mut self, snapshot: GraphSnapshot, roster: Vec<Presence>, locks: Vec<LockInfo>) {
        self.nodes = snapshot.nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        self.edges = snapshot.edges.into_iter().map(|e| (e.id.clone(), e)).collect();
        self.notes = snapshot.notes.into_iter().map(|n| (n.id.clone(), n)).collect();
        self.comments = snapshot.comments.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.roster = roster;
        self.locks = locks.into_iter().map(|l| (l.node_id.clone(), l)).collect();
        self.confirmed.clear();
        self.in_flight.clear();
    }

    fn is_self(&self, session: SessionId) -> bool {
        self.session == Some(session)
    }

    /// Fail if another session holds `node_id`.
    pub fn check_lock(&self, node_id: &str) -> Result<()> {
        match self.locks.get(node_id) {
            Some(lock) if !self.is_self(lock.holder) => Err(Error::LockConflict {
                node_id: node_id.to_string(),
                holder: lock.holder.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Apply a local edit optimistically and return the intent to send.
    ///
    /// Edits on nodes locked by another session are refused and leave the
    /// replica untouched.
    pub fn apply_local(&mut self, mutation: Mutation) -> Result<Mutation> {
        let node_id = mutation
            .created_node()
            .or_else(|| mutation.gated_node())
            .map(str::to_string);
        if let Some(id) = &node_id {
            self.check_lock(id)?;
            if !self.confirmed.contains_key(id) {
                self.confirmed.insert(id.clone(), self.nodes.get(id).cloned());
            }
        }
        self.in_flight.push_back(InFlight {
            kind: mutation.kind(),
            node_id,
        });

        self.apply_event(&mutation.to_event());
        Ok(mutation)
    }

    /// Apply an event from the room. Returns whether the replica changed.
    ///
    /// Mutation events originating from this replica's own session are
    /// ignored; they were already applied locally.
    pub fn apply_remote(&mut self, origin: Option<SessionId>, event: &Event) -> bool {
        if is_mutation_event(event) && origin.is_some_and(|o| self.is_self(o)) {
            return false;
        }
        if let Some(node_id) = touched_node(event) {
            self.confirmed.remove(node_id);
        }
        self.apply_event(event)
    }

    fn apply_event(&mut self, event: &Event) -> bool {
        match event {
            Event::AddNode { node }
            | Event::MoveNode { node }
            | Event::StopNode { node }
            | Event::UpdateNode { node } => self.put_node(node),
            Event::AddNodeEdge { node, edge } => {
                let a = self.put_node(node);
                let b = self.put_edge(edge);
                a || b
            }
            Event::AddEdge { edge } | Event::UpdateEdge { edge } => self.put_edge(edge),
            Event::DeleteNode { node_id } => {
                let removed = self.nodes.remove(node_id).is_some();
                let before = self.edges.len();
                self.edges.retain(|_, e| !e.touches(node_id));
                self.locks.remove(node_id);
                removed || self.edges.len() != before
            }
            Event::DeleteEdge { edge_id } => self.edges.remove(edge_id).is_some(),
            Event::LockNode {
                node_id,
                holder,
                color,
            } => {
                let lock = LockInfo {
                    node_id: node_id.clone(),
                    holder: *holder,
                    color: color.clone(),
                };
                self.locks.insert(node_id.clone(), lock.clone()) != Some(lock)
            }
            Event::UnlockNode { node_id } => self.locks.remove(node_id).is_some(),
            Event::UpdateRemoteCursor { presence } => {
                match self.roster.iter_mut().find(|p| p.session_id == presence.session_id) {
                    Some(existing) if existing == presence => false,
                    Some(existing) => {
                        *existing = presence.clone();
                        true
                    }
                    None => false,
                }
            }
            Event::AddComment { comment } => {
                if self.comments.contains_key(&comment.id) {
                    return false;
                }
                self.comments.insert(comment.id.clone(), comment.clone());
                true
            }
            Event::AddNote { note } => {
                if self.notes.contains_key(&note.id) {
                    return false;
                }
                self.notes.insert(note.id.clone(), note.clone());
                true
            }
            Event::Chat { message } => {
                if self.chat.iter().any(|m| m.id == message.id) {
                    return false;
                }
                self.chat.push(message.clone());
                true
            }
            Event::ChatComplete {
                message_id,
                reply,
                error,
            } => {
                let text = reply
                    .clone()
                    .or_else(|| error.as_ref().map(|e| format!("error: {}", e)))
                    .unwrap_or_default();
                self.replies.insert(message_id.clone(), text.clone()) != Some(text)
            }
            Event::Presence { roster } => {
                let present: HashSet<SessionId> = roster.iter().map(|p| p.session_id).collect();
                let locks_before = self.locks.len();
                self.locks.retain(|_, l| present.contains(&l.holder));
                let pruned = self.locks.len() != locks_before;
                if &self.roster == roster {
                    return pruned;
                }
                self.roster = roster.clone();
                true
            }
            Event::LayoutSettled { .. } => false,
        }
    }

    fn put_node(&mut self, node: &Node) -> bool {
        self.nodes.insert(node.id.clone(), node.clone()).as_ref() != Some(node)
    }

    fn put_edge(&mut self, edge: &Edge) -> bool {
        self.edges.insert(edge.id.clone(), edge.clone()).as_ref() != Some(edge)
    }

    /// The server accepted the request at the head of the queue.
    pub fn on_ack(&mut self, kind: &str, target: Option<&str>) {
        match (kind, target) {
            ("lock", Some(node_id)) => {
                if let Some(session) = self.session {
                    self.locks.insert(
                        node_id.to_string(),
                        LockInfo {
                            node_id: node_id.to_string(),
                            holder: session,
                            color: self.color.clone(),
                        },
                    );
                }
                return;
            }
            ("unlock", Some(node_id)) => {
                if self
                    .locks
                    .get(node_id)
                    .is_some_and(|l| self.session == Some(l.holder))
                {
                    self.locks.remove(node_id);
                }
                return;
            }
            _ => {}
        }

        if self.in_flight.front().is_some_and(|p| p.kind == kind) {
            if let Some(InFlight {
                node_id: Some(node_id),
                ..
            }) = self.in_flight.pop_front()
            {
                let still_pending = self
                    .in_flight
                    .iter()
                    .any(|p| p.node_id.as_deref() == Some(node_id.as_str()));
                if !still_pending {
                    self.confirmed.remove(&node_id);
                }
            }
        }
    }

    /// The server refused a request; undo its optimistic effect.
    pub fn on_rejected(&mut self, kind: &str, rejection: &Rejection) -> Reconcile {
        if let Rejection::LockHeld {
            node_id,
            holder,
            color,
        } = rejection
        {
            self.locks.insert(
                node_id.clone(),
                LockInfo {
                    node_id: node_id.clone(),
                    holder: *holder,
                    color: color.clone(),
                },
            );
        }

        if !self.in_flight.front().is_some_and(|p| p.kind == kind) {
            return Reconcile::Unchanged;
        }
        let Some(pending) = self.in_flight.pop_front() else {
            return Reconcile::Unchanged;
        };
        let Some(node_id) = pending.node_id else {
            // Edges, notes and comments carry no rollback copy.
            return Reconcile::Resync;
        };
        if pending.kind == "delete_node" || pending.kind == "add_node_edge" {
            return Reconcile::Resync;
        }

        match self.confirmed.remove(&node_id) {
            Some(Some(node)) => {
                self.nodes.insert(node_id.clone(), node);
                Reconcile::Restored(node_id)
            }
            Some(None) => {
                self.nodes.remove(&node_id);
                Reconcile::Restored(node_id)
            }
            None => Reconcile::Unchanged,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values()
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn roster(&self) -> &[Presence] {
        &self.roster
    }

    pub fn lock_holder(&self, node_id: &str) -> Option<SessionId> {
        self.locks.get(node_id).map(|l| l.holder)
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.chat
    }

    pub fn reply(&self, message_id: &str) -> Option<&str> {
        self.replies.get(message_id).map(String::as_str)
    }

    /// Number of sent intents awaiting a reply.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }
}

/// Events that mirror a [`Mutation`] and are therefore never echoed.
fn is_mutation_event(event: &Event) -> bool {
    matches!(
        event,
        Event::AddNode { .. }
            | Event::AddEdge { .. }
            | Event::AddNodeEdge { .. }
            | Event::MoveNode { .. }
            | Event::StopNode { .. }
            | Event::UpdateNode { .. }
            | Event::UpdateEdge { .. }
            | Event::DeleteNode { .. }
            | Event::DeleteEdge { .. }
            | Event::AddComment { .. }
            | Event::AddNote { .. }
    )
}

fn touched_node(event: &Event) -> Option<&str> {
    match event {
        Event::AddNode { node }
        | Event::MoveNode { node }
        | Event::StopNode { node }
        | Event::UpdateNode { node }
        | Event::AddNodeEdge { node, .. } => Some(&node.id),
        Event::DeleteNode { node_id } => Some(node_id),
        _ => None,
    }
}
