//! Mutation sequencing.
//!
//! The coordinator is the only writer of room lock tables besides the
//! registry. Every intent runs inside its room's critical section:
//! membership, lock and endpoint checks, then the broadcast, then the write to
//! storage. Persisting inside the same section keeps the stored order equal
//! to the broadcast order; a failed write is logged and never retracts the
//! broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::layout::LayoutHandle;
use super::locks::Acquire;
use super::protocol::{Event, Mutation, Rejection};
use super::room::RoomRegistry;
use super::session::{PendingAction, SessionContext};
use crate::models::{Node, NodePosition, Position, SessionId};
use crate::storage::{validate_id, SharedStore};
use crate::{Error, Result};

/// An accepted mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub kind: &'static str,
    pub event: Event,
    /// Focus lock given back as part of this mutation (`add_node_edge`, `stop_node`)
    pub unlocked: Option<String>,
}

/// Validates, sequences and publishes mutation intents.
pub struct MutationCoordinator {
    registry: Arc<RoomRegistry>,
    store: SharedStore,
    layout: Option<LayoutHandle>,
}

impl MutationCoordinator {
    pub fn new(registry: Arc<RoomRegistry>, store: SharedStore, layout: Option<LayoutHandle>) -> Self {
        Self {
            registry,
            store,
            layout,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Request a layout run, if a stabilizer is attached.
    pub fn trigger_layout(&self, graph_id: &str) -> bool {
        match &self.layout {
            Some(layout) => {
                layout.trigger(graph_id);
                true
            }
            None => false,
        }
    }

    /// Validate and apply one mutation intent from `ctx`.
    pub async fn apply(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
        mutation: Mutation,
    ) -> std::result::Result<Applied, Rejection> {
        validate_mutation(graph_id, &mutation)?;

        let session = ctx.session_id();
        let kind = mutation.kind();
        let event = mutation.to_event();
        let mut unlocked = None;

        let room = self.registry.room(graph_id).await;
        if room.is_none() && !ctx.is_system() {
            return Err(Rejection::NotJoined {
                graph_id: graph_id.to_string(),
            });
        }

        // Room critical section. `state` is None only for the system
        // session writing to a graph nobody is viewing.
        let mut state = match room.as_deref() {
            Some(room) => Some(room.lock().await),
            None => None,
        };

        if let (Some(room), Some(state)) = (room.as_deref(), state.as_mut()) {
            if !ctx.is_system() && !state.is_member(session) {
                return Err(Rejection::NotJoined {
                    graph_id: graph_id.to_string(),
                });
            }

            // Re-adding an existing id overwrites it.
            for node_id in mutation.gated_node().into_iter().chain(mutation.created_node()) {
                if let Err(conflict) = state.locks.check(node_id, session) {
                    tracing::debug!(
                        graph_id,
                        kind,
                        node_id,
                        session = %session,
                        holder = %conflict.holder,
                        "mutation dropped: node locked"
                    );
                    return Err(conflict.into());
                }
            }

            // Must stay inside the critical section; delete_node races it otherwise.
            self.check_endpoints(graph_id, &mutation).await?;

            room.bus().publish(session, event.clone());

            match &mutation {
                Mutation::AddNodeEdge { .. } | Mutation::StopNode { .. } => {
                    let focus = match &mutation {
                        Mutation::StopNode { node } => Some(node.id.clone()),
                        _ => ctx.focused_in(graph_id).map(str::to_string),
                    };
                    if let Some(node_id) = focus {
                        if state.locks.release(&node_id, session) {
                            room.bus().publish_all(
                                Some(session),
                                Event::UnlockNode {
                                    node_id: node_id.clone(),
                                },
                            );
                            unlocked = Some(node_id);
                        }
                    }
                    ctx.clear_focus();
                }
                Mutation::DeleteNode { node_id } => {
                    // Deletion ends the edit lifecycle without an unlock event.
                    state.locks.discard(node_id);
                    if ctx.focused_in(graph_id) == Some(node_id.as_str()) {
                        ctx.clear_focus();
                    }
                }
                Mutation::MoveNode { node } | Mutation::UpdateNode { node } => {
                    if ctx.focused_in(graph_id) == Some(node.id.as_str()) {
                        ctx.set_pending(PendingAction::Update);
                    }
                }
                _ => {}
            }
        } else {
            self.check_endpoints(graph_id, &mutation).await?;
        }

        self.persist(graph_id, &mutation).await;
        drop(state);

        if mutation.is_structural() {
            self.trigger_layout(graph_id);
        }

        tracing::debug!(graph_id, kind, session = %session, "mutation applied");
        Ok(Applied {
            kind,
            event,
            unlocked,
        })
    }

    /// Endpoint existence for edge writes. Callers hold the room guard.
    async fn check_endpoints(
        &self,
        graph_id: &str,
        mutation: &Mutation,
    ) -> std::result::Result<(), Rejection> {
        let (edge, new_node) = match mutation {
            Mutation::AddEdge { edge } | Mutation::UpdateEdge { edge } => (edge, None),
            Mutation::AddNodeEdge { node, edge } => (edge, Some(node.id.as_str())),
            _ => return Ok(()),
        };

        let store = self.store.lock().await;
        for endpoint in [&edge.source, &edge.target] {
            if Some(endpoint.as_str()) == new_node {
                continue;
            }
            match store.node_exists(graph_id, endpoint) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(Rejection::invalid(format!(
                        "edge {} references missing node {}",
                        edge.id, endpoint
                    )));
                }
                Err(e) => {
                    tracing::warn!(graph_id, error = %e, "endpoint check failed");
                    return Err(Rejection::invalid("storage unavailable"));
                }
            }
        }
        Ok(())
    }

    /// Write an accepted mutation. Failures are logged only.
    async fn persist(&self, graph_id: &str, mutation: &Mutation) {
        let mut store = self.store.lock().await;
        let result = match mutation {
            Mutation::AddNode { node } => store.create_node(node),
            Mutation::AddEdge { edge } => store.create_edge(edge),
            Mutation::AddNodeEdge { node, edge } => {
                store.create_node(node).and_then(|()| store.create_edge(edge))
            }
            Mutation::MoveNode { node }
            | Mutation::StopNode { node }
            | Mutation::UpdateNode { node } => store.update_node(node),
            Mutation::UpdateEdge { edge } => store.update_edge(edge),
            Mutation::DeleteNode { node_id } => store.delete_node(graph_id, node_id).map(|_| ()),
            Mutation::DeleteEdge { edge_id } => store.delete_edge(graph_id, edge_id),
            Mutation::AddComment { comment } => store.add_comment(comment).map(|_| ()),
            Mutation::AddNote { note } => store.add_note(note).map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(
                graph_id,
                kind = mutation.kind(),
                error = %e,
                "persist failed; broadcast stands"
            );
        }
    }

    /// Take the edit lock on a node and announce it to the room.
    pub async fn lock(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
        node_id: &str,
    ) -> std::result::Result<Acquire, Rejection> {
        validate_id(node_id).map_err(|e| Rejection::invalid(e.to_string()))?;
        let session = ctx.session_id();
        let not_joined = || Rejection::NotJoined {
            graph_id: graph_id.to_string(),
        };

        let room = self.registry.room(graph_id).await.ok_or_else(not_joined)?;
        let mut state = room.lock().await;
        let color = state
            .presence(session)
            .map(|p| p.color.clone())
            .ok_or_else(not_joined)?;

        let outcome = state.locks.acquire(node_id, session, &color).map_err(|conflict| {
            tracing::debug!(
                graph_id,
                node_id,
                session = %session,
                holder = %conflict.holder,
                "lock refused"
            );
            Rejection::from(conflict)
        })?;

        if outcome == Acquire::Granted {
            room.bus().publish(
                session,
                Event::LockNode {
                    node_id: node_id.to_string(),
                    holder: session,
                    color,
                },
            );
        }
        ctx.focus(graph_id, node_id);
        Ok(outcome)
    }

    /// Give back a lock. Returns whether the session actually held it.
    pub async fn unlock(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
        node_id: &str,
    ) -> std::result::Result<bool, Rejection> {
        let session = ctx.session_id();
        let room = self
            .registry
            .room(graph_id)
            .await
            .ok_or_else(|| Rejection::NotJoined {
                graph_id: graph_id.to_string(),
            })?;
        let mut state = room.lock().await;

        let released = state.locks.release(node_id, session);
        if released {
            room.bus().publish(
                session,
                Event::UnlockNode {
                    node_id: node_id.to_string(),
                },
            );
        }
        if ctx.focused_in(graph_id) == Some(node_id) {
            ctx.clear_focus();
        }
        Ok(released)
    }

    /// Nodes currently locked in a graph.
    pub async fn locked_nodes(&self, graph_id: &str) -> HashSet<String> {
        self.registry
            .locks(graph_id)
            .await
            .into_iter()
            .map(|lock| lock.node_id)
            .collect()
    }

    /// Write converged layout positions back as the system session.
    ///
    /// Emits one `update_node` per written node followed by a single
    /// `layout_settled`. `baseline` holds each node's stored position as the
    /// simulation read it. Nodes locked at write time, nodes deleted during
    /// the run, and nodes whose stored position no longer matches the
    /// baseline are skipped. Returns the number of nodes written.
    pub async fn apply_layout(
        &self,
        graph_id: &str,
        positions: Vec<NodePosition>,
        ticks: u32,
        baseline: &HashMap<String, Position>,
    ) -> Result<usize> {
        let room = self.registry.room(graph_id).await;
        let state = match room.as_deref() {
            Some(room) => Some(room.lock().await),
            None => None,
        };

        let mut store = self.store.lock().await;
        let snapshot = match store.read_graph(graph_id) {
            Ok(snapshot) => snapshot,
            Err(Error::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        let current: HashMap<&str, &Node> =
            snapshot.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut written = Vec::with_capacity(positions.len());
        for target in positions {
            if state
                .as_ref()
                .is_some_and(|s| s.locks.is_locked(&target.node_id))
            {
                continue;
            }
            let Some(node) = current.get(target.node_id.as_str()) else {
                continue;
            };
            if baseline.get(&target.node_id) != Some(&node.position) {
                tracing::debug!(graph_id, node_id = %target.node_id, "node moved during layout; skipped");
                continue;
            }

            let updated = node.moved_to(target.position);
            if let Some(room) = room.as_deref() {
                room.bus().publish_all(
                    Some(SessionId::SYSTEM),
                    Event::UpdateNode {
                        node: updated.clone(),
                    },
                );
            }
            if let Err(e) = store.update_node(&updated) {
                tracing::warn!(graph_id, node_id = %updated.id, error = %e, "layout write failed");
            }
            written.push(target);
        }

        let count = written.len();
        if let Some(room) = room.as_deref() {
            room.bus().publish_all(
                Some(SessionId::SYSTEM),
                Event::LayoutSettled {
                    positions: written,
                    ticks,
                },
            );
        }
        Ok(count)
    }
}

/// Shape checks that need no storage access.
fn validate_mutation(graph_id: &str, mutation: &Mutation) -> std::result::Result<(), Rejection> {
    let invalid = |e: Error| Rejection::invalid(e.to_string());
    let same_graph = |entity: &str, id: &str, owner: &str| {
        if owner == graph_id {
            Ok(())
        } else {
            Err(Rejection::invalid(format!(
                "{} {} belongs to graph {}, not {}",
                entity, id, owner, graph_id
            )))
        }
    };

    match mutation {
        Mutation::AddNode { node }
        | Mutation::MoveNode { node }
        | Mutation::StopNode { node }
        | Mutation::UpdateNode { node } => {
            validate_id(&node.id).map_err(invalid)?;
            same_graph("node", &node.id, &node.graph_id)
        }
        Mutation::AddEdge { edge } | Mutation::UpdateEdge { edge } => {
            validate_id(&edge.id).map_err(invalid)?;
            same_graph("edge", &edge.id, &edge.graph_id)
        }
        Mutation::AddNodeEdge { node, edge } => {
            validate_id(&node.id).map_err(invalid)?;
            validate_id(&edge.id).map_err(invalid)?;
            same_graph("node", &node.id, &node.graph_id)?;
            same_graph("edge", &edge.id, &edge.graph_id)?;
            if !edge.touches(&node.id) {
                return Err(Rejection::invalid(format!(
                    "edge {} does not connect new node {}",
                    edge.id, node.id
                )));
            }
            Ok(())
        }
        Mutation::DeleteNode { node_id } => validate_id(node_id).map_err(invalid),
        Mutation::DeleteEdge { edge_id } => validate_id(edge_id).map_err(invalid),
        Mutation::AddComment { comment } => {
            validate_id(&comment.id).map_err(invalid)?;
            same_graph("comment", &comment.id, &comment.graph_id)?;
            if comment.target().is_none() {
                return Err(Rejection::invalid(format!(
                    "comment {} must target exactly one node or edge",
                    comment.id
                )));
            }
            Ok(())
        }
        Mutation::AddNote { note } => {
            validate_id(&note.id).map_err(invalid)?;
            same_graph("note", &note.id, &note.graph_id)
        }
    }
}
