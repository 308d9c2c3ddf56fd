//! Real-time synchronization core.
//!
//! - [`room`]: room registry (membership, roster, per-room critical section)
//! - [`locks`]: advisory node lock table
//! - [`bus`]: per-room broadcast with origin filtering
//! - [`coordinator`]: mutation validation, lock gating, publish then persist
//! - [`layout`]: force-directed layout stabilizer
//! - [`chat`]: per-graph single-flight chat dispatch
//! - [`protocol`]: wire types
//!
//! [`SyncHub`] wires them together for the server.

pub mod bus;
pub mod chat;
pub mod coordinator;
pub mod layout;
pub mod locks;
pub mod protocol;
pub mod room;
pub mod session;

use std::sync::Arc;

pub use bus::{Received, Subscription};
pub use coordinator::{Applied, MutationCoordinator};
pub use layout::{LayoutHandle, LayoutParams, LayoutStabilizer};
pub use locks::{Acquire, LockInfo};
pub use protocol::{ClientMessage, Event, Mutation, Rejection, ServerMessage};
pub use session::SessionContext;

use crate::agent::ChatAgent;
use crate::models::{ChatMessage, GraphSnapshot, Position, Presence};
use crate::storage::SharedStore;
use chat::ChatDispatcher;
use room::RoomRegistry;

/// Runtime knobs for a hub.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Events buffered per subscriber before it must resync
    pub bus_capacity: usize,
    /// `None` disables the layout stabilizer
    pub layout: Option<LayoutParams>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            bus_capacity: bus::DEFAULT_CAPACITY,
            layout: Some(LayoutParams::default()),
        }
    }
}

/// Everything a session needs right after joining.
#[derive(Debug)]
pub struct Joined {
    pub subscription: Subscription,
    pub roster: Vec<Presence>,
    pub locks: Vec<LockInfo>,
    pub snapshot: GraphSnapshot,
}

/// Entry point used by transports.
pub struct SyncHub {
    registry: Arc<RoomRegistry>,
    coordinator: Arc<MutationCoordinator>,
    chat: Arc<ChatDispatcher>,
    store: SharedStore,
}

impl SyncHub {
    /// Build a hub. Starts the layout stabilizer when enabled, so this must
    /// be called inside a tokio runtime.
    pub fn new(store: SharedStore, agent: Arc<dyn ChatAgent>, settings: HubSettings) -> Arc<Self> {
        let registry = Arc::new(RoomRegistry::new(settings.bus_capacity));

        let coordinator = match settings.layout {
            Some(params) => {
                let (handle, triggers) = LayoutHandle::channel();
                let coordinator = Arc::new(MutationCoordinator::new(
                    registry.clone(),
                    store.clone(),
                    Some(handle),
                ));
                LayoutStabilizer::new(params, store.clone(), Arc::downgrade(&coordinator))
                    .spawn(triggers);
                coordinator
            }
            None => Arc::new(MutationCoordinator::new(registry.clone(), store.clone(), None)),
        };

        let chat = Arc::new(ChatDispatcher::new(registry.clone(), agent));
        Arc::new(Self {
            registry,
            coordinator,
            chat,
            store,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Join a graph room.
    ///
    /// The subscription is opened before the snapshot is read, so every
    /// change made after the read is also waiting in the subscription.
    pub async fn join(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
    ) -> Result<Joined, Rejection> {
        let exists = self.store.lock().await.graph_exists(graph_id);
        match exists {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(graph_id, session = %ctx.session_id(), "join rejected: unknown graph");
                return Err(Rejection::UnknownGraph {
                    graph_id: graph_id.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(graph_id, error = %e, "join rejected: storage error");
                return Err(Rejection::invalid("storage unavailable"));
            }
        }

        let outcome = self.registry.join(ctx, graph_id).await;
        ctx.joined(graph_id);

        let snapshot = self.store.lock().await.read_graph(graph_id);
        match snapshot {
            Ok(snapshot) => Ok(Joined {
                subscription: outcome.subscription,
                roster: outcome.roster,
                locks: outcome.locks,
                snapshot,
            }),
            Err(e) => {
                tracing::warn!(graph_id, error = %e, "snapshot read failed; undoing join");
                self.leave(ctx, graph_id).await;
                Err(Rejection::UnknownGraph {
                    graph_id: graph_id.to_string(),
                })
            }
        }
    }

    /// Leave a room. Returns whether the session was a member.
    pub async fn leave(&self, ctx: &mut SessionContext, graph_id: &str) -> bool {
        let outcome = self.registry.leave(ctx, graph_id).await;
        ctx.left(graph_id);
        outcome.is_some()
    }

    /// Implicit leave of every room, used when a connection drops.
    pub async fn disconnect(&self, ctx: &mut SessionContext) {
        let outcomes = self.registry.leave_all(ctx).await;
        for (graph_id, outcome) in &outcomes {
            ctx.left(graph_id);
            if !outcome.released.is_empty() {
                tracing::info!(
                    graph_id = %graph_id,
                    session = %ctx.session_id(),
                    released = ?outcome.released,
                    "locks released on disconnect"
                );
            }
        }
    }

    pub async fn mutate(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
        mutation: Mutation,
    ) -> Result<Applied, Rejection> {
        if !ctx.in_room(graph_id) {
            return Err(Rejection::NotJoined {
                graph_id: graph_id.to_string(),
            });
        }
        self.coordinator.apply(ctx, graph_id, mutation).await
    }

    pub async fn lock(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
        node_id: &str,
    ) -> Result<Acquire, Rejection> {
        self.coordinator.lock(ctx, graph_id, node_id).await
    }

    pub async fn unlock(
        &self,
        ctx: &mut SessionContext,
        graph_id: &str,
        node_id: &str,
    ) -> Result<bool, Rejection> {
        self.coordinator.unlock(ctx, graph_id, node_id).await
    }

    pub async fn cursor(
        &self,
        ctx: &SessionContext,
        graph_id: &str,
        position: Position,
    ) -> Result<Presence, Rejection> {
        self.registry.update_cursor(ctx, graph_id, position).await
    }

    pub async fn chat(
        &self,
        ctx: &SessionContext,
        graph_id: &str,
        text: &str,
    ) -> Result<ChatMessage, Rejection> {
        self.chat.enqueue(ctx, graph_id, text).await
    }

    /// Deliver an asynchronous agent completion.
    pub async fn complete_chat(
        &self,
        graph_id: &str,
        message_id: &str,
        outcome: std::result::Result<String, String>,
    ) -> bool {
        self.chat.complete(graph_id, message_id, outcome).await
    }

    /// Ask for a layout run. Returns `false` if layout is disabled.
    pub async fn request_layout(&self, graph_id: &str) -> Result<bool, Rejection> {
        let exists = self.store.lock().await.graph_exists(graph_id);
        if !exists.unwrap_or(false) {
            return Err(Rejection::UnknownGraph {
                graph_id: graph_id.to_string(),
            });
        }
        Ok(self.coordinator.trigger_layout(graph_id))
    }

    pub async fn presence(&self, graph_id: &str) -> Vec<Presence> {
        self.registry.roster(graph_id).await
    }

    pub async fn locks(&self, graph_id: &str) -> Vec<LockInfo> {
        self.registry.locks(graph_id).await
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.registry.active_rooms().await
    }
}
