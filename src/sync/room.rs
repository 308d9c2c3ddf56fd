//! Room registry: who is present in which graph.
//!
//! A room exists while at least one session is joined to its graph. Each
//! room serializes its roster, lock table and bus publishes behind one async
//! mutex, so a leave (and the lock releases it implies) is always evaluated
//! before any later acquire in the same room. Rooms never share a lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::bus::{BroadcastBus, Subscription, DEFAULT_CAPACITY};
use super::locks::{LockInfo, NodeLockTable};
use super::protocol::{Event, Rejection};
use super::session::SessionContext;
use crate::models::{Position, Presence, SessionId};

/// Mutable state of one room.
#[derive(Debug, Default)]
pub struct RoomState {
    roster: Vec<Presence>,
    pub locks: NodeLockTable,
    /// Set once the last member left and the room was unregistered
    closed: bool,
}

impl RoomState {
    pub fn roster(&self) -> &[Presence] {
        &self.roster
    }

    pub fn is_member(&self, session: SessionId) -> bool {
        self.roster.iter().any(|p| p.session_id == session)
    }

    pub fn presence(&self, session: SessionId) -> Option<&Presence> {
        self.roster.iter().find(|p| p.session_id == session)
    }
}

/// One live graph room.
#[derive(Debug)]
pub struct Room {
    graph_id: String,
    state: Mutex<RoomState>,
    bus: BroadcastBus,
}

impl Room {
    fn new(graph_id: &str, capacity: usize) -> Self {
        Self {
            graph_id: graph_id.to_string(),
            state: Mutex::new(RoomState::default()),
            bus: BroadcastBus::new(graph_id, capacity),
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Enter the room's critical section.
    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }
}

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    pub room: Arc<Room>,
    /// Opened before the roster broadcast, so it already holds that event
    pub subscription: Subscription,
    pub roster: Vec<Presence>,
    pub locks: Vec<LockInfo>,
}

/// Result of a leave that removed a member.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    /// Nodes whose locks were released on the way out
    pub released: Vec<String>,
    pub roster: Vec<Presence>,
    /// Whether the room was dropped because it became empty
    pub closed: bool,
}

/// All live rooms.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    capacity: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RoomRegistry {
    /// Create a registry whose rooms buffer up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Look up a live room.
    pub async fn room(&self, graph_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(graph_id).cloned()
    }

    async fn room_or_create(&self, graph_id: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(graph_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(graph_id, self.capacity)))
            .clone()
    }

    /// Add the session to the room and broadcast the new roster to everyone,
    /// the joiner included.
    ///
    /// Joining twice replaces the presence entry; locks are kept.
    pub async fn join(&self, ctx: &SessionContext, graph_id: &str) -> JoinOutcome {
        loop {
            let room = self.room_or_create(graph_id).await;
            let mut state = room.lock().await;
            if state.closed {
                // Lost a race with the last member leaving; the map now has
                // (or will get) a fresh room.
                continue;
            }

            let session = ctx.session_id();
            let presence = Presence::new(session, ctx.participant());
            match state.roster.iter_mut().find(|p| p.session_id == session) {
                Some(existing) => *existing = presence,
                None => state.roster.push(presence),
            }

            let subscription = room.bus.subscribe(session);
            let roster = state.roster.clone();
            room.bus.publish_all(
                Some(session),
                Event::Presence {
                    roster: roster.clone(),
                },
            );
            let locks = state.locks.snapshot();
            drop(state);

            tracing::info!(
                graph_id,
                session = %session,
                user = %ctx.participant().user_id,
                members = roster.len(),
                "joined room"
            );
            return JoinOutcome {
                room,
                subscription,
                roster,
                locks,
            };
        }
    }

    /// Remove the session, release its locks and broadcast the new roster.
    ///
    /// Returns `None` if the session was not a member.
    pub async fn leave(&self, ctx: &SessionContext, graph_id: &str) -> Option<LeaveOutcome> {
        let room = self.room(graph_id).await?;
        let session = ctx.session_id();
        let mut state = room.lock().await;

        let before = state.roster.len();
        state.roster.retain(|p| p.session_id != session);
        if state.roster.len() == before {
            return None;
        }

        let released = state.locks.release_all(session);
        for node_id in &released {
            room.bus.publish_all(
                Some(session),
                Event::UnlockNode {
                    node_id: node_id.clone(),
                },
            );
        }

        let roster = state.roster.clone();
        room.bus.publish_all(
            Some(session),
            Event::Presence {
                roster: roster.clone(),
            },
        );

        let closed = roster.is_empty();
        if closed {
            state.closed = true;
            let mut rooms = self.rooms.lock().await;
            if rooms.get(graph_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
                rooms.remove(graph_id);
            }
        }
        drop(state);

        tracing::info!(
            graph_id,
            session = %session,
            released = released.len(),
            members = roster.len(),
            "left room"
        );
        Some(LeaveOutcome {
            released,
            roster,
            closed,
        })
    }

    /// Leave every room the session joined.
    pub async fn leave_all(&self, ctx: &SessionContext) -> Vec<(String, LeaveOutcome)> {
        let mut outcomes = Vec::new();
        for graph_id in ctx.rooms() {
            if let Some(outcome) = self.leave(ctx, &graph_id).await {
                outcomes.push((graph_id, outcome));
            }
        }
        outcomes
    }

    /// Store the session's cursor and fan it out to everyone else.
    pub async fn update_cursor(
        &self,
        ctx: &SessionContext,
        graph_id: &str,
        position: Position,
    ) -> Result<Presence, Rejection> {
        let not_joined = || Rejection::NotJoined {
            graph_id: graph_id.to_string(),
        };
        let room = self.room(graph_id).await.ok_or_else(not_joined)?;
        let session = ctx.session_id();
        let mut state = room.lock().await;

        let presence = state
            .roster
            .iter_mut()
            .find(|p| p.session_id == session)
            .ok_or_else(not_joined)?;
        presence.cursor = Some(position);
        let presence = presence.clone();

        room.bus.publish(
            session,
            Event::UpdateRemoteCursor {
                presence: presence.clone(),
            },
        );
        Ok(presence)
    }

    /// Current roster, empty if nobody is in the room.
    pub async fn roster(&self, graph_id: &str) -> Vec<Presence> {
        match self.room(graph_id).await {
            Some(room) => room.lock().await.roster.clone(),
            None => Vec::new(),
        }
    }

    /// Currently held locks in a room.
    pub async fn locks(&self, graph_id: &str) -> Vec<LockInfo> {
        match self.room(graph_id).await {
            Some(room) => room.lock().await.locks.snapshot(),
            None => Vec::new(),
        }
    }

    /// Graph ids with at least one member, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
