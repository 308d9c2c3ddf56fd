//! Per-connection session context.
//!
//! Every live connection owns exactly one `SessionContext`. It is passed
//! explicitly into the coordinator and registry instead of being looked up
//! from shared state, so two tabs of the same user never see each other's
//! focus or pending action.

use std::collections::HashSet;

use crate::models::{Participant, SessionId};

/// Action the session is in the middle of on its focused node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Add,
    Update,
    Delete,
}

/// State owned by one connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: SessionId,
    participant: Participant,
    rooms: HashSet<String>,
    focus: Option<(String, String)>,
    pending: Option<PendingAction>,
}

impl SessionContext {
    pub fn new(participant: Participant) -> Self {
        Self::with_id(SessionId::new(), participant)
    }

    pub fn with_id(session_id: SessionId, participant: Participant) -> Self {
        Self {
            session_id,
            participant,
            rooms: HashSet::new(),
            focus: None,
            pending: None,
        }
    }

    /// The server-internal session used for layout write-back.
    pub fn system() -> Self {
        Self::with_id(
            SessionId::SYSTEM,
            Participant {
                user_id: "system".to_string(),
                display_name: "Layout".to_string(),
                color: "#888888".to_string(),
            },
        )
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Replace the identity, e.g. when a socket re-joins under a new display name.
    pub fn set_participant(&mut self, participant: Participant) {
        self.participant = participant;
    }

    pub fn is_system(&self) -> bool {
        self.session_id.is_system()
    }

    /// Record membership. Returns `false` if already a member.
    pub fn joined(&mut self, graph_id: &str) -> bool {
        self.rooms.insert(graph_id.to_string())
    }

    /// Drop membership, clearing focus if it pointed into that room.
    pub fn left(&mut self, graph_id: &str) -> bool {
        if self.focus.as_ref().is_some_and(|(g, _)| g == graph_id) {
            self.clear_focus();
        }
        self.rooms.remove(graph_id)
    }

    pub fn in_room(&self, graph_id: &str) -> bool {
        self.is_system() || self.rooms.contains(graph_id)
    }

    /// Rooms this session has joined, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Focus a node (after acquiring its lock).
    pub fn focus(&mut self, graph_id: &str, node_id: &str) {
        self.focus = Some((graph_id.to_string(), node_id.to_string()));
    }

    /// The focused node if it belongs to `graph_id`.
    pub fn focused_in(&self, graph_id: &str) -> Option<&str> {
        match &self.focus {
            Some((g, n)) if g == graph_id => Some(n),
            _ => None,
        }
    }

    pub fn clear_focus(&mut self) {
        self.focus = None;
        self.pending = None;
    }

    pub fn set_pending(&mut self, action: PendingAction) {
        self.pending = Some(action);
    }

    pub fn pending(&self) -> Option<PendingAction> {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::participant;

    #[test]
    fn test_room_membership() {
        let mut ctx = SessionContext::new(participant("alice"));
        assert!(!ctx.in_room("g-1"));
        assert!(ctx.joined("g-1"));
        assert!(!ctx.joined("g-1"));
        assert!(ctx.joined("g-0"));
        assert_eq!(ctx.rooms(), vec!["g-0".to_string(), "g-1".to_string()]);
        assert!(ctx.left("g-1"));
        assert!(!ctx.left("g-1"));
        assert!(!ctx.in_room("g-1"));
    }

    #[test]
    fn test_leaving_clears_focus_in_that_room() {
        let mut ctx = SessionContext::new(participant("alice"));
        ctx.joined("g-1");
        ctx.joined("g-2");
        ctx.focus("g-1", "n-1");
        ctx.set_pending(PendingAction::Update);
        assert_eq!(ctx.focused_in("g-1"), Some("n-1"));
        assert_eq!(ctx.focused_in("g-2"), None);

        ctx.left("g-2");
        assert_eq!(ctx.focused_in("g-1"), Some("n-1"));

        ctx.left("g-1");
        assert_eq!(ctx.focused_in("g-1"), None);
        assert_eq!(ctx.pending(), None);
    }

    #[test]
    fn test_system_session_is_everywhere() {
        let ctx = SessionContext::system();
        assert!(ctx.is_system());
        assert!(ctx.in_room("any-graph"));
    }
}
