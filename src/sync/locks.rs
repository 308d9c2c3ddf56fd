//! Advisory node locks.
//!
//! One `NodeLockTable` exists per room. It is only touched while the room's
//! mutex is held, so it needs no synchronization of its own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SessionId;

/// Current holder of one node lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockEntry {
    pub holder: SessionId,
    /// Holder's display color, shown as the lock indicator
    pub color: String,
    pub acquired_at: DateTime<Utc>,
}

/// Wire view of one held lock, sent to joiners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub node_id: String,
    pub holder: SessionId,
    pub color: String,
}

/// Successful acquire outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The lock was free and now belongs to the requester.
    Granted,
    /// The requester already held the lock.
    AlreadyHeld,
}

/// The node is held by someone else.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("node {node_id} is locked by session {holder}")]
pub struct LockConflict {
    pub node_id: String,
    pub holder: SessionId,
    pub color: String,
}

impl From<LockConflict> for crate::Error {
    fn from(conflict: LockConflict) -> Self {
        crate::Error::LockConflict {
            node_id: conflict.node_id,
            holder: conflict.holder.to_string(),
        }
    }
}

/// Map of node id to lock holder for one graph.
#[derive(Debug, Default)]
pub struct NodeLockTable {
    entries: HashMap<String, LockEntry>,
}

impl NodeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on `node_id` for `holder`.
    ///
    /// Re-acquiring a lock already held by `holder` succeeds without change.
    pub fn acquire(
        &mut self,
        node_id: &str,
        holder: SessionId,
        color: &str,
    ) -> Result<Acquire, LockConflict> {
        match self.entries.get(node_id) {
            Some(entry) if entry.holder == holder => Ok(Acquire::AlreadyHeld),
            Some(entry) => Err(LockConflict {
                node_id: node_id.to_string(),
                holder: entry.holder,
                color: entry.color.clone(),
            }),
            None => {
                self.entries.insert(
                    node_id.to_string(),
                    LockEntry {
                        holder,
                        color: color.to_string(),
                        acquired_at: Utc::now(),
                    },
                );
                Ok(Acquire::Granted)
            }
        }
    }

    /// Release `node_id` if `holder` holds it. Returns whether a lock was cleared.
    pub fn release(&mut self, node_id: &str, holder: SessionId) -> bool {
        match self.entries.get(node_id) {
            Some(entry) if entry.holder == holder => {
                self.entries.remove(node_id);
                true
            }
            _ => false,
        }
    }

    /// Release every lock held by `holder`, returning the freed node ids sorted.
    pub fn release_all(&mut self, holder: SessionId) -> Vec<String> {
        let mut released: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.holder == holder)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        released.sort();
        for node_id in &released {
            self.entries.remove(node_id);
        }
        released
    }

    /// Drop the entry for a deleted node regardless of holder.
    pub fn discard(&mut self, node_id: &str) -> Option<LockEntry> {
        self.entries.remove(node_id)
    }

    /// Fail if `node_id` is held by anyone other than `requester`.
    pub fn check(&self, node_id: &str, requester: SessionId) -> Result<(), LockConflict> {
        match self.entries.get(node_id) {
            Some(entry) if entry.holder != requester => Err(LockConflict {
                node_id: node_id.to_string(),
                holder: entry.holder,
                color: entry.color.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn holder(&self, node_id: &str) -> Option<SessionId> {
        self.entries.get(node_id).map(|entry| entry.holder)
    }

    /// Nodes held by `holder`, sorted.
    pub fn held_by(&self, holder: SessionId) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.holder == holder)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn is_locked(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }

    /// All held locks, sorted by node id.
    pub fn snapshot(&self) -> Vec<LockInfo> {
        let mut locks: Vec<LockInfo> = self
            .entries
            .iter()
            .map(|(node_id, entry)| LockInfo {
                node_id: node_id.clone(),
                holder: entry.holder,
                color: entry.color.clone(),
            })
            .collect();
        locks.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive() {
        let mut table = NodeLockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();

        assert_eq!(table.acquire("n1", a, "#f00"), Ok(Acquire::Granted));
        let conflict = table.acquire("n1", b, "#0f0").unwrap_err();
        assert_eq!(conflict.holder, a);
        assert_eq!(conflict.color, "#f00");
        assert_eq!(table.holder("n1"), Some(a));
    }

    #[test]
    fn test_acquire_is_idempotent_for_holder() {
        let mut table = NodeLockTable::new();
        let a = SessionId::new();
        table.acquire("n1", a, "#f00").unwrap();
        assert_eq!(table.acquire("n1", a, "#f00"), Ok(Acquire::AlreadyHeld));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_requires_matching_holder() {
        let mut table = NodeLockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();
        table.acquire("n1", a, "#f00").unwrap();

        assert!(!table.release("n1", b));
        assert_eq!(table.holder("n1"), Some(a));
        assert!(table.release("n1", a));
        assert!(!table.release("n1", a));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_all_only_touches_holder() {
        let mut table = NodeLockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();
        table.acquire("n3", a, "#f00").unwrap();
        table.acquire("n1", a, "#f00").unwrap();
        table.acquire("n2", b, "#0f0").unwrap();

        assert_eq!(table.release_all(a), vec!["n1".to_string(), "n3".to_string()]);
        assert!(table.release_all(a).is_empty());
        assert_eq!(table.held_by(b), vec!["n2".to_string()]);
        assert_eq!(table.acquire("n1", b, "#0f0"), Ok(Acquire::Granted));
    }

    #[test]
    fn test_check_and_discard() {
        let mut table = NodeLockTable::new();
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(table.check("n1", b).is_ok());

        table.acquire("n1", a, "#f00").unwrap();
        assert!(table.check("n1", a).is_ok());
        assert!(table.check("n1", b).is_err());

        assert_eq!(table.discard("n1").map(|e| e.holder), Some(a));
        assert!(!table.is_locked("n1"));
        assert!(table.check("n1", b).is_ok());
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut table = NodeLockTable::new();
        let a = SessionId::new();
        table.acquire("b", a, "#f00").unwrap();
        table.acquire("a", a, "#f00").unwrap();
        let ids: Vec<String> = table.snapshot().into_iter().map(|l| l.node_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
