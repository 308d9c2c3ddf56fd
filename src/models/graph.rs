//! Whole-graph snapshots.
//!
//! A `GraphSnapshot` is what storage returns from `read_graph` and what a
//! session receives when it joins (or re-joins) a room.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{Comment, Edge, Graph, Node, Note};

/// Full state of one graph at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub graph: Graph,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl GraphSnapshot {
    /// Empty snapshot of `graph`.
    pub fn empty(graph: Graph) -> Self {
        Self {
            graph,
            nodes: Vec::new(),
            edges: Vec::new(),
            notes: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges incident to `node_id`.
    pub fn edges_touching<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.touches(node_id))
    }

    /// Edges whose source or target is missing from the snapshot.
    ///
    /// Storage enforces endpoint existence, so this is empty for any snapshot
    /// read from a store.
    pub fn dangling_edges(&self) -> Vec<&Edge> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.edges
            .iter()
            .filter(|e| !ids.contains(e.source.as_str()) || !ids.contains(e.target.as_str()))
            .collect()
    }

    /// Number of incident edges per node id.
    pub fn degrees(&self) -> HashMap<&str, usize> {
        let mut degrees: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &self.edges {
            *degrees.entry(edge.source.as_str()).or_default() += 1;
            *degrees.entry(edge.target.as_str()).or_default() += 1;
        }
        degrees
    }
}
