//! Force-directed layout stabilization.
//!
//! [`Simulation`] is a velocity-Verlet style relaxation in the d3-force
//! tradition: many-body repulsion between every pair of nodes, spring
//! attraction along edges, and an `alpha` "temperature" that decays every
//! tick until it drops below `alpha_min`. Pinned nodes (those locked by a
//! participant) exert force but never move.
//!
//! [`LayoutStabilizer`] runs one simulation per graph in the background,
//! debouncing structural-change triggers and writing converged positions
//! back through the [`MutationCoordinator`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use super::coordinator::MutationCoordinator;
use crate::models::{Edge, Node, NodePosition, Position};
use crate::storage::SharedStore;
use crate::{Error, Result};

/// Ticks run between checks for new triggers.
const TICKS_PER_CHUNK: u32 = 50;

/// A worker with no trigger for this long shuts down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Below this squared distance two bodies are treated as 1 unit apart.
const DISTANCE_MIN2: f64 = 1.0;

/// Simulation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutParams {
    /// Many-body strength; negative repels
    pub strength: f64,
    /// Rest length of edge springs
    pub distance: f64,
    /// Starting temperature
    pub alpha: f64,
    /// The run is settled once alpha drops below this
    pub alpha_min: f64,
    pub alpha_decay: f64,
    /// Fraction of velocity lost per tick
    pub velocity_decay: f64,
    /// Alpha restored when a node is added mid-run
    pub reheat_alpha: f64,
    /// Hard bound on ticks per run
    pub max_ticks: u32,
    /// Quiet period before a triggered run starts
    pub debounce: Duration,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            strength: -30.0,
            distance: 30.0,
            alpha: 1.0,
            alpha_min: 0.001,
            alpha_decay: 1.0 - 0.001f64.powf(1.0 / 300.0),
            velocity_decay: 0.4,
            reheat_alpha: 0.3,
            max_ticks: 1000,
            debounce: Duration::from_millis(250),
        }
    }
}

impl LayoutParams {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(Error::Config(format!("layout alpha must be in (0, 1], got {}", self.alpha)));
        }
        if !(self.alpha_min > 0.0 && self.alpha_min < self.alpha) {
            return Err(Error::Config(format!(
                "layout alpha-min must be in (0, alpha), got {}",
                self.alpha_min
            )));
        }
        if !(self.alpha_decay > 0.0 && self.alpha_decay < 1.0) {
            return Err(Error::Config(format!(
                "layout alpha-decay must be in (0, 1), got {}",
                self.alpha_decay
            )));
        }
        if !(0.0..=1.0).contains(&self.velocity_decay) {
            return Err(Error::Config(format!(
                "layout velocity-decay must be in [0, 1], got {}",
                self.velocity_decay
            )));
        }
        if !(self.distance.is_finite() && self.distance >= 0.0) {
            return Err(Error::Config(format!(
                "layout distance must be non-negative, got {}",
                self.distance
            )));
        }
        if !self.strength.is_finite() {
            return Err(Error::Config("layout strength must be finite".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Body {
    id: String,
    x: f64,
    y: f64,
    vx: f64,
    vy: f64,
    pinned: bool,
}

/// Outcome of a converged run.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutRun {
    pub positions: Vec<NodePosition>,
    pub ticks: u32,
}

/// Mutable simulation state for one graph.
#[derive(Debug, Clone)]
pub struct Simulation {
    params: LayoutParams,
    bodies: Vec<Body>,
    index: HashMap<String, usize>,
    links: Vec<(usize, usize)>,
    edge_ends: Vec<(String, String)>,
    alpha: f64,
    ticks: u32,
    reported: bool,
}

impl Simulation {
    pub fn new(nodes: &[Node], edges: &[Edge], params: LayoutParams) -> Self {
        let alpha = params.alpha;
        let mut sim = Self {
            params,
            bodies: Vec::with_capacity(nodes.len()),
            index: HashMap::with_capacity(nodes.len()),
            links: Vec::new(),
            edge_ends: Vec::new(),
            alpha,
            ticks: 0,
            reported: false,
        };
        for node in nodes {
            sim.insert_body(&node.id, node.position);
        }
        sim.set_edges(edges);
        sim
    }

    fn insert_body(&mut self, id: &str, position: Position) {
        if self.index.contains_key(id) {
            return;
        }
        self.index.insert(id.to_string(), self.bodies.len());
        self.bodies.push(Body {
            id: id.to_string(),
            x: position.x,
            y: position.y,
            vx: 0.0,
            vy: 0.0,
            pinned: false,
        });
    }

    /// Replace the spring set. Edges with an unknown endpoint are ignored.
    pub fn set_edges(&mut self, edges: &[Edge]) {
        self.edge_ends = edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        self.rebuild_links();
    }

    fn rebuild_links(&mut self) {
        self.links = self
            .edge_ends
            .iter()
            .filter_map(|(s, t)| Some((*self.index.get(s)?, *self.index.get(t)?)))
            .filter(|(s, t)| s != t)
            .collect();
    }

    /// Add a node mid-run. Reheats the simulation.
    pub fn add_node(&mut self, node: &Node) {
        if self.index.contains_key(&node.id) {
            return;
        }
        self.insert_body(&node.id, node.position);
        self.rebuild_links();
        self.reheat();
    }

    /// Remove a node and its springs.
    pub fn remove_node(&mut self, node_id: &str) {
        if self.index.remove(node_id).is_none() {
            return;
        }
        self.bodies.retain(|b| b.id != node_id);
        self.index = self
            .bodies
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id.clone(), i))
            .collect();
        self.rebuild_links();
    }

    /// Bring the simulation in line with a fresh read of the graph.
    ///
    /// Returns whether any node was added (which reheats).
    pub fn sync_with(&mut self, nodes: &[Node], edges: &[Edge]) -> bool {
        let live: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let gone: Vec<String> = self
            .bodies
            .iter()
            .filter(|b| !live.contains(b.id.as_str()))
            .map(|b| b.id.clone())
            .collect();
        for id in gone {
            self.remove_node(&id);
        }

        let mut added = false;
        for node in nodes {
            if !self.index.contains_key(&node.id) {
                self.insert_body(&node.id, node.position);
                added = true;
            }
        }
        self.set_edges(edges);
        if added {
            self.reheat();
        }
        added
    }

    /// Fix a node in place; it keeps exerting force on others.
    pub fn pin(&mut self, node_id: &str) {
        if let Some(&i) = self.index.get(node_id) {
            self.bodies[i].pinned = true;
        }
    }

    /// Pin exactly the given set, unpinning everything else.
    pub fn set_pinned(&mut self, pinned: &HashSet<String>) {
        for body in &mut self.bodies {
            body.pinned = pinned.contains(&body.id);
        }
    }

    /// Restore alpha to at least the reheat level and allow another report.
    pub fn reheat(&mut self) {
        self.alpha = self.alpha.max(self.params.reheat_alpha);
        self.ticks = 0;
        self.reported = false;
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Termination predicate for the current run.
    pub fn is_settled(&self) -> bool {
        self.bodies.is_empty()
            || self.alpha < self.params.alpha_min
            || self.ticks >= self.params.max_ticks
    }

    /// Advance one tick. No-op once settled.
    pub fn tick(&mut self) {
        if self.is_settled() {
            return;
        }
        self.alpha += (0.0 - self.alpha) * self.params.alpha_decay;
        self.apply_links();
        self.apply_many_body();

        let retain = 1.0 - self.params.velocity_decay;
        for body in &mut self.bodies {
            if body.pinned {
                body.vx = 0.0;
                body.vy = 0.0;
                continue;
            }
            body.vx *= retain;
            body.vy *= retain;
            body.x += body.vx;
            body.y += body.vy;
        }
        self.ticks += 1;
    }

    /// Run up to `n` ticks, stopping early once settled.
    pub fn run_ticks(&mut self, n: u32) {
        for _ in 0..n {
            if self.is_settled() {
                break;
            }
            self.tick();
        }
    }

    fn apply_links(&mut self) {
        if self.links.is_empty() {
            return;
        }
        let mut degree = vec![0usize; self.bodies.len()];
        for &(s, t) in &self.links {
            degree[s] += 1;
            degree[t] += 1;
        }

        for (k, &(s, t)) in self.links.iter().enumerate() {
            let strength = 1.0 / degree[s].min(degree[t]) as f64;
            let bias = degree[s] as f64 / (degree[s] + degree[t]) as f64;

            let (source, target) = (&self.bodies[s], &self.bodies[t]);
            let mut dx = target.x + target.vx - source.x - source.vx;
            let mut dy = target.y + target.vy - source.y - source.vy;
            if dx == 0.0 {
                dx = jiggle(k);
            }
            if dy == 0.0 {
                dy = jiggle(k + 1);
            }
            let len = (dx * dx + dy * dy).sqrt();
            let scale = (len - self.params.distance) / len * self.alpha * strength;
            dx *= scale;
            dy *= scale;

            self.bodies[t].vx -= dx * bias;
            self.bodies[t].vy -= dy * bias;
            self.bodies[s].vx += dx * (1.0 - bias);
            self.bodies[s].vy += dy * (1.0 - bias);
        }
    }

    fn apply_many_body(&mut self) {
        let n = self.bodies.len();
        let k = self.params.strength * self.alpha;
        for i in 0..n {
            let (mut fx, mut fy) = (0.0, 0.0);
            for j in 0..n {
                if i == j {
                    continue;
                }
                let mut dx = self.bodies[j].x - self.bodies[i].x;
                let mut dy = self.bodies[j].y - self.bodies[i].y;
                if dx == 0.0 && dy == 0.0 {
                    // Coincident bodies: push apart in a direction that
                    // depends on the pair so they separate.
                    let (lo, hi) = (i.min(j), i.max(j));
                    let sign = if i < j { 1.0 } else { -1.0 };
                    dx = jiggle(lo * n + hi) * sign;
                    dy = jiggle(hi * n + lo) * sign;
                }
                let mut l2 = dx * dx + dy * dy;
                if l2 < DISTANCE_MIN2 {
                    l2 = (DISTANCE_MIN2 * l2).sqrt();
                }
                fx += dx * k / l2;
                fy += dy * k / l2;
            }
            self.bodies[i].vx += fx;
            self.bodies[i].vy += fy;
        }
    }

    /// Current positions in insertion order.
    pub fn positions(&self) -> Vec<NodePosition> {
        self.bodies
            .iter()
            .map(|b| NodePosition {
                node_id: b.id.clone(),
                position: Position::new(b.x, b.y),
            })
            .collect()
    }

    /// The converged result, returned at most once per run.
    pub fn take_settled(&mut self) -> Option<LayoutRun> {
        if self.reported || !self.is_settled() {
            return None;
        }
        self.reported = true;
        Some(LayoutRun {
            positions: self.positions(),
            ticks: self.ticks,
        })
    }
}

/// Tiny deterministic offset to break symmetry between coincident points.
fn jiggle(seed: usize) -> f64 {
    let unit = ((seed.wrapping_mul(2_654_435_761) % 1000) as f64 + 1.0) / 1000.0;
    (unit - 0.5) * 1e-6
}

/// Relax `nodes` to convergence in one call.
///
/// Nodes in `pinned` keep their positions. A graph with no nodes returns
/// immediately with zero ticks.
pub fn run(nodes: &[Node], edges: &[Edge], pinned: &HashSet<String>, params: &LayoutParams) -> LayoutRun {
    let mut sim = Simulation::new(nodes, edges, params.clone());
    sim.set_pinned(pinned);
    while !sim.is_settled() {
        sim.tick();
    }
    LayoutRun {
        positions: sim.positions(),
        ticks: sim.ticks(),
    }
}

fn stored_positions(nodes: &[Node]) -> HashMap<String, Position> {
    nodes.iter().map(|n| (n.id.clone(), n.position)).collect()
}

/// Handle used to request a layout pass for a graph.
#[derive(Debug, Clone)]
pub struct LayoutHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl LayoutHandle {
    /// Create a handle and the receiver the stabilizer consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request a (debounced) layout run for `graph_id`.
    pub fn trigger(&self, graph_id: &str) {
        if self.tx.send(graph_id.to_string()).is_err() {
            tracing::debug!(graph_id, "layout stabilizer stopped; trigger dropped");
        }
    }
}

/// Background service running one simulation worker per graph.
pub struct LayoutStabilizer {
    params: LayoutParams,
    store: SharedStore,
    coordinator: Weak<MutationCoordinator>,
}

impl LayoutStabilizer {
    pub fn new(params: LayoutParams, store: SharedStore, coordinator: Weak<MutationCoordinator>) -> Self {
        Self {
            params,
            store,
            coordinator,
        }
    }

    /// Consume triggers until every [`LayoutHandle`] is dropped.
    pub fn spawn(self, mut triggers: mpsc::UnboundedReceiver<String>) -> tokio::task::JoinHandle<()> {
        let this = Arc::new(self);
        tokio::spawn(async move {
            let mut workers: HashMap<String, mpsc::UnboundedSender<()>> = HashMap::new();
            while let Some(graph_id) = triggers.recv().await {
                workers.retain(|_, tx| !tx.is_closed());
                if let Some(tx) = workers.get(&graph_id) {
                    if tx.send(()).is_ok() {
                        continue;
                    }
                }

                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(());
                workers.insert(graph_id.clone(), tx);
                tokio::spawn(Arc::clone(&this).worker(graph_id, rx));
            }
            tracing::debug!("layout stabilizer stopped");
        })
    }

    async fn worker(self: Arc<Self>, graph_id: String, mut rx: mpsc::UnboundedReceiver<()>) {
        tracing::debug!(graph_id = %graph_id, "layout worker started");
        loop {
            match tokio::time::timeout(IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => return,
                Err(_) => {
                    // Idle: stop accepting triggers, then handle any that
                    // slipped in before the close.
                    rx.close();
                    let mut pending = false;
                    while rx.try_recv().is_ok() {
                        pending = true;
                    }
                    if pending {
                        self.debounce_and_run(&graph_id, &mut rx).await;
                    }
                    tracing::debug!(graph_id = %graph_id, "layout worker idle, exiting");
                    return;
                }
            }
            self.debounce_and_run(&graph_id, &mut rx).await;
        }
    }

    async fn debounce_and_run(&self, graph_id: &str, rx: &mut mpsc::UnboundedReceiver<()>) {
        // Wait for the trigger stream to go quiet.
        while let Ok(Some(())) = tokio::time::timeout(self.params.debounce, rx.recv()).await {}

        if let Err(e) = self.stabilize(graph_id, rx).await {
            tracing::warn!(graph_id, error = %e, "layout run failed");
        }
    }

    /// Run one simulation to convergence and write the result back.
    async fn stabilize(&self, graph_id: &str, rx: &mut mpsc::UnboundedReceiver<()>) -> Result<()> {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Ok(());
        };

        let snapshot = match self.store.lock().await.read_graph(graph_id) {
            Ok(snapshot) => snapshot,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut sim = Simulation::new(&snapshot.nodes, &snapshot.edges, self.params.clone());
        sim.set_pinned(&coordinator.locked_nodes(graph_id).await);
        let mut baseline = stored_positions(&snapshot.nodes);

        loop {
            sim = tokio::task::spawn_blocking(move || {
                sim.run_ticks(TICKS_PER_CHUNK);
                sim
            })
            .await
            .map_err(|e| Error::Other(format!("layout task failed: {}", e)))?;

            // Structural changes mid-run: fold them into the running simulation.
            let mut changed = false;
            while rx.try_recv().is_ok() {
                changed = true;
            }
            if changed {
                let snapshot = match self.store.lock().await.read_graph(graph_id) {
                    Ok(snapshot) => snapshot,
                    Err(Error::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if sim.sync_with(&snapshot.nodes, &snapshot.edges) {
                    tracing::debug!(graph_id, alpha = sim.alpha(), "layout reheated");
                }
                // Bodies already in the simulation keep the position they started from.
                let fresh = stored_positions(&snapshot.nodes);
                baseline.retain(|id, _| fresh.contains_key(id));
                for (id, position) in fresh {
                    baseline.entry(id).or_insert(position);
                }
                sim.set_pinned(&coordinator.locked_nodes(graph_id).await);
            }

            if let Some(run) = sim.take_settled() {
                let written = coordinator
                    .apply_layout(graph_id, run.positions, run.ticks, &baseline)
                    .await?;
                tracing::info!(graph_id, ticks = run.ticks, written, "layout settled");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node, GRAPH};

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge::new(
            id.to_string(),
            GRAPH.to_string(),
            "related".to_string(),
            source.to_string(),
            target.to_string(),
        )
    }

    fn triangle() -> (Vec<Node>, Vec<Edge>) {
        (
            vec![node("a", 0.0, 0.0), node("b", 1.0, 0.0), node("c", 0.0, 1.0)],
            vec![edge("ab", "a", "b"), edge("bc", "b", "c"), edge("ca", "c", "a")],
        )
    }

    #[test]
    fn test_default_params_valid() {
        let params = LayoutParams::default();
        params.validate().unwrap();
        // 300 ticks take alpha from 1 to alpha_min.
        let after_300 = (1.0 - params.alpha_decay).powi(300);
        assert!((after_300 - params.alpha_min).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = LayoutParams {
            alpha_decay: 1.5,
            ..LayoutParams::default()
        };
        assert!(params.validate().is_err());
        let params = LayoutParams {
            velocity_decay: -0.1,
            ..LayoutParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_empty_graph_terminates_immediately() {
        let run = run(&[], &[], &HashSet::new(), &LayoutParams::default());
        assert_eq!(run.ticks, 0);
        assert!(run.positions.is_empty());
    }

    #[test]
    fn test_alpha_never_increases_and_run_terminates() {
        let (nodes, edges) = triangle();
        let mut sim = Simulation::new(&nodes, &edges, LayoutParams::default());
        let mut last = sim.alpha();
        while !sim.is_settled() {
            sim.tick();
            assert!(sim.alpha() <= last);
            last = sim.alpha();
        }
        assert!(sim.alpha() < LayoutParams::default().alpha_min);
        assert!(sim.ticks() <= LayoutParams::default().max_ticks);
    }

    #[test]
    fn test_settled_reported_exactly_once() {
        let (nodes, edges) = triangle();
        let mut sim = Simulation::new(&nodes, &edges, LayoutParams::default());
        let mut reports = 0;
        for _ in 0..2000 {
            sim.tick();
            if sim.take_settled().is_some() {
                reports += 1;
            }
        }
        assert_eq!(reports, 1);
    }

    #[test]
    fn test_springs_pull_toward_rest_length() {
        let nodes = vec![node("a", 0.0, 0.0), node("b", 500.0, 0.0)];
        let edges = vec![edge("ab", "a", "b")];
        let run = run(&nodes, &edges, &HashSet::new(), &LayoutParams::default());
        let a = run.positions[0].position;
        let b = run.positions[1].position;
        assert!(a.distance_to(&b) < 500.0);
    }

    #[test]
    fn test_coincident_nodes_separate() {
        let nodes = vec![node("a", 0.0, 0.0), node("b", 0.0, 0.0)];
        let run = run(&nodes, &[], &HashSet::new(), &LayoutParams::default());
        let a = run.positions[0].position;
        let b = run.positions[1].position;
        assert!(a.distance_to(&b) > 1.0);
        assert!(a.x.is_finite() && a.y.is_finite());
    }

    #[test]
    fn test_pinned_nodes_do_not_move() {
        let (nodes, edges) = triangle();
        let pinned: HashSet<String> = ["a".to_string()].into_iter().collect();
        let run = run(&nodes, &edges, &pinned, &LayoutParams::default());
        let a = run.positions.iter().find(|p| p.node_id == "a").unwrap();
        assert_eq!(a.position, Position::new(0.0, 0.0));
        let b = run.positions.iter().find(|p| p.node_id == "b").unwrap();
        assert_ne!(b.position, Position::new(1.0, 0.0));
    }

    #[test]
    fn test_adding_node_mid_run_reheats() {
        let (nodes, edges) = triangle();
        let mut sim = Simulation::new(&nodes, &edges, LayoutParams::default());
        sim.run_ticks(400);
        assert!(sim.alpha() < 0.3);

        sim.add_node(&node("d", 5.0, 5.0));
        assert!((sim.alpha() - 0.3).abs() < 1e-12);
        assert_eq!(sim.len(), 4);
        assert!(!sim.is_settled());
    }

    #[test]
    fn test_sync_with_removes_and_adds() {
        let (nodes, edges) = triangle();
        let mut sim = Simulation::new(&nodes, &edges, LayoutParams::default());
        sim.run_ticks(1000);
        assert!(sim.take_settled().is_some());

        let next = vec![node("a", 0.0, 0.0), node("b", 1.0, 0.0), node("d", 2.0, 2.0)];
        assert!(sim.sync_with(&next, &[edge("ab", "a", "b"), edge("bc", "b", "c")]));
        let ids: Vec<String> = sim.positions().into_iter().map(|p| p.node_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string(), "d".to_string()]);
        assert!(!sim.is_settled());
        sim.run_ticks(1000);
        assert!(sim.take_settled().is_some());
    }
}
