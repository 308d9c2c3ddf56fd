//! Command implementations for the Cograph CLI.
//!
//! Each command returns a value implementing [`CommandResult`], which the
//! binary prints as JSON (default) or as human-readable text (`-H`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::client::{ClientOptions, ClientUpdate, SyncClient};
use crate::config::{self, CographConfig, ConfigOverrides, ResolvedConfig, resolve_config};
use crate::models::{Graph, GraphSnapshot, NodePosition, Visibility};
use crate::storage::{GraphStore, generate_id, validate_id};
use crate::sync::LayoutParams;
use crate::sync::layout;
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait CommandResult {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error":"{}"}}"#, e))
}

// ============================================================================
// graph
// ============================================================================

#[derive(Debug, Serialize)]
pub struct GraphCreated {
    pub graph: Graph,
}

impl CommandResult for GraphCreated {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Created graph {} \"{}\" ({})",
            self.graph.id, self.graph.title, self.graph.visibility
        )
    }
}

/// Create a graph with a generated id.
pub fn graph_create(
    store: &mut dyn GraphStore,
    title: &str,
    description: Option<String>,
    creator: &str,
    visibility: Visibility,
) -> Result<GraphCreated> {
    if title.trim().is_empty() {
        return Err(Error::InvalidInput("title must not be empty".to_string()));
    }
    let seed = format!("{}:{}:{}", title, creator, chrono::Utc::now().to_rfc3339());
    let mut graph = Graph::new(generate_id("g", &seed), title.to_string(), creator.to_string());
    graph.description = description;
    graph.visibility = visibility;
    store.create_graph(&graph)?;
    Ok(GraphCreated { graph })
}

#[derive(Debug, Serialize)]
pub struct GraphList {
    pub graphs: Vec<Graph>,
    pub count: usize,
}

impl CommandResult for GraphList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.graphs.is_empty() {
            return "No graphs.".to_string();
        }
        let mut lines = vec![format!("{} graph(s):", self.count)];
        for g in &self.graphs {
            lines.push(format!(
                "  {}  {}  ({} nodes, {} edges, {})",
                g.id, g.title, g.node_count, g.edge_count, g.visibility
            ));
        }
        lines.join("\n")
    }
}

pub fn graph_list(store: &dyn GraphStore) -> Result<GraphList> {
    let graphs = store.list_graphs()?;
    Ok(GraphList {
        count: graphs.len(),
        graphs,
    })
}

#[derive(Debug, Serialize)]
pub struct GraphShow {
    #[serde(flatten)]
    pub snapshot: GraphSnapshot,
}

impl CommandResult for GraphShow {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let s = &self.snapshot;
        let mut lines = vec![
            format!("{} \"{}\"", s.graph.id, s.graph.title),
            format!(
                "  creator: {}  visibility: {}",
                s.graph.creator, s.graph.visibility
            ),
            format!(
                "  {} nodes, {} edges, {} notes, {} comments",
                s.nodes.len(),
                s.edges.len(),
                s.notes.len(),
                s.comments.len()
            ),
        ];
        if let Some(ref description) = s.graph.description {
            lines.insert(1, format!("  {}", description));
        }
        for node in &s.nodes {
            lines.push(format!(
                "  [{}] {} \"{}\" at ({:.1}, {:.1})",
                node.node_type, node.id, node.data.title, node.position.x, node.position.y
            ));
        }
        for edge in &s.edges {
            lines.push(format!(
                "  {} --{}--> {}",
                edge.source, edge.edge_type, edge.target
            ));
        }
        lines.join("\n")
    }
}

pub fn graph_show(store: &dyn GraphStore, id: &str) -> Result<GraphShow> {
    validate_id(id)?;
    Ok(GraphShow {
        snapshot: store.read_graph(id)?,
    })
}

#[derive(Debug, Serialize)]
pub struct GraphDeleted {
    pub deleted: String,
}

impl CommandResult for GraphDeleted {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Deleted graph {}", self.deleted)
    }
}

pub fn graph_delete(store: &mut dyn GraphStore, id: &str) -> Result<GraphDeleted> {
    validate_id(id)?;
    store.delete_graph(id)?;
    Ok(GraphDeleted {
        deleted: id.to_string(),
    })
}

// ============================================================================
// layout
// ============================================================================

#[derive(Debug, Serialize)]
pub struct LayoutResult {
    pub graph_id: String,
    pub ticks: u32,
    /// Nodes whose position was (or would be) written
    pub moved: usize,
    pub dry_run: bool,
    pub positions: Vec<NodePosition>,
}

impl CommandResult for LayoutResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let verb = if self.dry_run { "Would move" } else { "Moved" };
        let mut lines = vec![format!(
            "{} {} node(s) in {} after {} ticks",
            verb, self.moved, self.graph_id, self.ticks
        )];
        for p in &self.positions {
            lines.push(format!(
                "  {} -> ({:.1}, {:.1})",
                p.node_id, p.position.x, p.position.y
            ));
        }
        lines.join("\n")
    }
}

/// Run the stabilizer once against stored positions.
///
/// Non-draggable nodes are pinned. Positions are written back unless
/// `dry_run` is set.
pub fn layout(
    store: &mut dyn GraphStore,
    graph_id: &str,
    params: &LayoutParams,
    dry_run: bool,
) -> Result<LayoutResult> {
    validate_id(graph_id)?;
    let snapshot = store.read_graph(graph_id)?;
    let pinned: HashSet<String> = snapshot
        .nodes
        .iter()
        .filter(|n| !n.draggable)
        .map(|n| n.id.clone())
        .collect();

    let run = layout::run(&snapshot.nodes, &snapshot.edges, &pinned, params);

    let mut moved = Vec::new();
    for position in run.positions {
        let Some(node) = snapshot.node(&position.node_id) else {
            continue;
        };
        if pinned.contains(&node.id) || node.position == position.position {
            continue;
        }
        if !dry_run {
            store.update_node(&node.moved_to(position.position))?;
        }
        moved.push(position);
    }

    Ok(LayoutResult {
        graph_id: graph_id.to_string(),
        ticks: run.ticks,
        moved: moved.len(),
        dry_run,
        positions: moved,
    })
}

// ============================================================================
// config
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ConfigShow {
    pub path: PathBuf,
    pub exists: bool,
    pub config: ResolvedConfig,
}

impl CommandResult for ConfigShow {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let c = &self.config;
        let state = if self.exists { "" } else { " (not found)" };
        let mut lines = vec![format!("Config file: {}{}", self.path.display(), state)];
        let mut row = |key: &str, value: String, source: &dyn std::fmt::Display| {
            lines.push(format!("  {:<20} {:<40} [{}]", key, value, source));
        };
        row("host", c.host.value.clone(), &c.host.source);
        row("port", c.port.value.to_string(), &c.port.source);
        row(
            "database",
            c.database.value.display().to_string(),
            &c.database.source,
        );
        row(
            "broadcast-capacity",
            c.broadcast_capacity.value.to_string(),
            &c.broadcast_capacity.source,
        );
        row("log.level", c.log_level.value.clone(), &c.log_level.source);
        row(
            "log.format",
            c.log_format.value.to_string(),
            &c.log_format.source,
        );
        if let Some(ref file) = c.log_file {
            row("log.file", file.value.display().to_string(), &file.source);
        }
        row(
            "layout.enabled",
            c.layout_enabled.value.to_string(),
            &c.layout_enabled.source,
        );
        row(
            "layout",
            format!(
                "strength={} distance={} alpha-min={}",
                c.layout.strength, c.layout.distance, c.layout.alpha_min
            ),
            &c.layout_source,
        );
        match c.agent_url {
            Some(ref url) => row("agent.url", url.value.clone(), &url.source),
            None => row("agent.url", "(echo agent)".to_string(), &"default"),
        }
        row(
            "agent.timeout-secs",
            c.agent_timeout.value.as_secs().to_string(),
            &c.agent_timeout.source,
        );
        lines.join("\n")
    }
}

pub fn config_show(path: &Path, overrides: &ConfigOverrides) -> Result<ConfigShow> {
    let file = config::load(path)?;
    Ok(ConfigShow {
        path: path.to_path_buf(),
        exists: path.exists(),
        config: resolve_config(&file, overrides)?,
    })
}

#[derive(Debug, Serialize)]
pub struct ConfigInit {
    pub path: PathBuf,
    pub config: CographConfig,
}

impl CommandResult for ConfigInit {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Wrote default config to {}", self.path.display())
    }
}

/// Write a config file populated with the built-in defaults.
pub fn config_init(path: &Path, force: bool) -> Result<ConfigInit> {
    if path.exists() && !force {
        return Err(Error::InvalidInput(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let defaults = resolve_config(&CographConfig::default(), &ConfigOverrides::default())?;
    let config = defaults.to_file_config();
    config::save(path, &config)?;
    Ok(ConfigInit {
        path: path.to_path_buf(),
        config,
    })
}

// ============================================================================
// watch
// ============================================================================

fn describe(update: &ClientUpdate) -> String {
    match update {
        ClientUpdate::State(state) => format!("connection: {:?}", state),
        ClientUpdate::Synced { nodes, edges } => {
            format!("synced: {} nodes, {} edges", nodes, edges)
        }
        ClientUpdate::Changed { kind } => format!("event: {}", kind),
        ClientUpdate::Rejected { kind, reason } => format!("rejected {}: {}", kind, reason),
    }
}

fn update_json(update: &ClientUpdate) -> serde_json::Value {
    match update {
        ClientUpdate::State(state) => serde_json::json!({
            "type": "state",
            "connected": state.is_connected(),
            "attempt": state.reconnect_attempt(),
        }),
        ClientUpdate::Synced { nodes, edges } => serde_json::json!({
            "type": "synced", "nodes": nodes, "edges": edges,
        }),
        ClientUpdate::Changed { kind } => serde_json::json!({ "type": "event", "kind": kind }),
        ClientUpdate::Rejected { kind, reason } => serde_json::json!({
            "type": "rejected", "kind": kind, "reason": reason,
        }),
    }
}

/// Join a live room and print what happens until Ctrl+C.
pub async fn watch(options: ClientOptions, human: bool) -> Result<()> {
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let mut client = SyncClient::new(options, updates_tx);

    let printer = tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            if human {
                println!("{}", describe(&update));
            } else {
                println!("{}", update_json(&update));
            }
        }
    });

    let result = {
        let run = client.run(commands_rx);
        tokio::pin!(run);
        let finished = tokio::select! {
            result = &mut run => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };
        match finished {
            Some(result) => result,
            None => {
                // Closing the command channel makes the client leave and stop.
                drop(commands_tx);
                run.await
            }
        }
    };
    drop(client);
    let _ = printer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{GRAPH, node, seeded_storage};

    #[test]
    fn test_graph_lifecycle() {
        let mut store = seeded_storage();
        let created = graph_create(&mut store, "Ideas", None, "alice", Visibility::Public).unwrap();
        assert!(created.graph.id.starts_with("g-"));

        let list = graph_list(&store).unwrap();
        assert_eq!(list.count, 2);
        assert!(list.to_human().contains("Ideas"));

        let shown = graph_show(&store, &created.graph.id).unwrap();
        assert_eq!(shown.snapshot.graph.title, "Ideas");

        graph_delete(&mut store, &created.graph.id).unwrap();
        assert!(matches!(
            graph_show(&store, &created.graph.id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_graph_create_rejects_blank_title() {
        let mut store = seeded_storage();
        let result = graph_create(&mut store, "  ", None, "alice", Visibility::Private);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_layout_dry_run_writes_nothing() {
        let mut store = seeded_storage();
        store.create_node(&node("a", 0.0, 0.0)).unwrap();
        store.create_node(&node("b", 0.0, 0.0)).unwrap();

        let result = layout(&mut store, GRAPH, &LayoutParams::default(), true).unwrap();
        assert!(result.dry_run);
        assert_eq!(result.moved, 2);
        let snapshot = store.read_graph(GRAPH).unwrap();
        assert!(snapshot.nodes.iter().all(|n| n.position.x == 0.0 && n.position.y == 0.0));
    }

    #[test]
    fn test_layout_writes_positions_and_respects_pins() {
        let mut store = seeded_storage();
        let mut anchor = node("anchor", 5.0, 5.0);
        anchor.draggable = false;
        store.create_node(&anchor).unwrap();
        store.create_node(&node("a", 5.0, 5.0)).unwrap();

        let result = layout(&mut store, GRAPH, &LayoutParams::default(), false).unwrap();
        assert_eq!(result.moved, 1);
        let snapshot = store.read_graph(GRAPH).unwrap();
        let anchor = snapshot.node("anchor").unwrap();
        assert_eq!((anchor.position.x, anchor.position.y), (5.0, 5.0));
        let a = snapshot.node("a").unwrap();
        assert!(a.position.distance_to(&anchor.position) > 1.0);
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.kdl");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            config_init(&path, false),
            Err(Error::InvalidInput(_))
        ));
    }
}
