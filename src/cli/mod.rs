//! CLI argument definitions for cograph.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cograph - real-time sync server for collaborative knowledge graphs.
///
/// Start a server with `cograph serve`, then create graphs with
/// `cograph graph create` and connect editors to `ws://<host>:<port>/ws`.
#[derive(Parser, Debug)]
#[command(name = "cograph")]
#[command(author, version, about = "Real-time sync core for collaborative knowledge graphs", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Path to config.kdl (defaults to the user config directory)
    #[arg(long = "config", global = true, env = "COGRAPH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP + WebSocket sync server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (the next free port is used if it is taken)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database file
        #[arg(long)]
        database: Option<PathBuf>,

        /// Chat agent endpoint; chat is echoed back when unset
        #[arg(long = "agent-url")]
        agent_url: Option<String>,

        /// Disable the server-side layout stabilizer
        #[arg(long = "no-layout")]
        no_layout: bool,
    },

    /// Graph management commands
    Graph {
        #[command(subcommand)]
        command: GraphCommands,
    },

    /// Run the force layout over a stored graph and write the positions back
    Layout {
        /// Graph ID
        graph_id: String,

        /// Compute positions without saving them
        #[arg(long)]
        dry_run: bool,

        /// SQLite database file
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Join a live room and print its events
    Watch {
        /// Graph ID
        graph_id: String,

        /// Server WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:3055/ws")]
        url: String,

        /// User ID to join as
        #[arg(long, default_value = "watcher")]
        user: String,

        /// Display color
        #[arg(long, default_value = "#888888")]
        color: String,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Graph subcommands
#[derive(Subcommand, Debug)]
pub enum GraphCommands {
    /// Create a new graph
    Create {
        /// Graph title
        title: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,

        /// Creator user ID
        #[arg(long, default_value = "cli")]
        creator: String,

        /// Make the graph public
        #[arg(long)]
        public: bool,
    },

    /// List graphs
    List,

    /// Show a graph with all of its nodes, edges, notes and comments
    Show {
        /// Graph ID
        id: String,
    },

    /// Delete a graph and everything in it
    Delete {
        /// Graph ID
        id: String,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the resolved configuration and where each value came from
    Show,

    /// Write a config file with the default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
