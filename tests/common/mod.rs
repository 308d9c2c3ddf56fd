//! Common test utilities for cograph integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't touch the
//! user's data or config directories.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
pub use tempfile::TempDir;

/// A test environment with an isolated data directory and config file.
///
/// The `cograph()` method returns a `Command` that sets `COGRAPH_DATA_DIR`
/// and `COGRAPH_CONFIG` per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub data_dir: TempDir,
    pub config_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            data_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the cograph binary with isolated storage.
    pub fn cograph(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cograph"));
        cmd.current_dir(self.data_dir.path());
        cmd.env("COGRAPH_DATA_DIR", self.data_dir.path());
        cmd.env("COGRAPH_CONFIG", self.config_path());
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Config file location (not created until written).
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.path().join("config.kdl")
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// Database file the CLI uses by default in this environment.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.path().join("cograph").join("cograph.db")
    }

    /// Create a graph through the CLI and return its id.
    pub fn create_graph(&self, title: &str) -> String {
        let output = self
            .cograph()
            .args(["graph", "create", title])
            .output()
            .unwrap();
        assert!(output.status.success(), "graph create failed: {:?}", output);
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        json["graph"]["id"].as_str().unwrap().to_string()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
