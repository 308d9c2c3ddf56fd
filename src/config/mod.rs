//! Configuration for Cograph.
//!
//! ## config.kdl
//!
//! Located at (first match wins):
//! - the `--config` CLI flag
//! - `$COGRAPH_CONFIG`
//! - `~/.config/cograph/config.kdl` (platform config directory)
//!
//! A missing file is the same as an empty one. See [`schema`] for the
//! recognized nodes and [`resolver`] for how file values combine with CLI
//! flags and defaults.

pub mod resolver;
pub mod schema;

use std::path::{Path, PathBuf};

use kdl::KdlDocument;

use crate::{Error, Result};

pub use resolver::{ConfigOverrides, Resolved, ResolvedConfig, ValueSource, resolve_config};
pub use schema::{CographConfig, LogFormat};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "COGRAPH_CONFIG";

/// Where config.kdl lives.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(dir.join("cograph").join("config.kdl"))
}

/// Read and validate a config file. A missing file yields the empty config.
pub fn load(path: &Path) -> Result<CographConfig> {
    if !path.exists() {
        return Ok(CographConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    let doc: KdlDocument = content
        .parse()
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    let config = CographConfig::from_kdl(&doc);
    config
        .validate()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(config)
}

/// Write a config file, creating parent directories.
pub fn save(path: &Path, config: &CographConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut doc = config.to_kdl();
    doc.autoformat();
    std::fs::write(path, doc.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path_wins() {
        let path = config_path(Some(Path::new("/tmp/explicit.kdl"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/explicit.kdl"));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let config = load(&dir.path().join("absent.kdl")).unwrap();
        assert_eq!(config, CographConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.kdl");
        let mut config = CographConfig::new();
        config.server.port = Some(4040);
        config.log.format = Some(LogFormat::Json);
        save(&path, &config).unwrap();
        assert_eq!(load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.kdl");
        std::fs::write(&path, "broadcast-capacity 0\n").unwrap();
        assert!(matches!(load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "server {\n").unwrap();
        assert!(matches!(load(&path), Err(Error::Config(_))));
    }
}
