//! Precedence resolution for configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (or the environment variable bound to the flag)
//! 2. config.kdl
//! 3. Environment fallbacks (`RUST_LOG`, `COGRAPH_DATA_DIR`)
//! 4. Built-in defaults
//!
//! Each resolved value remembers its source so `config show` can explain
//! where it came from.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::Result;
use crate::config::schema::{CographConfig, LogFormat};
use crate::server::DEFAULT_PORT;
use crate::storage::{DATA_DIR_ENV, default_database_path};
use crate::sync::bus::DEFAULT_CAPACITY;
use crate::sync::{HubSettings, LayoutParams};

/// Default bind address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default log level when nothing else is configured.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable that overrides the configured log filter.
pub const RUST_LOG_ENV: &str = "RUST_LOG";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from CLI flag
    CliFlag,
    /// Value from config.kdl
    ConfigFile,
    /// Value from an environment variable
    EnvVar(String),
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::ConfigFile => write!(f, "config"),
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Pick the first present value in precedence order.
fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> Resolved<T> {
    match (cli, file) {
        (Some(v), _) => Resolved::new(v, ValueSource::CliFlag),
        (None, Some(v)) => Resolved::new(v, ValueSource::ConfigFile),
        (None, None) => Resolved::new(default, ValueSource::Default),
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub host: Resolved<String>,
    pub port: Resolved<u16>,
    pub database: Resolved<PathBuf>,
    pub broadcast_capacity: Resolved<usize>,
    pub log_level: Resolved<String>,
    pub log_format: Resolved<LogFormat>,
    pub log_file: Option<Resolved<PathBuf>>,
    pub layout_enabled: Resolved<bool>,
    #[serde(skip)]
    pub layout: LayoutParams,
    pub layout_source: ValueSource,
    pub agent_url: Option<Resolved<String>>,
    #[serde(serialize_with = "serialize_secs")]
    pub agent_timeout: Resolved<Duration>,
}

fn serialize_secs<S: serde::Serializer>(
    value: &Resolved<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    Resolved::new(value.value.as_secs(), value.source.clone()).serialize(serializer)
}

impl ResolvedConfig {
    /// Layout parameters, or `None` when layout is disabled.
    pub fn layout_params(&self) -> Option<LayoutParams> {
        self.layout_enabled.value.then(|| self.layout.clone())
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            bus_capacity: self.broadcast_capacity.value,
            layout: self.layout_params(),
        }
    }

    /// The file form of this configuration, used by `config init`.
    pub fn to_file_config(&self) -> CographConfig {
        let mut config = CographConfig::new();
        config.server.host = Some(self.host.value.clone());
        config.server.port = Some(self.port.value);
        config.database = Some(self.database.value.clone());
        config.broadcast_capacity = Some(self.broadcast_capacity.value);
        config.log.level = Some(self.log_level.value.clone());
        config.log.format = Some(self.log_format.value);
        config.log.file = self.log_file.as_ref().map(|r| r.value.clone());
        config.layout.enabled = Some(self.layout_enabled.value);
        config.layout.strength = Some(self.layout.strength);
        config.layout.distance = Some(self.layout.distance);
        config.layout.alpha = Some(self.layout.alpha);
        config.layout.alpha_decay = Some(self.layout.alpha_decay);
        config.layout.alpha_min = Some(self.layout.alpha_min);
        config.layout.velocity_decay = Some(self.layout.velocity_decay);
        config.layout.max_ticks = Some(self.layout.max_ticks);
        config.layout.debounce_ms = Some(self.layout.debounce.as_millis() as u64);
        config.agent.url = self.agent_url.as_ref().map(|r| r.value.clone());
        config.agent.timeout_secs = Some(self.agent_timeout.value.as_secs());
        config
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<PathBuf>,
    pub agent_url: Option<String>,
    /// `--no-layout`
    pub disable_layout: bool,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Some(path.into());
        self
    }

    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = Some(url.into());
        self
    }
}

/// Resolve configuration with full precedence chain.
pub fn resolve_config(file: &CographConfig, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let database = match (&overrides.database, &file.database) {
        (Some(path), _) => Resolved::new(path.clone(), ValueSource::CliFlag),
        (None, Some(path)) => Resolved::new(path.clone(), ValueSource::ConfigFile),
        (None, None) => {
            let source = if std::env::var_os(DATA_DIR_ENV).is_some() {
                ValueSource::EnvVar(DATA_DIR_ENV.to_string())
            } else {
                ValueSource::Default
            };
            Resolved::new(default_database_path()?, source)
        }
    };

    // RUST_LOG sits above the file here because it is the operator's
    // per-run override.
    let log_level = match std::env::var(RUST_LOG_ENV) {
        Ok(filter) if !filter.is_empty() => {
            Resolved::new(filter, ValueSource::EnvVar(RUST_LOG_ENV.to_string()))
        }
        _ => pick(None, file.log.level.clone(), DEFAULT_LOG_LEVEL.to_string()),
    };

    let layout_enabled = if overrides.disable_layout {
        Resolved::new(false, ValueSource::CliFlag)
    } else {
        pick(None, file.layout.enabled, true)
    };

    let defaults = LayoutParams::default();
    let l = &file.layout;
    let layout = LayoutParams {
        strength: l.strength.unwrap_or(defaults.strength),
        distance: l.distance.unwrap_or(defaults.distance),
        alpha: l.alpha.unwrap_or(defaults.alpha),
        alpha_min: l.alpha_min.unwrap_or(defaults.alpha_min),
        alpha_decay: l.alpha_decay.unwrap_or(defaults.alpha_decay),
        velocity_decay: l.velocity_decay.unwrap_or(defaults.velocity_decay),
        max_ticks: l.max_ticks.unwrap_or(defaults.max_ticks),
        debounce: l
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce),
        ..defaults
    };
    layout.validate()?;
    let layout_source = if layout == LayoutParams::default() {
        ValueSource::Default
    } else {
        ValueSource::ConfigFile
    };

    let agent_url = match (&overrides.agent_url, &file.agent.url) {
        (Some(url), _) => Some(Resolved::new(url.clone(), ValueSource::CliFlag)),
        (None, Some(url)) => Some(Resolved::new(url.clone(), ValueSource::ConfigFile)),
        (None, None) => None,
    };

    Ok(ResolvedConfig {
        host: pick(
            overrides.host.clone(),
            file.server.host.clone(),
            DEFAULT_HOST.to_string(),
        ),
        port: pick(overrides.port, file.server.port, DEFAULT_PORT),
        database,
        broadcast_capacity: pick(None, file.broadcast_capacity, DEFAULT_CAPACITY),
        log_level,
        log_format: pick(None, file.log.format, LogFormat::default()),
        log_file: file
            .log
            .file
            .clone()
            .map(|p| Resolved::new(p, ValueSource::ConfigFile)),
        layout_enabled,
        layout,
        layout_source,
        agent_url,
        agent_timeout: pick(
            None,
            file.agent.timeout_secs.map(Duration::from_secs),
            crate::agent::DEFAULT_TIMEOUT,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config() -> CographConfig {
        let mut config = CographConfig::new();
        config.server.host = Some("0.0.0.0".to_string());
        config.server.port = Some(4000);
        config.database = Some(PathBuf::from("/tmp/file.db"));
        config.layout.distance = Some(50.0);
        config.agent.timeout_secs = Some(5);
        config
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let overrides = ConfigOverrides::new().with_database("/tmp/x.db");
        let resolved = resolve_config(&CographConfig::new(), &overrides).unwrap();
        assert_eq!(resolved.host.value, DEFAULT_HOST);
        assert_eq!(resolved.host.source, ValueSource::Default);
        assert_eq!(resolved.port.value, DEFAULT_PORT);
        assert_eq!(resolved.broadcast_capacity.value, DEFAULT_CAPACITY);
        assert!(resolved.layout_enabled.value);
        assert_eq!(resolved.layout_source, ValueSource::Default);
        assert!(resolved.agent_url.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let resolved = resolve_config(&file_config(), &ConfigOverrides::new()).unwrap();
        assert_eq!(resolved.host.value, "0.0.0.0");
        assert_eq!(resolved.host.source, ValueSource::ConfigFile);
        assert_eq!(resolved.port.value, 4000);
        assert_eq!(resolved.database.value, PathBuf::from("/tmp/file.db"));
        assert_eq!(resolved.layout.distance, 50.0);
        assert_eq!(resolved.layout_source, ValueSource::ConfigFile);
        assert_eq!(resolved.agent_timeout.value, Duration::from_secs(5));
    }

    #[test]
    fn test_cli_overrides_file() {
        let overrides = ConfigOverrides::new()
            .with_port(5000)
            .with_database("/tmp/cli.db")
            .with_agent_url("http://localhost:1/chat");
        let resolved = resolve_config(&file_config(), &overrides).unwrap();
        assert_eq!(resolved.port.value, 5000);
        assert_eq!(resolved.port.source, ValueSource::CliFlag);
        assert_eq!(resolved.host.source, ValueSource::ConfigFile);
        assert_eq!(resolved.database.value, PathBuf::from("/tmp/cli.db"));
        assert_eq!(
            resolved.agent_url.map(|r| r.source),
            Some(ValueSource::CliFlag)
        );
    }

    #[test]
    fn test_no_layout_flag_disables_stabilizer() {
        let mut file = file_config();
        file.layout.enabled = Some(true);
        let overrides = ConfigOverrides {
            disable_layout: true,
            ..ConfigOverrides::new()
        };
        let resolved = resolve_config(&file, &overrides).unwrap();
        assert!(resolved.layout_params().is_none());
        assert!(resolved.hub_settings().layout.is_none());
    }

    #[test]
    fn test_invalid_layout_is_config_error() {
        let mut file = file_config();
        file.layout.alpha_decay = Some(1.5);
        let result = resolve_config(&file, &ConfigOverrides::new());
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_file_config_roundtrip_through_resolution() {
        let resolved = resolve_config(&file_config(), &ConfigOverrides::new()).unwrap();
        let again = resolve_config(&resolved.to_file_config(), &ConfigOverrides::new()).unwrap();
        assert_eq!(again.port.value, resolved.port.value);
        assert_eq!(again.layout, resolved.layout);
        assert_eq!(again.agent_timeout.value, resolved.agent_timeout.value);
    }

    #[test]
    fn test_value_source_display() {
        assert_eq!(ValueSource::CliFlag.to_string(), "cli");
        assert_eq!(ValueSource::ConfigFile.to_string(), "config");
        assert_eq!(ValueSource::EnvVar("RUST_LOG".to_string()).to_string(), "env:RUST_LOG");
        assert_eq!(ValueSource::Default.to_string(), "default");
    }
}
