//! KDL schema for config.kdl.
//!
//! Every field is optional; unset fields fall through to the next source
//! during resolution (see [`super::resolver`]).
//!
//! # KDL Schema
//!
//! ```kdl
//! server { host "127.0.0.1"; port 3055 }
//! database "/var/lib/cograph/cograph.db"
//! broadcast-capacity 256
//! log { level "info"; format "pretty"; file "/var/log/cograph.log" }
//! layout {
//!     enabled #true
//!     strength -30.0
//!     distance 30.0
//!     alpha 1.0
//!     alpha-decay 0.0228
//!     alpha-min 0.001
//!     velocity-decay 0.4
//!     max-ticks 1000
//!     debounce-ms 250
//! }
//! agent { url "http://localhost:9000/chat"; timeout-secs 60 }
//! ```

use std::path::PathBuf;

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Levels accepted by `log { level ... }`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutSection {
    pub enabled: Option<bool>,
    pub strength: Option<f64>,
    pub distance: Option<f64>,
    pub alpha: Option<f64>,
    pub alpha_decay: Option<f64>,
    pub alpha_min: Option<f64>,
    pub velocity_decay: Option<f64>,
    pub max_ticks: Option<u32>,
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// HTTP agent endpoint; the echo agent is used when unset
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Contents of config.kdl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CographConfig {
    pub server: ServerSection,
    pub database: Option<PathBuf>,
    pub broadcast_capacity: Option<usize>,
    pub log: LogSection,
    pub layout: LayoutSection,
    pub agent: AgentSection,
}

impl CographConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == Some(0) {
            return Err("server port must be 1-65535".to_string());
        }
        if self.broadcast_capacity == Some(0) {
            return Err("broadcast-capacity must be at least 1".to_string());
        }
        if let Some(ref level) = self.log.level {
            if !LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
                return Err(format!(
                    "log level must be one of {}, got {}",
                    LOG_LEVELS.join(", "),
                    level
                ));
            }
        }
        if self.layout.max_ticks == Some(0) {
            return Err("layout max-ticks must be at least 1".to_string());
        }
        if let Some(ref url) = self.agent.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("agent url must be http(s), got {}", url));
            }
        }
        if self.agent.timeout_secs == Some(0) {
            return Err("agent timeout-secs must be at least 1".to_string());
        }
        Ok(())
    }

    /// Parse config from a KDL document.
    ///
    /// Unknown nodes and values of the wrong type are ignored.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        if let Some(server) = section(doc, "server") {
            config.server.host = string_value(server, "host");
            config.server.port = int_value(server, "port").and_then(|p| u16::try_from(p).ok());
        }

        config.database = string_value(doc, "database").map(PathBuf::from);
        config.broadcast_capacity =
            int_value(doc, "broadcast-capacity").and_then(|c| usize::try_from(c).ok());

        if let Some(log) = section(doc, "log") {
            config.log.level = string_value(log, "level");
            config.log.format = string_value(log, "format").and_then(|f| LogFormat::parse(&f));
            config.log.file = string_value(log, "file").map(PathBuf::from);
        }

        if let Some(layout) = section(doc, "layout") {
            let l = &mut config.layout;
            l.enabled = bool_value(layout, "enabled");
            l.strength = float_value(layout, "strength");
            l.distance = float_value(layout, "distance");
            l.alpha = float_value(layout, "alpha");
            l.alpha_decay = float_value(layout, "alpha-decay");
            l.alpha_min = float_value(layout, "alpha-min");
            l.velocity_decay = float_value(layout, "velocity-decay");
            l.max_ticks = int_value(layout, "max-ticks").and_then(|t| u32::try_from(t).ok());
            l.debounce_ms = int_value(layout, "debounce-ms").and_then(|d| u64::try_from(d).ok());
        }

        if let Some(agent) = section(doc, "agent") {
            config.agent.url = string_value(agent, "url");
            config.agent.timeout_secs =
                int_value(agent, "timeout-secs").and_then(|t| u64::try_from(t).ok());
        }

        config
    }

    /// Convert config to a KDL document. Unset values are omitted.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        let mut server = KdlDocument::new();
        if let Some(ref host) = self.server.host {
            push(&mut server, "host", KdlValue::String(host.clone()));
        }
        if let Some(port) = self.server.port {
            push(&mut server, "port", KdlValue::Integer(port as i128));
        }
        push_section(&mut doc, "server", server);

        if let Some(ref database) = self.database {
            push(&mut doc, "database", KdlValue::String(database.display().to_string()));
        }
        if let Some(capacity) = self.broadcast_capacity {
            push(&mut doc, "broadcast-capacity", KdlValue::Integer(capacity as i128));
        }

        let mut log = KdlDocument::new();
        if let Some(ref level) = self.log.level {
            push(&mut log, "level", KdlValue::String(level.clone()));
        }
        if let Some(format) = self.log.format {
            push(&mut log, "format", KdlValue::String(format.as_str().to_string()));
        }
        if let Some(ref file) = self.log.file {
            push(&mut log, "file", KdlValue::String(file.display().to_string()));
        }
        push_section(&mut doc, "log", log);

        let mut layout = KdlDocument::new();
        let l = &self.layout;
        if let Some(enabled) = l.enabled {
            push(&mut layout, "enabled", KdlValue::Bool(enabled));
        }
        for (name, value) in [
            ("strength", l.strength),
            ("distance", l.distance),
            ("alpha", l.alpha),
            ("alpha-decay", l.alpha_decay),
            ("alpha-min", l.alpha_min),
            ("velocity-decay", l.velocity_decay),
        ] {
            if let Some(v) = value {
                push(&mut layout, name, KdlValue::Float(v));
            }
        }
        if let Some(ticks) = l.max_ticks {
            push(&mut layout, "max-ticks", KdlValue::Integer(ticks as i128));
        }
        if let Some(ms) = l.debounce_ms {
            push(&mut layout, "debounce-ms", KdlValue::Integer(ms as i128));
        }
        push_section(&mut doc, "layout", layout);

        let mut agent = KdlDocument::new();
        if let Some(ref url) = self.agent.url {
            push(&mut agent, "url", KdlValue::String(url.clone()));
        }
        if let Some(secs) = self.agent.timeout_secs {
            push(&mut agent, "timeout-secs", KdlValue::Integer(secs as i128));
        }
        push_section(&mut doc, "agent", agent);

        doc
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &CographConfig) {
        fn take<T: Clone>(into: &mut Option<T>, from: &Option<T>) {
            if from.is_some() {
                *into = from.clone();
            }
        }

        take(&mut self.server.host, &other.server.host);
        take(&mut self.server.port, &other.server.port);
        take(&mut self.database, &other.database);
        take(&mut self.broadcast_capacity, &other.broadcast_capacity);
        take(&mut self.log.level, &other.log.level);
        take(&mut self.log.format, &other.log.format);
        take(&mut self.log.file, &other.log.file);
        take(&mut self.layout.enabled, &other.layout.enabled);
        take(&mut self.layout.strength, &other.layout.strength);
        take(&mut self.layout.distance, &other.layout.distance);
        take(&mut self.layout.alpha, &other.layout.alpha);
        take(&mut self.layout.alpha_decay, &other.layout.alpha_decay);
        take(&mut self.layout.alpha_min, &other.layout.alpha_min);
        take(&mut self.layout.velocity_decay, &other.layout.velocity_decay);
        take(&mut self.layout.max_ticks, &other.layout.max_ticks);
        take(&mut self.layout.debounce_ms, &other.layout.debounce_ms);
        take(&mut self.agent.url, &other.agent.url);
        take(&mut self.agent.timeout_secs, &other.agent.timeout_secs);
    }
}

fn section<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlDocument> {
    doc.get(name).and_then(|node| node.children())
}

fn first_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .map(|entry| entry.value())
}

fn string_value(doc: &KdlDocument, name: &str) -> Option<String> {
    first_value(doc, name)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

fn int_value(doc: &KdlDocument, name: &str) -> Option<i128> {
    first_value(doc, name).and_then(|v| v.as_integer())
}

/// Floats also accept integer literals (`strength -30`).
fn float_value(doc: &KdlDocument, name: &str) -> Option<f64> {
    let value = first_value(doc, name)?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

fn bool_value(doc: &KdlDocument, name: &str) -> Option<bool> {
    first_value(doc, name).and_then(|v| v.as_bool())
}

fn push(doc: &mut KdlDocument, name: &str, value: KdlValue) {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(value));
    doc.nodes_mut().push(node);
}

fn push_section(doc: &mut KdlDocument, name: &str, children: KdlDocument) {
    if children.nodes().is_empty() {
        return;
    }
    let mut node = KdlNode::new(name);
    node.set_children(children);
    doc.nodes_mut().push(node);
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
server { host "0.0.0.0"; port 4000 }
database "/tmp/cograph.db"
broadcast-capacity 64
log { level "debug"; format "json"; file "/tmp/cograph.log" }
layout {
    enabled #false
    strength -30
    distance 45.5
    alpha-min 0.01
    max-ticks 200
    debounce-ms 100
}
agent { url "http://localhost:9000/chat"; timeout-secs 5 }
"#;

    fn parse(s: &str) -> KdlDocument {
        s.parse().unwrap()
    }

    #[test]
    fn test_config_from_kdl_empty() {
        let config = CographConfig::from_kdl(&parse(""));
        assert_eq!(config, CographConfig::default());
    }

    #[test]
    fn test_config_from_kdl_full() {
        let config = CographConfig::from_kdl(&parse(FULL));
        assert_eq!(config.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.server.port, Some(4000));
        assert_eq!(config.database, Some(PathBuf::from("/tmp/cograph.db")));
        assert_eq!(config.broadcast_capacity, Some(64));
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.log.format, Some(LogFormat::Json));
        assert_eq!(config.layout.enabled, Some(false));
        assert_eq!(config.layout.strength, Some(-30.0));
        assert_eq!(config.layout.distance, Some(45.5));
        assert_eq!(config.layout.max_ticks, Some(200));
        assert_eq!(config.layout.debounce_ms, Some(100));
        assert_eq!(config.agent.timeout_secs, Some(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_ignores_wrong_types() {
        let config = CographConfig::from_kdl(&parse(r#"server { port "high" }
broadcast-capacity -1"#));
        assert_eq!(config.server.port, None);
        assert_eq!(config.broadcast_capacity, None);
    }

    #[test]
    fn test_config_to_kdl_roundtrip() {
        let original = CographConfig::from_kdl(&parse(FULL));
        let mut doc = original.to_kdl();
        doc.autoformat();
        let text = doc.to_string();
        let reparsed = CographConfig::from_kdl(&parse(&text));
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_empty_sections_omitted() {
        let mut config = CographConfig::new();
        config.server.port = Some(3055);
        let doc = config.to_kdl();
        assert!(doc.get("server").is_some());
        assert!(doc.get("log").is_none());
        assert!(doc.get("layout").is_none());
    }

    #[test]
    fn test_config_merge() {
        let mut base = CographConfig::from_kdl(&parse(FULL));
        let mut other = CographConfig::new();
        other.server.port = Some(5000);
        other.layout.enabled = Some(true);
        base.merge(&other);
        assert_eq!(base.server.port, Some(5000));
        assert_eq!(base.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(base.layout.enabled, Some(true));
        assert_eq!(base.layout.distance, Some(45.5));
    }

    #[test]
    fn test_config_validate_rejects_bad_values() {
        let mut config = CographConfig::new();
        config.log.level = Some("loud".to_string());
        assert!(config.validate().is_err());

        let mut config = CographConfig::new();
        config.broadcast_capacity = Some(0);
        assert!(config.validate().is_err());

        let mut config = CographConfig::new();
        config.agent.url = Some("ftp://agent".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
        assert_eq!(LogFormat::default().to_string(), "pretty");
    }
}
