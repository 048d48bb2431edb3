//! External configuration collaborators.
//!
//! Breaker tuning is read through [`ConfigSource`], a read-only key lookup. Keys follow the
//! `hystrix.command.<name>.<Property>` convention; values are raw strings interpreted by the
//! [`PropertyResolver`](crate::PropertyResolver).

use crate::adaptive::DynamicConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Read-only key lookup backing breaker configuration.
pub trait ConfigSource: Send + Sync + std::fmt::Debug {
    /// Raw value for `key`, if configured.
    fn get(&self, key: &str) -> Option<String>;

    /// Refresh from the backing store. Sources without one keep their current values.
    fn reload(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// In-memory source, writable at runtime.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    entries: DynamicConfig<HashMap<String, String>>,
}

impl MapConfigSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace a value.
    pub fn set(&self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        self.entries.update(|current| {
            let mut next = current.clone();
            next.insert(key.clone(), value.clone());
            next
        });
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) {
        self.entries.update(|current| {
            let mut next = current.clone();
            next.remove(key);
            next
        });
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get().get(key).cloned()
    }
}

/// TOML-backed source. Nested tables are flattened into dotted keys.
///
/// ```rust
/// use lifeguard::{ConfigSource, TomlConfigSource};
///
/// let source = TomlConfigSource::from_toml_str(r#"
///     [hystrix.command.quotes]
///     Timeout = 250
/// "#).unwrap();
/// assert_eq!(source.get("hystrix.command.quotes.Timeout").as_deref(), Some("250"));
/// ```
#[derive(Debug, Clone)]
pub struct TomlConfigSource {
    path: Option<PathBuf>,
    entries: DynamicConfig<HashMap<String, String>>,
}

impl TomlConfigSource {
    /// Parse a TOML document held in memory. `reload` keeps these values.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self { path: None, entries: DynamicConfig::new(parse_flat(raw)?) })
    }

    /// Load a TOML file. `reload` re-reads it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let entries = read_flat(&path)?;
        Ok(Self { path: Some(path), entries: DynamicConfig::new(entries) })
    }

    /// Flattened keys currently loaded, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.get().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ConfigSource for TomlConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get().get(key).cloned()
    }

    fn reload(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            let entries = read_flat(path)?;
            tracing::info!(
                target: "lifeguard::config",
                path = %path.display(),
                keys = entries.len(),
                "configuration reloaded"
            );
            self.entries.set(entries);
        }
        Ok(())
    }
}

fn read_flat(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_flat(&raw)
}

fn parse_flat(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let table: toml::Table = raw.parse().map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
    let mut out = HashMap::new();
    flatten("", &toml::Value::Table(table), &mut out);
    Ok(out)
}

fn flatten(prefix: &str, value: &toml::Value, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                flatten(&key, v, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Configuration refresh notice broadcast on the config bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshEvent {
    /// Event kind, e.g. `RefreshRemoteApplicationEvent`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Emission time (epoch millis).
    #[serde(default)]
    pub timestamp: i64,
    /// Service that triggered the refresh.
    #[serde(default)]
    pub origin_service: String,
    /// Pattern naming the services that should reload.
    #[serde(default)]
    pub destination_service: String,
    /// Event identifier.
    #[serde(default)]
    pub id: String,
}

impl RefreshEvent {
    /// Decode from a bus payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(payload).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Whether the event addresses `service`.
    pub fn targets(&self, service: &str) -> bool {
        !service.is_empty() && self.destination_service.contains(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn map_source_set_and_remove() {
        let source = MapConfigSource::new().with("hystrix.command.a.Timeout", 250);
        assert_eq!(source.get("hystrix.command.a.Timeout").as_deref(), Some("250"));
        source.remove("hystrix.command.a.Timeout");
        assert!(source.get("hystrix.command.a.Timeout").is_none());
    }

    #[test]
    fn toml_tables_flatten_to_dotted_keys() {
        let source = TomlConfigSource::from_toml_str(
            r#"
            server_port = 6767
            [hystrix.command.quotes]
            Timeout = 250
            SleepWindow = "1000"
            "#,
        )
        .unwrap();

        assert_eq!(source.get("server_port").as_deref(), Some("6767"));
        assert_eq!(source.get("hystrix.command.quotes.Timeout").as_deref(), Some("250"));
        assert_eq!(source.get("hystrix.command.quotes.SleepWindow").as_deref(), Some("1000"));
        assert_eq!(
            source.keys(),
            vec![
                "hystrix.command.quotes.SleepWindow".to_string(),
                "hystrix.command.quotes.Timeout".to_string(),
                "server_port".to_string(),
            ]
        );
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let err = TomlConfigSource::from_toml_str("[unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = TomlConfigSource::from_path("/nonexistent/lifeguard.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn file_source_reload_picks_up_changes() {
        let path = std::env::temp_dir()
            .join(format!("lifeguard-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[hystrix.command.a]\nTimeout = 100\n").unwrap();
        let source = TomlConfigSource::from_path(&path).unwrap();
        assert_eq!(source.get("hystrix.command.a.Timeout").as_deref(), Some("100"));

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[hystrix.command.a]\nTimeout = 900").unwrap();
        drop(file);

        source.reload().unwrap();
        assert_eq!(source.get("hystrix.command.a.Timeout").as_deref(), Some("900"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn refresh_event_matches_destination() {
        let payload = br#"{"type":"RefreshRemoteApplicationEvent","timestamp":1494514362123,
            "originService":"config-server:docker:8888","destinationService":"accountservice:**",
            "id":"53e61c71-cbae-4b6d-84bb-d0dcc0aeb4dc"}"#;
        let event = RefreshEvent::from_slice(payload).unwrap();
        assert_eq!(event.kind, "RefreshRemoteApplicationEvent");
        assert!(event.targets("accountservice"));
        assert!(!event.targets("vipservice"));
        assert!(!event.targets(""));
    }

    #[test]
    fn refresh_event_rejects_garbage() {
        assert!(matches!(RefreshEvent::from_slice(b"not json"), Err(ConfigError::Parse(_))));
    }
}
