//! Server configuration.
//!
//! Loading flow, lowest to highest priority:
//! 1. compiled [`ServerConfig::default()`]
//! 2. an optional JSON file, deep-merged over the defaults
//! 3. `CHAOS_*` environment variables
//!
//! CLI flags are applied last by the binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, Level};

use chaos_engine::CallSettings;
use chaos_realtime::{RegistrySettings, SessionSettings};
use chaos_telemetry::{chaos_home, TelemetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub database_path: PathBuf,
    /// HS256 signing secret for bearer tokens. Never serialized.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub jwt_secret: Option<SecretString>,
    pub jwt_audience: String,
    pub session: SessionConfig,
    pub calls: CallConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9999,
            database_path: chaos_home().join("chaos.db"),
            jwt_secret: None,
            jwt_audience: "chaos".into(),
            session: SessionConfig::default(),
            calls: CallConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub request_buffer: usize,
    pub ping_interval_secs: u64,
    pub pong_wait_secs: u64,
    pub write_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub liveness_sweep_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            request_buffer: 1024,
            ping_interval_secs: 54,
            pong_wait_secs: 60,
            write_timeout_secs: 10,
            max_frame_bytes: 512,
            liveness_sweep_secs: 60,
            max_idle_secs: 90,
        }
    }
}

impl SessionConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            queue_capacity: self.queue_capacity,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            request_buffer: self.request_buffer,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ring_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            sweep_interval_secs: 5,
        }
    }
}

impl CallConfig {
    pub fn settings(&self) -> CallSettings {
        CallSettings {
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`..`error`. `RUST_LOG` still wins when set.
    pub level: String,
    /// Per-target overrides, e.g. `{"chaos_realtime": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub json: bool,
    /// Persist warn+ records for `chaos logs`.
    pub persist: bool,
    pub path: PathBuf,
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let telemetry = TelemetryConfig::default();
        Self {
            level: "info".into(),
            modules: BTreeMap::new(),
            json: telemetry.json,
            persist: telemetry.log_to_sqlite,
            path: telemetry.log_db_path,
            retention_days: telemetry.retention_days,
        }
    }
}

impl LoggingConfig {
    /// Unknown level names fall back to `info`; unknown module levels are dropped.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.level.parse().unwrap_or(Level::INFO),
            module_levels: self
                .modules
                .iter()
                .filter_map(|(module, level)| Some((module.clone(), level.parse().ok()?)))
                .collect(),
            json: self.json,
            log_to_sqlite: self.persist,
            log_db_path: self.path.clone(),
            retention_days: self.retention_days,
        }
    }
}

impl ServerConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        debug!(?path, "loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        Self::merged(user)
    }

    /// Deep-merge `overrides` over the defaults.
    pub fn merged(overrides: Value) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;
        Ok(serde_json::from_value(deep_merge(defaults, overrides))?)
    }

    /// Apply `CHAOS_*` overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHAOS_HOST").filter(|v| !v.is_empty()) {
            self.host = v;
        }
        if let Some(v) = lookup("CHAOS_PORT").and_then(|v| v.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = lookup("CHAOS_DATABASE").filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHAOS_JWT_SECRET").filter(|v| !v.is_empty()) {
            self.jwt_secret = Some(SecretString::from(v));
        }
        if let Some(v) = lookup("CHAOS_QUEUE_CAPACITY").and_then(|v| v.parse().ok()).filter(|v| *v > 0) {
            self.session.queue_capacity = v;
        }
        if let Some(v) = lookup("CHAOS_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.logging.level = v;
        }
        if let Some(v) = lookup("CHAOS_LOG_DB").filter(|v| !v.is_empty()) {
            self.logging.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHAOS_RING_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.calls.ring_timeout_secs = v;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Objects merge per key; everything else is replaced. Nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9999");
        assert_eq!(cfg.jwt_audience, "chaos");
        assert!(cfg.jwt_secret.is_none());
        assert_eq!(cfg.session.queue_capacity, 256);
        assert_eq!(cfg.session.session_settings().pong_wait, Duration::from_secs(60));
        assert_eq!(cfg.calls.settings().ring_timeout, Duration::from_secs(30));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let cfg = ServerConfig::merged(json!({
            "port": 8080,
            "jwt_secret": "s3cret",
            "session": { "queue_capacity": 16 },
            "calls": null
        }))
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.session.queue_capacity, 16);
        assert_eq!(cfg.session.pong_wait_secs, 60);
        assert_eq!(cfg.calls.ring_timeout_secs, 30);
        assert_eq!(cfg.jwt_secret.unwrap().expose_secret(), "s3cret");
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "CHAOS_PORT" => Some("7000".into()),
            "CHAOS_JWT_SECRET" => Some("from-env".into()),
            "CHAOS_QUEUE_CAPACITY" => Some("lots".into()),
            "CHAOS_RING_TIMEOUT_SECS" => Some("45".into()),
            _ => None,
        });
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.jwt_secret.unwrap().expose_secret(), "from-env");
        assert_eq!(cfg.session.queue_capacity, 256);
        assert_eq!(cfg.calls.ring_timeout_secs, 45);
    }

    #[test]
    fn secret_is_not_serialized() {
        let cfg = ServerConfig {
            jwt_secret: Some(SecretString::from("hidden")),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("hidden"));
        assert!(!format!("{cfg:?}").contains("hidden"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/chaos.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn logging_section_drives_telemetry() {
        let cfg = ServerConfig::merged(json!({
            "logging": {
                "level": "warn",
                "modules": { "chaos_realtime": "debug", "chaos_engine": "loud" },
                "json": false,
                "path": "/var/lib/chaos/logs.db",
                "retention_days": 3
            }
        }))
        .unwrap();
        let telemetry = cfg.logging.telemetry_config();
        assert_eq!(telemetry.log_level, Level::WARN);
        assert_eq!(telemetry.module_levels, vec![("chaos_realtime".to_string(), Level::DEBUG)]);
        assert!(!telemetry.json);
        assert!(telemetry.log_to_sqlite);
        assert_eq!(telemetry.log_db_path, PathBuf::from("/var/lib/chaos/logs.db"));
        assert_eq!(telemetry.retention_days, 3);
    }

    #[test]
    fn bad_log_level_falls_back_to_info() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "CHAOS_LOG_LEVEL" => Some("chatty".into()),
            "CHAOS_LOG_DB" => Some("/tmp/chaos-logs.db".into()),
            _ => None,
        });
        let telemetry = cfg.logging.telemetry_config();
        assert_eq!(telemetry.log_level, Level::INFO);
        assert_eq!(telemetry.log_db_path, PathBuf::from("/tmp/chaos-logs.db"));
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2], "b": {"c": 1}}), json!({"a": [3], "b": {"d": 2}}));
        assert_eq!(merged, json!({"a": [3], "b": {"c": 1, "d": 2}}));
    }
}
