mod logging;

pub use logging::{Correlation, LogFilter, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "chaos_realtime" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; otherwise human-readable output.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Persisted records older than this many days are pruned at startup.
    /// 0 keeps everything.
    pub retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: chaos_home().join("logs.db"),
            retention_days: 14,
        }
    }
}

/// What [`init_telemetry`] ended up doing.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    /// Set when warn+ records are being persisted.
    pub log_db: Option<PathBuf>,
    /// Records removed by the startup retention pass.
    pub pruned: usize,
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let mut guard = TelemetryGuard::default();
    let sqlite_layer = if config.log_to_sqlite {
        match SqliteLogSink::open(&config.log_db_path) {
            Ok(sink) => {
                guard.pruned = prune_expired(&sink, config.retention_days);
                guard.log_db = Some(config.log_db_path.clone());
                Some(SqliteLogLayer::new(Arc::new(sink)))
            }
            Err(e) => {
                eprintln!("chaos-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init();

    guard
}

fn prune_expired(sink: &SqliteLogSink, retention_days: u32) -> usize {
    if retention_days == 0 {
        return 0;
    }
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    sink.prune_before(cutoff).unwrap_or_else(|e| {
        eprintln!("chaos-telemetry: log retention failed: {e}");
        0
    })
}

/// `EnvFilter` directives for the configured default and per-module levels.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// `~/.chaos`, or `/tmp/.chaos` without a home directory.
pub fn chaos_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".chaos")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("chaos_realtime".into(), Level::DEBUG),
                ("chaos_engine::calls".into(), Level::TRACE),
            ],
            ..Default::default()
        };
        assert_eq!(
            filter_directives(&config),
            "warn,chaos_realtime=debug,chaos_engine::calls=trace"
        );
    }

    #[test]
    fn default_paths_live_under_chaos_home() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.starts_with(chaos_home()));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn init_without_sqlite_has_no_sink() {
        let guard = init_telemetry(TelemetryConfig {
            log_to_sqlite: false,
            ..Default::default()
        });
        assert!(guard.log_db.is_none());
        assert_eq!(guard.pruned, 0);
    }

    #[test]
    fn retention_zero_keeps_everything() {
        let sink = SqliteLogSink::in_memory().unwrap();
        assert_eq!(prune_expired(&sink, 0), 0);
        assert_eq!(prune_expired(&sink, 7), 0);
    }
}
