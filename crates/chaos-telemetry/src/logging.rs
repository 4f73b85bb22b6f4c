//! Persistent warn+ log store.
//!
//! Warnings and errors carry the ids needed to reconstruct an incident
//! (which user, which connection, which call) into their own indexed
//! columns, so `chaos logs --call-id ..` can pull a call's trouble without
//! scanning JSON.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        at TEXT NOT NULL,
        level TEXT NOT NULL,
        severity INTEGER NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        user_id TEXT,
        call_id TEXT,
        connection_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_at ON logs(at);
    CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id, at);
    CREATE INDEX IF NOT EXISTS idx_logs_call ON logs(call_id, at);";

/// Correlation ids lifted out of event and span fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub user_id: Option<String>,
    pub call_id: Option<String>,
    pub connection_id: Option<String>,
}

impl Correlation {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "user_id" => Some(&mut self.user_id),
            "call_id" => Some(&mut self.call_id),
            "connection_id" => Some(&mut self.connection_id),
            _ => None,
        }
    }

    /// Fill gaps from an enclosing span; the event's own values win.
    fn inherit(&mut self, outer: &Correlation) {
        for (mine, theirs) in [
            (&mut self.user_id, &outer.user_id),
            (&mut self.call_id, &outer.call_id),
            (&mut self.connection_id, &outer.connection_id),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.call_id.is_none() && self.connection_id.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining structured fields as a JSON object.
    pub fields: Option<Value>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

/// Newest-first selection over persisted records. Unset filters match all.
#[derive(Clone, Debug)]
pub struct LogFilter {
    /// `WARN` returns warnings and errors; `ERROR` only errors.
    pub min_level: Level,
    pub user_id: Option<String>,
    pub call_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            min_level: Level::WARN,
            user_id: None,
            call_id: None,
            since: None,
            limit: 100,
        }
    }
}

/// Fixed-width UTC timestamps, so text order is time order.
fn stamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lower is more severe, so `severity <= n` selects "n and worse".
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        Level::TRACE => 5,
    }
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent() {
            // A missing directory surfaces as an open error below.
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_schema(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn append(&self, level: Level, target: &str, captured: Captured) {
        let fields = (!captured.fields.is_empty())
            .then(|| Value::Object(captured.fields).to_string());
        let conn = self.conn.lock();
        // A failed log write has nowhere to be reported.
        let _ = conn.execute(
            "INSERT INTO logs (at, level, severity, target, message, fields, user_id, call_id, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stamp(Utc::now()),
                level.as_str(),
                severity(level),
                target,
                captured.message,
                fields,
                captured.correlation.user_id,
                captured.correlation.call_id,
                captured.correlation.connection_id,
            ],
        );
    }

    pub fn recent(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, at, level, target, message, fields, user_id, call_id, connection_id
             FROM logs
             WHERE severity <= ?1
               AND (?2 IS NULL OR user_id = ?2)
               AND (?3 IS NULL OR call_id = ?3)
               AND (?4 IS NULL OR at >= ?4)
             ORDER BY id DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                severity(filter.min_level),
                filter.user_id,
                filter.call_id,
                filter.since.map(stamp),
                filter.limit,
            ],
            |row| {
                let fields: Option<String> = row.get(5)?;
                Ok(LogRecord {
                    id: row.get(0)?,
                    at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: fields.and_then(|raw| serde_json::from_str(&raw).ok()),
                    correlation: Correlation {
                        user_id: row.get(6)?,
                        call_id: row.get(7)?,
                        connection_id: row.get(8)?,
                    },
                })
            },
        )?;
        rows.collect()
    }

    /// Delete records older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        self.conn
            .lock()
            .execute("DELETE FROM logs WHERE at < ?1", [stamp(cutoff)])
    }

    /// Timestamp of the oldest retained record.
    pub fn oldest(&self) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT at FROM logs ORDER BY id LIMIT 1", [], |row| row.get(0))
            .optional()
    }
}

/// Everything an event or span carried, sorted into message, correlation
/// ids and the rest.
#[derive(Default)]
struct Captured {
    message: String,
    correlation: Correlation,
    fields: Map<String, Value>,
}

impl Captured {
    fn keep(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn keep_text(&mut self, field: &Field, text: String) {
        if field.name() == "message" {
            self.message = text;
        } else if let Some(slot) = self.correlation.slot(field.name()) {
            *slot = Some(text);
        } else {
            self.keep(field, Value::String(text));
        }
    }
}

impl Visit for Captured {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.keep_text(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%display` fields arrive here already formatted; `?debug` strings are quoted.
        let text = format!("{value:?}");
        let text = match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            Some(inner) if field.name() != "message" => inner.to_string(),
            _ => text,
        };
        self.keep_text(field, text);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.keep(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.keep(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.keep(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.keep(field, Value::Number(n));
        }
    }
}

/// Persists warn and error events into a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        attrs.record(&mut captured);
        if captured.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(captured.correlation);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut captured = Captured::default();
        event.record(&mut captured);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    captured.correlation.inherit(outer);
                }
            }
        }
        self.sink.append(*meta.level(), meta.target(), captured);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn only_warn_and_error_are_kept() {
        let sink = capture(|| {
            tracing::debug!("noise");
            tracing::info!("routine");
            tracing::warn!("slow consumer");
            tracing::error!("store unavailable");
        });
        let all = sink.recent(&LogFilter::default()).unwrap();
        let messages: Vec<&str> = all.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["store unavailable", "slow consumer"]);

        let errors = sink
            .recent(&LogFilter {
                min_level: Level::ERROR,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].level, "ERROR");
    }

    #[test]
    fn correlation_ids_get_columns_and_rest_is_json() {
        let sink = capture(|| {
            tracing::warn!(user_id = %"usr_7", connection_id = "conn_1", queue = 256u64, evicted = true, "outbound queue full");
        });
        let record = &sink.recent(&LogFilter::default()).unwrap()[0];
        assert_eq!(record.correlation.user_id.as_deref(), Some("usr_7"));
        assert_eq!(record.correlation.connection_id.as_deref(), Some("conn_1"));
        assert!(record.correlation.call_id.is_none());
        let fields = record.fields.as_ref().unwrap();
        assert_eq!(fields["queue"], 256);
        assert_eq!(fields["evicted"], true);
        assert!(fields.get("user_id").is_none());
    }

    #[test]
    fn events_inherit_ids_from_enclosing_spans() {
        let sink = capture(|| {
            let outer = tracing::info_span!("call", call_id = "call_42", user_id = "usr_outer");
            let _outer = outer.enter();
            tracing::warn!(user_id = "usr_inner", "transcript failed");
        });
        let record = &sink.recent(&LogFilter::default()).unwrap()[0];
        assert_eq!(record.correlation.call_id.as_deref(), Some("call_42"));
        assert_eq!(record.correlation.user_id.as_deref(), Some("usr_inner"));
    }

    #[test]
    fn filter_by_call_and_limit() {
        let sink = capture(|| {
            for i in 0..5 {
                tracing::warn!(call_id = "call_1", "attempt {i}");
            }
            tracing::warn!(call_id = "call_2", "other call");
        });
        let records = sink
            .recent(&LogFilter {
                call_id: Some("call_1".into()),
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["attempt 4", "attempt 3"]);
    }

    #[test]
    fn prune_drops_old_records() {
        let sink = capture(|| tracing::warn!("old news"));
        assert!(sink.oldest().unwrap().is_some());

        assert_eq!(sink.prune_before(Utc::now() - chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(sink.prune_before(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(sink.oldest().unwrap().is_none());
    }

    #[test]
    fn file_sink_creates_parent_directory() {
        let dir = std::env::temp_dir().join(format!("chaos-logs-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("logs.db");
        let sink = SqliteLogSink::open(&path).unwrap();
        assert!(sink.recent(&LogFilter::default()).unwrap().is_empty());
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
