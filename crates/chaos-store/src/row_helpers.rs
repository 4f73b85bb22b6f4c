use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Fixed-width UTC timestamp so that text ordering matches time ordering.
pub fn sql_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    sql_time(Utc::now())
}

/// Escape LIKE special characters for safe pattern matching.
pub fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_core::CallStatus;

    #[test]
    fn escape_like_special_chars() {
        assert_eq!(escape_like("hello"), "hello");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("foo_bar"), "foo\\_bar");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn parse_enum_success() {
        let status: CallStatus = parse_enum("ringing", "calls", "status").unwrap();
        assert_eq!(status, CallStatus::Ringing);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<CallStatus, _> = parse_enum("INVALID", "calls", "status");
        assert!(matches!(result, Err(StoreError::CorruptRow { table: "calls", column: "status", .. })));
    }

    #[test]
    fn sql_time_sorts_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(5);
        assert!(sql_time(a) < sql_time(b));
        assert_eq!(sql_time(a).len(), sql_time(b).len());
    }

    #[test]
    fn parse_time_roundtrip() {
        let raw = now();
        let parsed = parse_time(&raw, "calls", "started_at").unwrap();
        assert_eq!(sql_time(parsed), raw);
    }

    #[test]
    fn parse_time_failure() {
        let result = parse_time("yesterday", "calls", "started_at");
        assert!(matches!(result, Err(StoreError::CorruptRow { column: "started_at", .. })));
    }
}
