use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Get a column value from a row, returning CorruptRow on failure.
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

/// Parse an optional RFC 3339 column.
pub fn parse_time(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::CorruptRow {
                table,
                column,
                detail: format!("invalid timestamp {s:?}: {e}"),
            })
    })
    .transpose()
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}
