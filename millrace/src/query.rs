//! Rendered parameterized statements.
//!
//! Schema and offsets adapters produce [Query] values: a SQL string plus the
//! arguments to bind. Keeping rendering separate from execution lets the
//! adapters stay synchronous and lets tests assert on the exact SQL shape.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgArguments, Postgres};

/// Expression capturing the transaction-ordering token at write time.
///
/// `pg_current_xact_id()` is assigned when first evaluated inside the
/// transaction; the bigint cast keeps the column comparable without an xid8
/// codec on the driver side.
pub(crate) const CURRENT_TX_ID: &str = "pg_current_xact_id()::text::bigint";

/// Snapshot lower bound: every transaction id below this has finished, so
/// reading only below it can never skip a row from a still-open transaction.
pub(crate) const SNAPSHOT_XMIN: &str = "pg_snapshot_xmin(pg_current_snapshot())::text::bigint";

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    I64(i64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

/// A parameterized statement ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Binds the arguments onto an executable sqlx query.
    pub(crate) fn build(&self) -> sqlx::query::Query<'_, Postgres, PgArguments> {
        let mut query = sqlx::query(&self.sql);
        for arg in &self.args {
            query = match arg {
                SqlValue::I64(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
                SqlValue::Bytes(v) => query.bind(v.clone()),
                SqlValue::Json(v) => query.bind(v.clone()),
                SqlValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }
}

/// Renders the VALUES groups of a multi-row INSERT.
///
/// Each group numbers `fields` placeholders and appends `trailer` as the last
/// column, e.g. `($1,$2,$3,pg_current_xact_id()::text::bigint),($4,...)`.
/// One statement per publish call keeps multi-message publishing atomic and
/// ordered.
pub(crate) fn insert_markers(rows: usize, fields: usize, trailer: &str) -> String {
    let mut out = String::new();
    for row in 0..rows {
        if row > 0 {
            out.push(',');
        }
        out.push('(');
        for field in 0..fields {
            if field > 0 {
                out.push(',');
            }
            out.push('$');
            out.push_str(&(row * fields + field + 1).to_string());
        }
        if !trailer.is_empty() {
            out.push(',');
            out.push_str(trailer);
        }
        out.push(')');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_markers_rendering() {
        let cases = [
            (0, ""),
            (1, "($1,$2,$3,pg_current_xact_id()::text::bigint)"),
            (
                2,
                "($1,$2,$3,pg_current_xact_id()::text::bigint),\
                 ($4,$5,$6,pg_current_xact_id()::text::bigint)",
            ),
            (
                5,
                "($1,$2,$3,pg_current_xact_id()::text::bigint),\
                 ($4,$5,$6,pg_current_xact_id()::text::bigint),\
                 ($7,$8,$9,pg_current_xact_id()::text::bigint),\
                 ($10,$11,$12,pg_current_xact_id()::text::bigint),\
                 ($13,$14,$15,pg_current_xact_id()::text::bigint)",
            ),
        ];

        for (count, expected) in cases {
            let expected: String = expected.split_whitespace().collect();
            assert_eq!(insert_markers(count, 3, CURRENT_TX_ID), expected, "{count}");
        }
    }

    #[test]
    fn insert_markers_without_trailer() {
        assert_eq!(insert_markers(2, 2, ""), "($1,$2),($3,$4)");
    }
}
