//! # Topic-to-table mapping and statement generation
//!
//! A [SchemaAdapter] renders the SQL a publisher and subscriber run: DDL for
//! lazy initialization, the multi-row INSERT for publishing, and the locking
//! SELECT for polling. The adapters are pure renderers; execution happens in
//! the publisher and the subscriber's poll loop.
//!
//! ## Variants
//!
//! - [PostgresSchema]: one table per topic, rows retained after consumption.
//!   Consumer groups replay independently; delivery is at-least-once with
//!   guaranteed per-group order.
//! - [SingleTablePostgresSchema]: one shared table with a `topic` column.
//!   Paired with the shared offsets table it supports exactly-once delivery
//!   with guaranteed order.
//! - [PostgresQueueSchema]: queue mode. No consumer groups; consumed rows are
//!   deleted, so each row is delivered to exactly one subscriber process.
//! - [DelayedPostgresSchema]: the requeue table. Rows become visible once
//!   their ready-at time has passed.

mod delayed;
mod postgres;
mod queue;

pub use delayed::DelayedPostgresSchema;
pub use postgres::{PostgresSchema, SingleTablePostgresSchema};
pub use queue::PostgresQueueSchema;

use std::sync::Arc;

use serde_json::Value;
use sqlx::{postgres::PgRow, Row as _};

use crate::{error::Error, message::Message, offsets::OffsetsAdapter, query::Query};

/// Overrides how a topic maps to a table name. The returned name is
/// interpolated into SQL verbatim, quoting included.
pub type TableNameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Overrides the SQL type of the payload column (`BYTEA` by default).
pub type PayloadTypeFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Derives an index name from the rendered table name, so overridden table
/// names get their own index instead of colliding with the default one under
/// `CREATE INDEX IF NOT EXISTS`.
pub(crate) fn index_name(table: &str, suffix: &str) -> String {
    let base: String = table
        .chars()
        .filter(|c| *c != '"')
        .map(|c| if c == '.' { '_' } else { c })
        .collect();
    format!(r#""{base}_{suffix}""#)
}

/// Default batch bound for the polling SELECT.
///
/// Too-small batches under-utilize the index; too-large batches invite
/// planner misestimation on mostly-consumed tables. Tune per workload via the
/// adapter's `subscribe_batch_size`.
pub const DEFAULT_SUBSCRIBE_BATCH_SIZE: usize = 100;

/// One persisted message, as read back by the poll loop.
#[derive(Debug, Clone)]
pub struct Row {
    /// Store-assigned sequence number, monotonically increasing per topic.
    pub offset: i64,
    /// Transaction-ordering token captured at write time. Reflects commit
    /// order, not statement-issue order.
    pub transaction_id: i64,
    /// The decoded message envelope.
    pub message: Message,
}

/// Renders topic-to-table mapping and the statements for publish and poll.
pub trait SchemaAdapter: Send + Sync {
    /// DDL run lazily before the first publish or subscribe on a topic.
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query>;

    /// A single multi-row INSERT preserving caller-assigned message order.
    /// `messages` is never empty.
    fn insert_query(&self, topic: &str, messages: &[Message]) -> Result<Query, Error>;

    /// The polling SELECT: bounded by the batch size, ordered by the
    /// transaction-ordering token then sequence, and joined against the
    /// offsets adapter's row-locking semantics.
    fn select_query(
        &self,
        topic: &str,
        consumer_group: &str,
        offsets: &dyn OffsetsAdapter,
    ) -> Result<Query, Error>;

    /// Upper bound on rows returned by one poll tick.
    fn subscribe_batch_size(&self) -> usize;

    /// Decodes one row returned by [select_query](Self::select_query).
    fn unmarshal_row(&self, row: &PgRow) -> Result<Row, Error> {
        let offset: i64 = row.try_get("offset")?;
        let transaction_id: i64 = row.try_get("transaction_id")?;
        let uuid: String = row.try_get("uuid")?;
        let payload: Option<Vec<u8>> = row.try_get("payload")?;
        let metadata: Option<Value> = row.try_get("metadata")?;

        Ok(Row {
            offset,
            transaction_id,
            message: Message {
                uuid,
                payload: payload.unwrap_or_default().into(),
                metadata: Message::metadata_from_json(metadata.unwrap_or(Value::Null))?,
            },
        })
    }
}
