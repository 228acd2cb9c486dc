//! # Consumer-group progress tracking and locking
//!
//! An [OffsetsAdapter] renders the statements that track how far a consumer
//! group has read a topic and that serialize pollers within a group.
//!
//! The locking protocol is the core correctness mechanism: before reading,
//! a poller acquires an exclusive row lock on its group's offset record
//! (`SELECT ... FOR UPDATE`, embedded in the schema adapter's polling
//! SELECT). Only one poller per (group, topic) can be mid-cycle at a time;
//! a colliding poller gets a store-level conflict, drops its tick and tries
//! again on the next one. There is no application-level lock manager.
//!
//! A zero-valued offset record is inserted before the first poll. Locking an
//! absent row is impossible, so without it two pollers could read the same
//! rows concurrently and break the exactly-once guarantee.

mod postgres;
mod queue;

pub use postgres::{PostgresOffsetsAdapter, SingleTablePostgresOffsetsAdapter};
pub use queue::PostgresQueueOffsetsAdapter;

use crate::{query::Query, schema::Row};

/// Renders statements for offset tracking, locking and acknowledgement.
///
/// Variants return `None` from operations they have no statement for: queue
/// mode has no offset records at all, and replay-capable variants have no
/// consumed-row cleanup.
pub trait OffsetsAdapter: Send + Sync {
    /// DDL for the offsets storage, run with the schema adapter's DDL.
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query>;

    /// Idempotently inserts the zero-valued offset record for the group.
    /// Run at subscribe-initialization time, before the first poll.
    fn before_subscribing_queries(&self, topic: &str, consumer_group: &str) -> Vec<Query>;

    /// Selects and row-locks the group's offset record (`FOR UPDATE`).
    fn next_offset_query(&self, topic: &str, consumer_group: &str) -> Option<Query>;

    /// Upsert advancing the acknowledged offset and transaction token.
    /// Runs in the same transaction as the lock that delivered the row.
    fn ack_message_query(&self, topic: &str, consumer_group: &str, row: &Row) -> Option<Query>;

    /// Variant-specific cleanup of a consumed row, e.g. deletion in queue
    /// mode. Runs in the same transaction as the acknowledgement.
    fn consumed_message_query(&self, topic: &str, consumer_group: &str, row: &Row)
        -> Option<Query>;

    /// Drops all progress for a topic.
    fn delete_all_offsets_query(&self, topic: &str) -> Option<Query>;
}
