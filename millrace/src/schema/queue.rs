use super::{PayloadTypeFn, SchemaAdapter, TableNameFn, DEFAULT_SUBSCRIBE_BATCH_SIZE};
use crate::{
    error::Error,
    message::Message,
    offsets::OffsetsAdapter,
    query::{insert_markers, Query, SqlValue, CURRENT_TX_ID, SNAPSHOT_XMIN},
};

/// Queue mode: one table per topic, destructive reads, no consumer groups.
///
/// Instead of locking an offset record, the polling SELECT locks the message
/// rows themselves with `FOR UPDATE SKIP LOCKED`, so concurrent subscriber
/// processes claim disjoint rows without blocking each other. Pairs with
/// [PostgresQueueOffsetsAdapter](crate::offsets::PostgresQueueOffsetsAdapter),
/// whose consumed query deletes the row on acknowledgement.
#[derive(Clone, Default)]
pub struct PostgresQueueSchema {
    /// Overrides how the topic maps to the messages table name. Must match
    /// the generator on the paired queue offsets adapter.
    pub generate_messages_table_name: Option<TableNameFn>,
    /// Overrides the payload column type (`BYTEA` by default).
    pub generate_payload_type: Option<PayloadTypeFn>,
    /// Rows per poll tick; 0 means [DEFAULT_SUBSCRIBE_BATCH_SIZE].
    pub subscribe_batch_size: usize,
}

impl PostgresQueueSchema {
    fn messages_table(&self, topic: &str) -> String {
        match &self.generate_messages_table_name {
            Some(generate) => generate(topic),
            None => format!(r#""millrace_{topic}""#),
        }
    }

    fn payload_type(&self, topic: &str) -> String {
        match &self.generate_payload_type {
            Some(generate) => generate(topic),
            None => "BYTEA".to_string(),
        }
    }
}

impl SchemaAdapter for PostgresQueueSchema {
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query> {
        vec![Query::new(format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
	"offset" BIGSERIAL,
	uuid TEXT NOT NULL,
	created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
	payload {} DEFAULT NULL,
	metadata JSONB DEFAULT NULL,
	transaction_id BIGINT NOT NULL,
	PRIMARY KEY ("offset")
)"#,
            self.messages_table(topic),
            self.payload_type(topic),
        ))]
    }

    fn insert_query(&self, topic: &str, messages: &[Message]) -> Result<Query, Error> {
        let mut args = Vec::with_capacity(messages.len() * 3);
        for message in messages {
            args.push(SqlValue::Text(message.uuid.clone()));
            args.push(SqlValue::Bytes(message.payload.to_vec()));
            args.push(SqlValue::Json(message.metadata_json()));
        }

        Ok(Query::with_args(
            format!(
                "INSERT INTO {} (uuid, payload, metadata, transaction_id) VALUES {}",
                self.messages_table(topic),
                insert_markers(messages.len(), 3, CURRENT_TX_ID),
            ),
            args,
        ))
    }

    fn select_query(
        &self,
        topic: &str,
        _consumer_group: &str,
        _offsets: &dyn OffsetsAdapter,
    ) -> Result<Query, Error> {
        Ok(Query::new(format!(
            r#"SELECT "offset", transaction_id, uuid, payload, metadata FROM {table}
WHERE transaction_id < {xmin}
ORDER BY "offset"
LIMIT {limit}
FOR UPDATE SKIP LOCKED"#,
            table = self.messages_table(topic),
            xmin = SNAPSHOT_XMIN,
            limit = self.subscribe_batch_size(),
        )))
    }

    fn subscribe_batch_size(&self) -> usize {
        if self.subscribe_batch_size == 0 {
            DEFAULT_SUBSCRIBE_BATCH_SIZE
        } else {
            self.subscribe_batch_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::PostgresQueueOffsetsAdapter;

    #[test]
    fn select_claims_rows_with_skip_locked() {
        let schema = PostgresQueueSchema {
            subscribe_batch_size: 10,
            ..Default::default()
        };
        let offsets = PostgresQueueOffsetsAdapter::default();
        let query = schema.select_query("jobs", "", &offsets).unwrap();

        assert!(query.sql.contains(r#"FROM "millrace_jobs""#));
        assert!(query.sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(query.sql.contains("LIMIT 10"));
        assert!(query.args.is_empty());
    }

    #[test]
    fn insert_matches_default_schema_columns() {
        let schema = PostgresQueueSchema::default();
        let query = schema
            .insert_query("jobs", &[Message::new("uuid-0", "payload")])
            .unwrap();
        assert!(query
            .sql
            .contains("(uuid, payload, metadata, transaction_id)"));
        assert_eq!(query.args.len(), 3);
    }
}
