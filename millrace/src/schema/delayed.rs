use super::{PayloadTypeFn, SchemaAdapter, TableNameFn, DEFAULT_SUBSCRIBE_BATCH_SIZE};
use crate::{
    delay,
    error::Error,
    message::Message,
    offsets::OffsetsAdapter,
    query::{insert_markers, Query, SqlValue, CURRENT_TX_ID, SNAPSHOT_XMIN},
};

/// Table name the delayed requeuer uses unless overridden.
pub(crate) const DEFAULT_DELAY_TABLE: &str = r#""millrace_delay""#;

/// The requeue table: one shared table whose rows carry a ready-at time.
///
/// Inserting requires the ready-at metadata stamped by
/// [delay::delay_message] or [delay::Backoff::apply]; a message without it is
/// rejected before any statement runs. The polling SELECT only returns rows
/// whose ready-at time has passed, claimed with `FOR UPDATE SKIP LOCKED` and
/// deleted on acknowledgement, so a scheduled message is republished by
/// exactly one requeuer process.
#[derive(Clone, Default)]
pub struct DelayedPostgresSchema {
    /// Overrides the delay table name. Must match the generator on the
    /// paired queue offsets adapter.
    pub generate_messages_table_name: Option<TableNameFn>,
    /// Overrides the payload column type (`BYTEA` by default).
    pub generate_payload_type: Option<PayloadTypeFn>,
    /// Rows per poll tick; 0 means [DEFAULT_SUBSCRIBE_BATCH_SIZE].
    pub subscribe_batch_size: usize,
}

impl DelayedPostgresSchema {
    pub(crate) fn messages_table(&self, topic: &str) -> String {
        match &self.generate_messages_table_name {
            Some(generate) => generate(topic),
            None => DEFAULT_DELAY_TABLE.to_string(),
        }
    }

    fn payload_type(&self, topic: &str) -> String {
        match &self.generate_payload_type {
            Some(generate) => generate(topic),
            None => "BYTEA".to_string(),
        }
    }
}

impl SchemaAdapter for DelayedPostgresSchema {
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query> {
        vec![
            Query::new(format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
	"offset" BIGSERIAL,
	uuid TEXT NOT NULL,
	created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
	payload {} DEFAULT NULL,
	metadata JSONB DEFAULT NULL,
	topic TEXT NOT NULL,
	transaction_id BIGINT NOT NULL,
	delayed_until TIMESTAMPTZ NOT NULL,
	PRIMARY KEY ("offset")
)"#,
                self.messages_table(topic),
                self.payload_type(topic),
            )),
            Query::new(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (topic, delayed_until)",
                super::index_name(&self.messages_table(topic), "ready_idx"),
                self.messages_table(topic),
            )),
        ]
    }

    fn insert_query(&self, topic: &str, messages: &[Message]) -> Result<Query, Error> {
        let mut args = Vec::with_capacity(messages.len() * 5);
        for message in messages {
            let ready_at = delay::delayed_until(message)?;
            args.push(SqlValue::Text(message.uuid.clone()));
            args.push(SqlValue::Bytes(message.payload.to_vec()));
            args.push(SqlValue::Json(message.metadata_json()));
            args.push(SqlValue::Text(topic.to_string()));
            args.push(SqlValue::Timestamp(ready_at));
        }

        Ok(Query::with_args(
            format!(
                "INSERT INTO {} (uuid, payload, metadata, topic, delayed_until, transaction_id) VALUES {}",
                self.messages_table(topic),
                insert_markers(messages.len(), 5, CURRENT_TX_ID),
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
        Ok(Query::with_args(
            format!(
                r#"SELECT "offset", transaction_id, uuid, payload, metadata FROM {table}
WHERE topic = $1
AND delayed_until <= now()
AND transaction_id < {xmin}
ORDER BY delayed_until, "offset"
LIMIT {limit}
FOR UPDATE SKIP LOCKED"#,
                table = self.messages_table(topic),
                xmin = SNAPSHOT_XMIN,
                limit = self.subscribe_batch_size(),
            ),
            vec![SqlValue::Text(topic.to_string())],
        ))
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
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::offsets::PostgresQueueOffsetsAdapter;

    #[test]
    fn insert_requires_ready_at_metadata() {
        let schema = DelayedPostgresSchema::default();
        let message = Message::new("uuid-0", "payload");
        assert!(matches!(
            schema.insert_query("requeue", &[message]),
            Err(Error::MissingMetadata(_))
        ));
    }

    #[test]
    fn insert_binds_ready_at_column() {
        let schema = DelayedPostgresSchema::default();
        let mut message = Message::new("uuid-0", "payload");
        delay::delay_message(&mut message, Utc::now(), Duration::from_secs(30));

        let query = schema.insert_query("requeue", &[message]).unwrap();
        assert!(query.sql.contains(r#"INSERT INTO "millrace_delay""#));
        assert!(query
            .sql
            .contains("(uuid, payload, metadata, topic, delayed_until, transaction_id)"));
        assert_eq!(query.args.len(), 5);
        assert!(matches!(query.args[4], SqlValue::Timestamp(_)));
    }

    #[test]
    fn index_name_follows_table_override() {
        let schema = DelayedPostgresSchema {
            generate_messages_table_name: Some(std::sync::Arc::new(|_| {
                r#""retry_parking_lot""#.to_string()
            })),
            ..Default::default()
        };
        let ddl = schema.schema_initializing_queries("requeue");
        assert!(ddl[1].sql.contains(r#""retry_parking_lot_ready_idx""#));
        assert!(ddl[1].sql.contains(r#"ON "retry_parking_lot""#));

        let ddl = DelayedPostgresSchema::default().schema_initializing_queries("requeue");
        assert!(ddl[1].sql.contains(r#""millrace_delay_ready_idx""#));
    }

    #[test]
    fn select_only_sees_ready_rows() {
        let schema = DelayedPostgresSchema::default();
        let offsets = PostgresQueueOffsetsAdapter::default();
        let query = schema.select_query("requeue", "", &offsets).unwrap();

        assert!(query.sql.contains("delayed_until <= now()"));
        assert!(query.sql.contains("FOR UPDATE SKIP LOCKED"));
        assert_eq!(query.args, vec![SqlValue::Text("requeue".into())]);
    }
}
