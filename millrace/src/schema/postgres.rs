use super::{
    PayloadTypeFn, SchemaAdapter, TableNameFn, DEFAULT_SUBSCRIBE_BATCH_SIZE,
};
use crate::{
    error::Error,
    message::Message,
    offsets::OffsetsAdapter,
    query::{insert_markers, Query, SqlValue, CURRENT_TX_ID, SNAPSHOT_XMIN},
};

fn message_args(messages: &[Message]) -> Vec<SqlValue> {
    let mut args = Vec::with_capacity(messages.len() * 3);
    for message in messages {
        args.push(SqlValue::Text(message.uuid.clone()));
        args.push(SqlValue::Bytes(message.payload.to_vec()));
        args.push(SqlValue::Json(message.metadata_json()));
    }
    args
}

/// The default schema: one messages table per topic, rows retained after
/// consumption so independent consumer groups can replay the topic.
#[derive(Clone, Default)]
pub struct PostgresSchema {
    /// Overrides how the topic maps to the messages table name.
    pub generate_messages_table_name: Option<TableNameFn>,
    /// Overrides the payload column type (`BYTEA` by default).
    pub generate_payload_type: Option<PayloadTypeFn>,
    /// Rows per poll tick; 0 means [DEFAULT_SUBSCRIBE_BATCH_SIZE].
    pub subscribe_batch_size: usize,
}

impl PostgresSchema {
    pub(crate) fn messages_table(&self, topic: &str) -> String {
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

impl SchemaAdapter for PostgresSchema {
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query> {
        vec![
            Query::new(format!(
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
            )),
            Query::new(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (transaction_id)",
                super::index_name(&self.messages_table(topic), "tx_id_idx"),
                self.messages_table(topic),
            )),
        ]
    }

    fn insert_query(&self, topic: &str, messages: &[Message]) -> Result<Query, Error> {
        Ok(Query::with_args(
            format!(
                "INSERT INTO {} (uuid, payload, metadata, transaction_id) VALUES {}",
                self.messages_table(topic),
                insert_markers(messages.len(), 3, CURRENT_TX_ID),
            ),
            message_args(messages),
        ))
    }

    fn select_query(
        &self,
        topic: &str,
        consumer_group: &str,
        offsets: &dyn OffsetsAdapter,
    ) -> Result<Query, Error> {
        let lock = offsets
            .next_offset_query(topic, consumer_group)
            .ok_or(Error::Config(
                "offsets adapter provides no row-locking offset query",
            ))?;

        // The CTE takes the group's offset-record lock; the xmin bound keeps
        // rows from still-open earlier transactions invisible until they
        // resolve, so commit order can never produce a gap.
        let sql = format!(
            r#"WITH last_processed AS (
	{lock}
)
SELECT "offset", transaction_id, uuid, payload, metadata FROM {table}
WHERE
(
	(
		transaction_id = (SELECT last_processed_transaction_id FROM last_processed)
		AND "offset" > (SELECT offset_acked FROM last_processed)
	)
	OR
	(transaction_id > (SELECT last_processed_transaction_id FROM last_processed))
)
AND transaction_id < {xmin}
ORDER BY transaction_id, "offset"
LIMIT {limit}"#,
            lock = lock.sql,
            table = self.messages_table(topic),
            xmin = SNAPSHOT_XMIN,
            limit = self.subscribe_batch_size(),
        );

        Ok(Query::with_args(sql, lock.args))
    }

    fn subscribe_batch_size(&self) -> usize {
        if self.subscribe_batch_size == 0 {
            DEFAULT_SUBSCRIBE_BATCH_SIZE
        } else {
            self.subscribe_batch_size
        }
    }
}

/// All topics in one shared messages table with a `topic` column.
///
/// Paired with
/// [SingleTablePostgresOffsetsAdapter](crate::offsets::SingleTablePostgresOffsetsAdapter)
/// this layout supports exactly-once delivery with guaranteed order across
/// concurrent subscribers in one consumer group.
#[derive(Clone, Default)]
pub struct SingleTablePostgresSchema {
    /// Overrides the shared messages table name.
    pub generate_messages_table_name: Option<TableNameFn>,
    /// Overrides the payload column type (`BYTEA` by default).
    pub generate_payload_type: Option<PayloadTypeFn>,
    /// Rows per poll tick; 0 means [DEFAULT_SUBSCRIBE_BATCH_SIZE].
    pub subscribe_batch_size: usize,
}

impl SingleTablePostgresSchema {
    fn messages_table(&self, topic: &str) -> String {
        match &self.generate_messages_table_name {
            Some(generate) => generate(topic),
            None => r#""millrace_messages""#.to_string(),
        }
    }

    fn payload_type(&self, topic: &str) -> String {
        match &self.generate_payload_type {
            Some(generate) => generate(topic),
            None => "BYTEA".to_string(),
        }
    }
}

impl SchemaAdapter for SingleTablePostgresSchema {
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
	PRIMARY KEY ("offset")
)"#,
                self.messages_table(topic),
                self.payload_type(topic),
            )),
            Query::new(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (topic, transaction_id)",
                super::index_name(&self.messages_table(topic), "topic_tx_id_idx"),
                self.messages_table(topic),
            )),
        ]
    }

    fn insert_query(&self, topic: &str, messages: &[Message]) -> Result<Query, Error> {
        let mut args = Vec::with_capacity(messages.len() * 4);
        for message in messages {
            args.push(SqlValue::Text(message.uuid.clone()));
            args.push(SqlValue::Bytes(message.payload.to_vec()));
            args.push(SqlValue::Json(message.metadata_json()));
            args.push(SqlValue::Text(topic.to_string()));
        }

        Ok(Query::with_args(
            format!(
                "INSERT INTO {} (uuid, payload, metadata, topic, transaction_id) VALUES {}",
                self.messages_table(topic),
                insert_markers(messages.len(), 4, CURRENT_TX_ID),
            ),
            args,
        ))
    }

    fn select_query(
        &self,
        topic: &str,
        consumer_group: &str,
        offsets: &dyn OffsetsAdapter,
    ) -> Result<Query, Error> {
        let lock = offsets
            .next_offset_query(topic, consumer_group)
            .ok_or(Error::Config(
                "offsets adapter provides no row-locking offset query",
            ))?;

        let topic_marker = lock.args.len() + 1;
        let sql = format!(
            r#"WITH last_processed AS (
	{lock}
)
SELECT "offset", transaction_id, uuid, payload, metadata FROM {table}
WHERE topic = ${topic_marker}
AND
(
	(
		transaction_id = (SELECT last_processed_transaction_id FROM last_processed)
		AND "offset" > (SELECT offset_acked FROM last_processed)
	)
	OR
	(transaction_id > (SELECT last_processed_transaction_id FROM last_processed))
)
AND transaction_id < {xmin}
ORDER BY transaction_id, "offset"
LIMIT {limit}"#,
            lock = lock.sql,
            table = self.messages_table(topic),
            xmin = SNAPSHOT_XMIN,
            limit = self.subscribe_batch_size(),
        );

        let mut args = lock.args;
        args.push(SqlValue::Text(topic.to_string()));
        Ok(Query::with_args(sql, args))
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
    use crate::offsets::{PostgresOffsetsAdapter, SingleTablePostgresOffsetsAdapter};

    fn messages(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| Message::new(format!("uuid-{i}"), format!("payload-{i}")))
            .collect()
    }

    #[test]
    fn insert_is_one_statement_with_ordered_groups() {
        let schema = PostgresSchema::default();
        let query = schema.insert_query("orders", &messages(3)).unwrap();

        assert!(query.sql.starts_with(
            r#"INSERT INTO "millrace_orders" (uuid, payload, metadata, transaction_id) VALUES "#
        ));
        // one value group per message, transaction token captured per group
        assert_eq!(query.sql.matches("pg_current_xact_id()").count(), 3);
        assert_eq!(query.args.len(), 9);
        assert_eq!(query.args[0], SqlValue::Text("uuid-0".into()));
        assert_eq!(query.args[6], SqlValue::Text("uuid-2".into()));
    }

    #[test]
    fn select_locks_offsets_and_bounds_batch() {
        let schema = PostgresSchema {
            subscribe_batch_size: 5,
            ..Default::default()
        };
        let offsets = PostgresOffsetsAdapter::default();
        let query = schema.select_query("orders", "group_a", &offsets).unwrap();

        assert!(query.sql.contains("FOR UPDATE"));
        assert!(query.sql.contains("LIMIT 5"));
        assert!(query
            .sql
            .contains("transaction_id < pg_snapshot_xmin(pg_current_snapshot())::text::bigint"));
        assert!(query.sql.contains(r#"ORDER BY transaction_id, "offset""#));
        assert_eq!(query.args, vec![SqlValue::Text("group_a".into())]);
    }

    #[test]
    fn select_batch_size_defaults() {
        let schema = PostgresSchema::default();
        let offsets = PostgresOffsetsAdapter::default();
        let query = schema.select_query("orders", "group_a", &offsets).unwrap();
        assert!(query.sql.contains("LIMIT 100"));
    }

    #[test]
    fn single_table_binds_topic_after_lock_args() {
        let schema = SingleTablePostgresSchema::default();
        let offsets = SingleTablePostgresOffsetsAdapter::default();
        let query = schema.select_query("orders", "group_a", &offsets).unwrap();

        // lock args are $1 and $2, topic predicate lands on $3
        assert!(query.sql.contains("WHERE topic = $3"));
        assert_eq!(
            query.args,
            vec![
                SqlValue::Text("group_a".into()),
                SqlValue::Text("orders".into()),
                SqlValue::Text("orders".into()),
            ]
        );
    }

    #[test]
    fn index_name_follows_table_override() {
        let schema = PostgresSchema {
            generate_messages_table_name: Some(std::sync::Arc::new(|topic| {
                format!(r#""archive_{topic}""#)
            })),
            ..Default::default()
        };
        let ddl = schema.schema_initializing_queries("orders");
        assert!(ddl[1].sql.contains(r#""archive_orders_tx_id_idx""#));
        assert!(ddl[1].sql.contains(r#"ON "archive_orders""#));

        // the default table still gets the default index name
        let ddl = PostgresSchema::default().schema_initializing_queries("orders");
        assert!(ddl[1].sql.contains(r#""millrace_orders_tx_id_idx""#));
    }

    #[test]
    fn single_table_index_name_follows_table_override() {
        let schema = SingleTablePostgresSchema {
            generate_messages_table_name: Some(std::sync::Arc::new(|_| {
                r#""events""#.to_string()
            })),
            ..Default::default()
        };
        let ddl = schema.schema_initializing_queries("orders");
        assert!(ddl[1].sql.contains(r#""events_topic_tx_id_idx""#));
        assert!(ddl[1].sql.contains(r#"ON "events""#));
    }

    #[test]
    fn single_table_insert_carries_topic_column() {
        let schema = SingleTablePostgresSchema::default();
        let query = schema.insert_query("orders", &messages(2)).unwrap();

        assert!(query.sql.contains("(uuid, payload, metadata, topic, transaction_id)"));
        assert!(query.sql.contains("($1,$2,$3,$4,pg_current_xact_id()::text::bigint)"));
        assert!(query.sql.contains("($5,$6,$7,$8,pg_current_xact_id()::text::bigint)"));
        assert_eq!(query.args.len(), 8);
        assert_eq!(query.args[3], SqlValue::Text("orders".into()));
    }
}
