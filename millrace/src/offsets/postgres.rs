use super::OffsetsAdapter;
use crate::{
    query::{Query, SqlValue},
    schema::{Row, TableNameFn},
};

/// Offsets stored in one table per topic, keyed by consumer group.
///
/// The default companion of [PostgresSchema](crate::schema::PostgresSchema):
/// at-least-once delivery with guaranteed per-consumer-group order.
#[derive(Clone, Default)]
pub struct PostgresOffsetsAdapter {
    /// Overrides how the per-topic offsets table name is generated.
    pub generate_offsets_table_name: Option<TableNameFn>,
}

impl PostgresOffsetsAdapter {
    fn offsets_table(&self, topic: &str) -> String {
        match &self.generate_offsets_table_name {
            Some(generate) => generate(topic),
            None => format!(r#""millrace_offsets_{topic}""#),
        }
    }
}

impl OffsetsAdapter for PostgresOffsetsAdapter {
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query> {
        vec![Query::new(format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
	consumer_group VARCHAR(255) NOT NULL,
	offset_acked BIGINT,
	last_processed_transaction_id BIGINT NOT NULL,
	PRIMARY KEY(consumer_group)
)"#,
            self.offsets_table(topic),
        ))]
    }

    fn before_subscribing_queries(&self, topic: &str, consumer_group: &str) -> Vec<Query> {
        // The zero offset record exists so the FOR UPDATE in
        // next_offset_query has a row to lock before any messages do.
        vec![Query::with_args(
            format!(
                "INSERT INTO {} (consumer_group, offset_acked, last_processed_transaction_id) \
                 VALUES ($1, 0, 0) ON CONFLICT DO NOTHING",
                self.offsets_table(topic),
            ),
            vec![SqlValue::Text(consumer_group.to_string())],
        )]
    }

    fn next_offset_query(&self, topic: &str, consumer_group: &str) -> Option<Query> {
        Some(Query::with_args(
            format!(
                "SELECT offset_acked, last_processed_transaction_id FROM {} \
                 WHERE consumer_group=$1 FOR UPDATE",
                self.offsets_table(topic),
            ),
            vec![SqlValue::Text(consumer_group.to_string())],
        ))
    }

    fn ack_message_query(&self, topic: &str, consumer_group: &str, row: &Row) -> Option<Query> {
        Some(Query::with_args(
            format!(
                "INSERT INTO {} (offset_acked, last_processed_transaction_id, consumer_group) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (consumer_group) DO UPDATE SET \
                 offset_acked = excluded.offset_acked, \
                 last_processed_transaction_id = excluded.last_processed_transaction_id",
                self.offsets_table(topic),
            ),
            vec![
                SqlValue::I64(row.offset),
                SqlValue::I64(row.transaction_id),
                SqlValue::Text(consumer_group.to_string()),
            ],
        ))
    }

    fn consumed_message_query(
        &self,
        _topic: &str,
        _consumer_group: &str,
        _row: &Row,
    ) -> Option<Query> {
        // Rows stay in place so other consumer groups can replay them; the
        // ack upsert is the complete consumption record.
        None
    }

    fn delete_all_offsets_query(&self, topic: &str) -> Option<Query> {
        Some(Query::new(format!(
            "DELETE FROM {}",
            self.offsets_table(topic)
        )))
    }
}

/// Offsets for every topic in one shared table, keyed by
/// (consumer_group, topic).
///
/// Designed for multiple subscribers in the same group with exactly-once
/// delivery and guaranteed order: the zero offset record plus the FOR UPDATE
/// lock prevent two processes from consuming the same row. Pairs with
/// [SingleTablePostgresSchema](crate::schema::SingleTablePostgresSchema).
#[derive(Clone, Default)]
pub struct SingleTablePostgresOffsetsAdapter {
    /// Overrides the shared offsets table name.
    pub generate_offsets_table_name: Option<TableNameFn>,
}

impl SingleTablePostgresOffsetsAdapter {
    fn offsets_table(&self, topic: &str) -> String {
        match &self.generate_offsets_table_name {
            Some(generate) => generate(topic),
            None => r#""millrace_offsets""#.to_string(),
        }
    }
}

impl OffsetsAdapter for SingleTablePostgresOffsetsAdapter {
    fn schema_initializing_queries(&self, topic: &str) -> Vec<Query> {
        vec![Query::new(format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
	consumer_group VARCHAR(255) NOT NULL,
	offset_acked BIGINT,
	topic TEXT NOT NULL,
	last_processed_transaction_id BIGINT NOT NULL,
	PRIMARY KEY(consumer_group, topic)
)"#,
            self.offsets_table(topic),
        ))]
    }

    fn before_subscribing_queries(&self, topic: &str, consumer_group: &str) -> Vec<Query> {
        vec![Query::with_args(
            format!(
                "INSERT INTO {} (consumer_group, offset_acked, last_processed_transaction_id, topic) \
                 VALUES ($1, 0, 0, $2) ON CONFLICT DO NOTHING",
                self.offsets_table(topic),
            ),
            vec![
                SqlValue::Text(consumer_group.to_string()),
                SqlValue::Text(topic.to_string()),
            ],
        )]
    }

    fn next_offset_query(&self, topic: &str, consumer_group: &str) -> Option<Query> {
        Some(Query::with_args(
            format!(
                "SELECT offset_acked, last_processed_transaction_id FROM {} \
                 WHERE consumer_group=$1 AND topic=$2 FOR UPDATE",
                self.offsets_table(topic),
            ),
            vec![
                SqlValue::Text(consumer_group.to_string()),
                SqlValue::Text(topic.to_string()),
            ],
        ))
    }

    fn ack_message_query(&self, topic: &str, consumer_group: &str, row: &Row) -> Option<Query> {
        Some(Query::with_args(
            format!(
                "INSERT INTO {} (offset_acked, last_processed_transaction_id, consumer_group, topic) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (consumer_group, topic) DO UPDATE SET \
                 offset_acked = excluded.offset_acked, \
                 last_processed_transaction_id = excluded.last_processed_transaction_id",
                self.offsets_table(topic),
            ),
            vec![
                SqlValue::I64(row.offset),
                SqlValue::I64(row.transaction_id),
                SqlValue::Text(consumer_group.to_string()),
                SqlValue::Text(topic.to_string()),
            ],
        ))
    }

    fn consumed_message_query(
        &self,
        _topic: &str,
        _consumer_group: &str,
        _row: &Row,
    ) -> Option<Query> {
        None
    }

    fn delete_all_offsets_query(&self, topic: &str) -> Option<Query> {
        Some(Query::with_args(
            format!("DELETE FROM {} WHERE topic=$1", self.offsets_table(topic)),
            vec![SqlValue::Text(topic.to_string())],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn row() -> Row {
        Row {
            offset: 42,
            transaction_id: 900,
            message: Message::new("uuid", &b""[..]),
        }
    }

    #[test]
    fn per_topic_lock_query_shape() {
        let adapter = PostgresOffsetsAdapter::default();
        let query = adapter.next_offset_query("orders", "group_a").unwrap();
        assert!(query.sql.contains(r#""millrace_offsets_orders""#));
        assert!(query.sql.ends_with("FOR UPDATE"));
        assert_eq!(query.args, vec![SqlValue::Text("group_a".into())]);
    }

    #[test]
    fn per_topic_zero_offset_is_idempotent() {
        let adapter = PostgresOffsetsAdapter::default();
        let queries = adapter.before_subscribing_queries("orders", "group_a");
        assert_eq!(queries.len(), 1);
        assert!(queries[0].sql.contains("VALUES ($1, 0, 0)"));
        assert!(queries[0].sql.contains("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn per_topic_ack_upserts_offset_and_token() {
        let adapter = PostgresOffsetsAdapter::default();
        let query = adapter.ack_message_query("orders", "group_a", &row()).unwrap();
        assert!(query.sql.contains("ON CONFLICT (consumer_group) DO UPDATE"));
        assert_eq!(query.args[0], SqlValue::I64(42));
        assert_eq!(query.args[1], SqlValue::I64(900));
    }

    #[test]
    fn per_topic_consumed_query_is_noop() {
        let adapter = PostgresOffsetsAdapter::default();
        assert!(adapter.consumed_message_query("orders", "group_a", &row()).is_none());
    }

    #[test]
    fn single_table_is_keyed_by_group_and_topic() {
        let adapter = SingleTablePostgresOffsetsAdapter::default();
        let query = adapter.next_offset_query("orders", "group_a").unwrap();
        assert!(query.sql.contains(r#""millrace_offsets""#));
        assert!(query.sql.contains("consumer_group=$1 AND topic=$2"));
        assert_eq!(query.args.len(), 2);

        let ack = adapter.ack_message_query("orders", "group_a", &row()).unwrap();
        assert!(ack.sql.contains("ON CONFLICT (consumer_group, topic) DO UPDATE"));
        assert_eq!(ack.args.len(), 4);
    }

    #[test]
    fn custom_table_name_generator() {
        let adapter = PostgresOffsetsAdapter {
            generate_offsets_table_name: Some(std::sync::Arc::new(|topic| {
                format!(r#""test_offsets_{topic}""#)
            })),
        };
        let query = adapter.next_offset_query("orders", "g").unwrap();
        assert!(query.sql.contains(r#""test_offsets_orders""#));
    }
}
