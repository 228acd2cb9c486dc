use super::OffsetsAdapter;
use crate::{
    query::{Query, SqlValue},
    schema::{Row, TableNameFn},
};

/// Queue-mode offsets: no offset records at all.
///
/// There are no consumer groups to track, so there is nothing to lock ahead
/// of time: the polling SELECT locks the message rows themselves with
/// `FOR UPDATE SKIP LOCKED`. Consumption is destructive: the consumed query
/// deletes the delivered row, which is what guarantees each row reaches
/// exactly one subscriber process across the fleet.
///
/// The table name generator must match the one on the paired
/// [PostgresQueueSchema](crate::schema::PostgresQueueSchema), since cleanup
/// targets the messages table directly.
#[derive(Clone, Default)]
pub struct PostgresQueueOffsetsAdapter {
    /// Overrides how the topic maps to the messages table name.
    pub generate_messages_table_name: Option<TableNameFn>,
}

impl PostgresQueueOffsetsAdapter {
    fn messages_table(&self, topic: &str) -> String {
        match &self.generate_messages_table_name {
            Some(generate) => generate(topic),
            None => format!(r#""millrace_{topic}""#),
        }
    }
}

impl OffsetsAdapter for PostgresQueueOffsetsAdapter {
    fn schema_initializing_queries(&self, _topic: &str) -> Vec<Query> {
        Vec::new()
    }

    fn before_subscribing_queries(&self, _topic: &str, _consumer_group: &str) -> Vec<Query> {
        Vec::new()
    }

    fn next_offset_query(&self, _topic: &str, _consumer_group: &str) -> Option<Query> {
        None
    }

    fn ack_message_query(&self, _topic: &str, _consumer_group: &str, _row: &Row) -> Option<Query> {
        None
    }

    fn consumed_message_query(
        &self,
        topic: &str,
        _consumer_group: &str,
        row: &Row,
    ) -> Option<Query> {
        Some(Query::with_args(
            format!(
                r#"DELETE FROM {} WHERE "offset" = $1"#,
                self.messages_table(topic)
            ),
            vec![SqlValue::I64(row.offset)],
        ))
    }

    fn delete_all_offsets_query(&self, _topic: &str) -> Option<Query> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn consumed_row_is_deleted() {
        let adapter = PostgresQueueOffsetsAdapter::default();
        let row = Row {
            offset: 7,
            transaction_id: 1,
            message: Message::new("uuid", &b""[..]),
        };
        let query = adapter.consumed_message_query("jobs", "", &row).unwrap();
        assert_eq!(
            query.sql,
            r#"DELETE FROM "millrace_jobs" WHERE "offset" = $1"#
        );
        assert_eq!(query.args, vec![SqlValue::I64(7)]);
    }

    #[test]
    fn no_offset_records() {
        let adapter = PostgresQueueOffsetsAdapter::default();
        assert!(adapter.next_offset_query("jobs", "").is_none());
        assert!(adapter.before_subscribing_queries("jobs", "").is_empty());
        let row = Row {
            offset: 1,
            transaction_id: 1,
            message: Message::new("uuid", &b""[..]),
        };
        assert!(adapter.ack_message_query("jobs", "", &row).is_none());
    }
}
