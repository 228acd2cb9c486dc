//! Writing messages into topic tables.
//!
//! A [Publisher] validates the topic name, lazily initializes the schema
//! once per topic, and runs the schema adapter's single multi-row INSERT,
//! either inside its own transaction or inside one the caller supplies.
//! Publishing never touches offset records.

use std::{collections::HashSet, sync::Arc};

use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{
    error::Error, message::Message, schema::SchemaAdapter, topic::validate_topic,
};

/// Configuration for [Publisher].
#[derive(Clone)]
pub struct PublisherConfig {
    /// Renders the INSERT and the topic's DDL.
    pub schema_adapter: Arc<dyn SchemaAdapter>,
    /// Run the schema adapter's DDL before the first publish on each topic.
    pub auto_initialize_schema: bool,
}

impl PublisherConfig {
    pub fn new(schema_adapter: Arc<dyn SchemaAdapter>) -> Self {
        Self {
            schema_adapter,
            auto_initialize_schema: false,
        }
    }
}

/// Publishes messages to topics backed by database tables.
pub struct Publisher {
    pool: PgPool,
    config: PublisherConfig,
    /// Topics whose DDL already ran through this publisher.
    initialized: Mutex<HashSet<String>>,
}

impl Publisher {
    pub fn new(pool: PgPool, config: PublisherConfig) -> Result<Self, Error> {
        Ok(Self {
            pool,
            config,
            initialized: Mutex::new(HashSet::new()),
        })
    }

    /// Publishes messages in its own transaction.
    ///
    /// All messages land through one INSERT statement, so a multi-message
    /// publish is atomic and preserves the caller-assigned order. Any
    /// statement error aborts the transaction; partial publish of one call
    /// cannot occur.
    pub async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), Error> {
        let topic = validate_topic(topic)?;
        if messages.is_empty() {
            return Ok(());
        }
        self.initialize_schema(topic).await?;

        let query = self.config.schema_adapter.insert_query(topic, &messages)?;
        let mut tx = self.pool.begin().await?;
        query.build().execute(&mut *tx).await?;
        tx.commit().await?;

        trace!(topic, count = messages.len(), "published messages");
        Ok(())
    }

    /// Publishes messages inside a caller-owned transaction, e.g. atomically
    /// alongside unrelated application writes.
    ///
    /// The transaction stays owned by the caller for its whole lifetime: the
    /// publisher never commits or rolls it back, and the messages become
    /// visible to subscribers only once the caller commits.
    pub async fn publish_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        messages: Vec<Message>,
    ) -> Result<(), Error> {
        let topic = validate_topic(topic)?;
        if messages.is_empty() {
            return Ok(());
        }
        self.initialize_schema(topic).await?;

        let query = self.config.schema_adapter.insert_query(topic, &messages)?;
        query.build().execute(&mut **tx).await?;

        trace!(topic, count = messages.len(), "published messages in ambient transaction");
        Ok(())
    }

    /// Runs the schema DDL at most once per topic per publisher instance.
    /// DDL goes through its own pool connection, never a caller transaction.
    async fn initialize_schema(&self, topic: &str) -> Result<(), Error> {
        if !self.config.auto_initialize_schema {
            return Ok(());
        }

        let mut initialized = self.initialized.lock().await;
        if initialized.contains(topic) {
            return Ok(());
        }

        debug!(topic, "initializing schema");
        let mut conn = self.pool.acquire().await?;
        for query in self.config.schema_adapter.schema_initializing_queries(topic) {
            query.build().execute(&mut conn).await?;
        }

        initialized.insert(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PostgresSchema;

    fn lazy_pool() -> PgPool {
        // connect_lazy never touches the network until a statement runs
        PgPool::connect_lazy("postgres://millrace@localhost/millrace").unwrap()
    }

    #[tokio::test]
    async fn invalid_topic_is_rejected_without_touching_the_store() {
        let publisher = Publisher::new(
            lazy_pool(),
            PublisherConfig::new(Arc::new(PostgresSchema::default())),
        )
        .unwrap();

        let result = publisher
            .publish(
                "some_topic; DROP DATABASE `millrace`",
                vec![Message::new("uuid", "payload")],
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidTopicName(_))));
    }

    #[tokio::test]
    async fn empty_publish_is_a_noop() {
        let publisher = Publisher::new(
            lazy_pool(),
            PublisherConfig::new(Arc::new(PostgresSchema::default())),
        )
        .unwrap();

        // no statement runs, so the lazy pool never has to connect
        publisher.publish("orders", Vec::new()).await.unwrap();
    }
}
