//! Polling subscriptions over topic tables.
//!
//! A [Subscriber] spawns one background [poll loop](poll) per subscription.
//! Each loop runs the offset-locking protocol: lock the consumer group's
//! offset record, read the next batch in transaction-commit order, deliver
//! each row and wait for the consumer's decision, advance the offset inside
//! the same transaction. Delivery is at-least-once; with the single-table
//! layout and shared offsets it is exactly-once with guaranteed order.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use millrace::{Message, Publisher, PublisherConfig, Subscriber, SubscriberConfig};
//! # use millrace::schema::PostgresSchema;
//! # use millrace::offsets::PostgresOffsetsAdapter;
//! # async fn example(pool: sqlx::PgPool) -> Result<(), millrace::Error> {
//! let schema = Arc::new(PostgresSchema::default());
//! let offsets = Arc::new(PostgresOffsetsAdapter::default());
//!
//! let publisher = Publisher::new(pool.clone(), PublisherConfig {
//!     schema_adapter: schema.clone(),
//!     auto_initialize_schema: true,
//! })?;
//!
//! let subscriber = Subscriber::new(pool, SubscriberConfig {
//!     consumer_group: Some("billing".to_string()),
//!     ..SubscriberConfig::new(schema, offsets)
//! })?;
//!
//! let mut subscription = subscriber.subscribe("orders").await?;
//! publisher.publish("orders", vec![Message::new("uuid-1", "paid")]).await?;
//!
//! while let Some(mut msg) = subscription.recv().await {
//!     println!("got {}", msg.uuid);
//!     msg.ack();
//! }
//! # Ok(())
//! # }
//! ```

mod message;
mod poll;

pub use message::{DeliveredMessage, TxFollowup};

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::Error, offsets::OffsetsAdapter, query::Query, schema::SchemaAdapter,
    topic::validate_topic,
};

/// Configuration for [Subscriber].
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Consumer group name. `None` means the single implicit group, which is
    /// how queue-mode schemas are consumed.
    pub consumer_group: Option<String>,
    /// Time between poll ticks.
    pub poll_interval: Duration,
    /// How long a delivered message may stay unacknowledged before the tick
    /// gives up and leaves it for redelivery.
    pub resend_interval: Duration,
    /// Renders the polling SELECT and the topic's DDL.
    pub schema_adapter: Arc<dyn SchemaAdapter>,
    /// Renders offset tracking, locking and acknowledgement statements.
    pub offsets_adapter: Arc<dyn OffsetsAdapter>,
    /// Run DDL at subscribe time.
    pub initialize_schema: bool,
}

impl SubscriberConfig {
    pub fn new(
        schema_adapter: Arc<dyn SchemaAdapter>,
        offsets_adapter: Arc<dyn OffsetsAdapter>,
    ) -> Self {
        Self {
            consumer_group: None,
            poll_interval: Duration::from_secs(1),
            resend_interval: Duration::from_secs(1),
            schema_adapter,
            offsets_adapter,
            initialize_schema: false,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be non-zero"));
        }
        if self.resend_interval.is_zero() {
            return Err(Error::Config("resend_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Creates background polling subscriptions on topics.
pub struct Subscriber {
    pool: PgPool,
    config: SubscriberConfig,
    close_token: CancellationToken,
}

impl Subscriber {
    pub fn new(pool: PgPool, config: SubscriberConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            pool,
            config,
            close_token: CancellationToken::new(),
        })
    }

    /// Creates the topic's schema and the zero-valued offset record without
    /// starting a poll loop. Useful to set up a topic before the first
    /// publish.
    pub async fn subscribe_initialize(&self, topic: &str) -> Result<(), Error> {
        let topic = validate_topic(topic)?;
        self.initialize_schema(topic).await?;
        self.before_subscribing(topic).await
    }

    /// Starts polling the topic and returns the ordered output stream.
    ///
    /// Always inserts the zero-valued offset record first: the poll loop's
    /// FOR UPDATE needs an existing row to lock, otherwise concurrent
    /// subscribers in the same group could double-consume.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, Error> {
        let topic = validate_topic(topic)?;
        if self.config.initialize_schema {
            self.initialize_schema(topic).await?;
        }
        self.before_subscribing(topic).await?;

        let token = self.close_token.child_token();
        let (out, rx) = mpsc::channel(1);

        let poll_loop = poll::PollLoop {
            pool: self.pool.clone(),
            topic: topic.to_string(),
            consumer_group: self.config.consumer_group.clone().unwrap_or_default(),
            schema_adapter: self.config.schema_adapter.clone(),
            offsets_adapter: self.config.offsets_adapter.clone(),
            poll_interval: self.config.poll_interval,
            resend_interval: self.config.resend_interval,
            out,
            token: token.clone(),
        };
        tokio::spawn(poll_loop.run());

        debug!(
            topic,
            consumer_group = %self.config.consumer_group.as_deref().unwrap_or_default(),
            "subscription started",
        );
        Ok(Subscription { rx, token })
    }

    /// Drops every consumer group's progress on the topic. Messages stay in
    /// place, so the next subscription replays the topic from the start.
    pub async fn delete_all_offsets(&self, topic: &str) -> Result<(), Error> {
        let topic = validate_topic(topic)?;
        match self.config.offsets_adapter.delete_all_offsets_query(topic) {
            Some(query) => self.run_queries(std::slice::from_ref(&query)).await,
            None => Ok(()),
        }
    }

    /// Cancels every subscription created by this subscriber.
    pub fn close(&self) {
        self.close_token.cancel();
    }

    async fn initialize_schema(&self, topic: &str) -> Result<(), Error> {
        let mut queries = self.config.schema_adapter.schema_initializing_queries(topic);
        queries.extend(self.config.offsets_adapter.schema_initializing_queries(topic));
        self.run_queries(&queries).await
    }

    async fn before_subscribing(&self, topic: &str) -> Result<(), Error> {
        let queries = self.config.offsets_adapter.before_subscribing_queries(
            topic,
            self.config.consumer_group.as_deref().unwrap_or_default(),
        );
        self.run_queries(&queries).await
    }

    async fn run_queries(&self, queries: &[Query]) -> Result<(), Error> {
        if queries.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        for query in queries {
            query.build().execute(&mut conn).await?;
        }
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close_token.cancel();
    }
}

/// One active subscription: an ordered stream of [DeliveredMessage]s.
///
/// Dropping the subscription cancels its poll loop; the loop notices both
/// between ticks and while waiting for an acknowledgement, and releases any
/// open transaction before stopping.
pub struct Subscription {
    rx: mpsc::Receiver<DeliveredMessage>,
    token: CancellationToken,
}

impl Subscription {
    /// The next message, in per-consumer-group order. Returns `None` once
    /// the subscription has been cancelled and the loop has drained.
    pub async fn recv(&mut self) -> Option<DeliveredMessage> {
        self.rx.recv().await
    }

    /// Stops the poll loop. In-flight messages can still be drained with
    /// [recv](Self::recv).
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        offsets::PostgresOffsetsAdapter,
        schema::PostgresSchema,
    };

    fn config() -> SubscriberConfig {
        SubscriberConfig::new(
            Arc::new(PostgresSchema::default()),
            Arc::new(PostgresOffsetsAdapter::default()),
        )
    }

    fn lazy_pool() -> PgPool {
        PgPool::connect_lazy("postgres://millrace@localhost/millrace").unwrap()
    }

    #[tokio::test]
    async fn zero_intervals_fail_fast() {
        let mut cfg = config();
        cfg.poll_interval = Duration::ZERO;
        assert!(matches!(
            Subscriber::new(lazy_pool(), cfg),
            Err(Error::Config(_))
        ));

        let mut cfg = config();
        cfg.resend_interval = Duration::ZERO;
        assert!(matches!(
            Subscriber::new(lazy_pool(), cfg),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn invalid_topic_is_rejected_without_touching_the_store() {
        let subscriber = Subscriber::new(lazy_pool(), config()).unwrap();
        let result = subscriber
            .subscribe("some_topic; DROP DATABASE `millrace`")
            .await;
        assert!(matches!(result, Err(Error::InvalidTopicName(_))));
    }
}
