//! # Delayed requeueing with backoff
//!
//! The [DelayedRequeuer] composes a publisher/subscriber pair over a
//! reserved requeue table to build retry-with-backoff out of the same
//! offset-and-locking primitives the rest of the crate uses. Two intake
//! paths feed it:
//!
//! - [poison](DelayedRequeuer::poison): a message that repeatedly fails
//!   processing is parked in the requeue table and republished to its origin
//!   topic on the next tick;
//! - [enqueue](DelayedRequeuer::enqueue): a handler failure schedules the
//!   message for a later retry, with the delay computed from a capped
//!   exponential [Backoff](crate::delay::Backoff) and the message's retry
//!   counter.
//!
//! The scheduler is nothing but timestamps and polling: ready rows (ready-at
//! time <= now) surface through the delayed schema's SELECT, get republished
//! to the topic recorded in their metadata, and are deleted on
//! acknowledgement.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use millrace::{Message, Publisher, PublisherConfig};
//! # use millrace::requeue::{DelayedRequeuer, DelayedRequeuerConfig};
//! # use millrace::schema::PostgresSchema;
//! # use tokio_util::sync::CancellationToken;
//! # async fn example(pool: sqlx::PgPool) -> Result<(), millrace::Error> {
//! let publisher = Arc::new(Publisher::new(pool.clone(), PublisherConfig {
//!     schema_adapter: Arc::new(PostgresSchema::default()),
//!     auto_initialize_schema: true,
//! })?);
//!
//! let requeuer = DelayedRequeuer::new(pool, DelayedRequeuerConfig {
//!     publisher: Some(publisher),
//!     ..Default::default()
//! })?;
//!
//! // a handler failed; retry the message later
//! requeuer.enqueue("orders", Message::new("uuid-1", "payload")).await?;
//!
//! let token = CancellationToken::new();
//! requeuer.run(token).await?;
//! # Ok(())
//! # }
//! ```

mod requeuer;

pub use requeuer::{origin_topic_from_metadata, GeneratePublishTopicFn, Requeuer, RequeuerConfig};

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::{
    delay::{self, Backoff, ORIGIN_TOPIC_KEY},
    error::Error,
    message::Message,
    offsets::PostgresQueueOffsetsAdapter,
    publisher::{Publisher, PublisherConfig},
    schema::DelayedPostgresSchema,
    subscriber::{Subscriber, SubscriberConfig},
    topic::validate_topic,
};

/// Topic used for requeued messages unless overridden.
pub const DEFAULT_REQUEUE_TOPIC: &str = "requeue";

/// Configuration for [DelayedRequeuer].
#[derive(Default)]
pub struct DelayedRequeuerConfig {
    /// Destination publisher for messages whose delay has elapsed.
    /// Required.
    pub publisher: Option<Arc<Publisher>>,
    /// Topic (and delay-table partition) for requeued messages. Empty means
    /// [DEFAULT_REQUEUE_TOPIC].
    pub requeue_topic: String,
    /// Retry delay policy for [enqueue](DelayedRequeuer::enqueue).
    pub backoff: Backoff,
    /// Overrides how the publish topic is derived from a ready message.
    /// Defaults to reading the origin topic from metadata.
    pub generate_publish_topic: Option<GeneratePublishTopicFn>,
}

impl DelayedRequeuerConfig {
    fn requeue_topic(&self) -> &str {
        if self.requeue_topic.is_empty() {
            DEFAULT_REQUEUE_TOPIC
        } else {
            &self.requeue_topic
        }
    }
}

/// Scheduled republishing over a reserved delay table.
pub struct DelayedRequeuer {
    delayed_publisher: Publisher,
    requeuer: Requeuer,
    requeue_topic: String,
    backoff: Backoff,
}

impl DelayedRequeuer {
    /// Fails fast on a missing publisher or an invalid requeue topic.
    pub fn new(pool: PgPool, config: DelayedRequeuerConfig) -> Result<Self, Error> {
        let publisher = config
            .publisher
            .clone()
            .ok_or(Error::Config("missing publisher"))?;
        let requeue_topic = validate_topic(config.requeue_topic())?.to_string();

        let schema = Arc::new(DelayedPostgresSchema::default());
        let delay_table = schema.messages_table(&requeue_topic);
        let offsets = Arc::new(PostgresQueueOffsetsAdapter {
            generate_messages_table_name: Some(Arc::new(move |_topic| delay_table.clone())),
        });

        let delayed_publisher = Publisher::new(
            pool.clone(),
            PublisherConfig {
                schema_adapter: schema.clone(),
                auto_initialize_schema: true,
            },
        )?;

        let subscriber = Subscriber::new(
            pool,
            SubscriberConfig {
                initialize_schema: true,
                ..SubscriberConfig::new(schema, offsets)
            },
        )?;

        let requeuer = Requeuer::new(RequeuerConfig {
            subscriber,
            subscribe_topic: requeue_topic.clone(),
            publisher,
            generate_publish_topic: config.generate_publish_topic,
        })?;

        Ok(Self {
            delayed_publisher,
            requeuer,
            requeue_topic,
            backoff: config.backoff,
        })
    }

    /// Parks a poison message for immediate requeue to its origin topic on
    /// the next requeuer tick.
    pub async fn poison(&self, origin_topic: &str, mut message: Message) -> Result<(), Error> {
        let origin_topic = validate_topic(origin_topic)?;
        message.set_metadata(ORIGIN_TOPIC_KEY, origin_topic);
        delay::delay_message(&mut message, Utc::now(), std::time::Duration::ZERO);
        self.delayed_publisher
            .publish(&self.requeue_topic, vec![message])
            .await
    }

    /// Schedules a retry: computes the ready-at time from the backoff policy
    /// and the message's retry counter, bumps the counter, and parks the
    /// message in the requeue table.
    pub async fn enqueue(&self, origin_topic: &str, mut message: Message) -> Result<(), Error> {
        let origin_topic = validate_topic(origin_topic)?;
        message.set_metadata(ORIGIN_TOPIC_KEY, origin_topic);
        self.backoff.apply(&mut message, Utc::now());
        self.delayed_publisher
            .publish(&self.requeue_topic, vec![message])
            .await
    }

    /// Drives the requeue loop until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        self.requeuer.run(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PostgresSchema;

    fn lazy_pool() -> PgPool {
        PgPool::connect_lazy("postgres://millrace@localhost/millrace").unwrap()
    }

    fn publisher() -> Arc<Publisher> {
        Arc::new(
            Publisher::new(
                lazy_pool(),
                PublisherConfig::new(Arc::new(PostgresSchema::default())),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_publisher_fails_fast() {
        let result = DelayedRequeuer::new(lazy_pool(), DelayedRequeuerConfig::default());
        assert!(matches!(result, Err(Error::Config("missing publisher"))));
    }

    #[tokio::test]
    async fn rejects_invalid_requeue_topic() {
        let config = DelayedRequeuerConfig {
            publisher: Some(publisher()),
            requeue_topic: "requeue; DROP TABLE x".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            DelayedRequeuer::new(lazy_pool(), config),
            Err(Error::InvalidTopicName(_))
        ));
    }

    #[tokio::test]
    async fn empty_topic_falls_back_to_default() {
        let config = DelayedRequeuerConfig {
            publisher: Some(publisher()),
            requeue_topic: String::new(),
            ..Default::default()
        };
        assert_eq!(config.requeue_topic(), DEFAULT_REQUEUE_TOPIC);
        let requeuer = DelayedRequeuer::new(lazy_pool(), config).unwrap();
        assert_eq!(requeuer.requeue_topic, DEFAULT_REQUEUE_TOPIC);
    }
}
