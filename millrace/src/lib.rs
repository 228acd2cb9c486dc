//! # Millrace
//!
//! Millrace is a durable, ordered message queue built on PostgreSQL tables.
//! Messages published to a topic become rows; subscribers poll those rows
//! inside transactions and track their progress through per-group offset
//! records, so a database you already run doubles as a message broker with
//! at-least-once delivery and, in the shared-table configuration, effectively
//! exactly-once processing.
//!
//! ## Getting Started
//!
//! A [Publisher] and a [Subscriber] share nothing but the database. Wire
//! each to a schema adapter (how message rows look) and the subscriber to an
//! offsets adapter (how progress is tracked and locked):
//!
//! ``` no_run
//! use std::sync::Arc;
//! use millrace::{
//!     Message, Publisher, PublisherConfig, Subscriber, SubscriberConfig,
//! };
//! use millrace::offsets::PostgresOffsetsAdapter;
//! use millrace::schema::PostgresSchema;
//!
//! # async fn example() -> Result<(), millrace::Error> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/app").await?;
//!
//! let publisher = Publisher::new(pool.clone(), PublisherConfig {
//!     schema_adapter: Arc::new(PostgresSchema::default()),
//!     auto_initialize_schema: true,
//! })?;
//!
//! let subscriber = Subscriber::new(pool, SubscriberConfig {
//!     consumer_group: Some("billing".to_string()),
//!     initialize_schema: true,
//!     ..SubscriberConfig::new(
//!         Arc::new(PostgresSchema::default()),
//!         Arc::new(PostgresOffsetsAdapter::default()),
//!     )
//! })?;
//!
//! let mut subscription = subscriber.subscribe("orders").await?;
//!
//! publisher
//!     .publish("orders", vec![Message::new("uuid-1", "payload")])
//!     .await?;
//!
//! while let Some(mut delivered) = subscription.recv().await {
//!     println!("received {}", delivered.uuid);
//!     delivered.ack();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every subscription in the same consumer group contends for one row-level
//! lock per poll, so messages of a topic are processed in order, one
//! subscriber at a time per group. Different groups consume independently.
//!
//! ## Schema flavors
//!
//! - [schema::PostgresSchema] with [offsets::PostgresOffsetsAdapter]: a
//!   table per topic, at-least-once delivery.
//! - [schema::SingleTablePostgresSchema] with
//!   [offsets::SingleTablePostgresOffsetsAdapter]: one shared table,
//!   acknowledgements recorded in the delivering transaction for
//!   exactly-once processing.
//! - [schema::PostgresQueueSchema] with
//!   [offsets::PostgresQueueOffsetsAdapter]: no offsets at all; rows are
//!   claimed with `FOR UPDATE SKIP LOCKED` and deleted on acknowledgement,
//!   trading ordering for parallel consumption.
//!
//! Retries with backoff live in [requeue].

pub mod delay;
mod error;
mod message;
pub mod offsets;
mod publisher;
mod query;
pub mod requeue;
pub mod schema;
pub mod subscriber;
mod topic;

pub use error::Error;
pub use message::Message;
pub use publisher::{Publisher, PublisherConfig};
pub use query::{Query, SqlValue};
pub use subscriber::{
    DeliveredMessage, Subscriber, SubscriberConfig, Subscription, TxFollowup,
};
pub use topic::validate_topic;
