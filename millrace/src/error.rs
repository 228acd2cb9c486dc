use thiserror::Error;

/// Errors surfaced by publishers, subscribers and the requeuer.
///
/// Lock contention and connection failures inside a poll tick are *not*
/// surfaced here: the tick is abandoned and retried on the next interval.
#[derive(Debug, Error)]
pub enum Error {
    /// The topic name failed allow-list validation. Nothing was sent to the
    /// database.
    #[error("invalid topic name: {0:?}")]
    InvalidTopicName(String),

    /// A required configuration value is missing or out of range. Raised at
    /// construction, never retried.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// A metadata key the operation depends on is absent.
    #[error("missing metadata key {0:?}")]
    MissingMetadata(&'static str),

    /// A metadata value could not be parsed.
    #[error("malformed metadata value for {key:?}: {value:?}")]
    MalformedMetadata { key: &'static str, value: String },

    /// A stored row could not be decoded back into a message.
    #[error("malformed stored message: {0}")]
    Decode(String),

    /// A statement failed against the backing store.
    #[error("database error")]
    Sql(#[from] sqlx::Error),
}
