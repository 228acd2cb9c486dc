//! Delay metadata and the retry backoff policy.
//!
//! Delayed delivery is built from timestamps and polling alone: a message
//! carries its ready-at time in metadata, the delayed schema persists it in a
//! dedicated column, and the requeue poll loop only ever sees rows whose
//! ready-at time has passed. No external scheduler is involved.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{error::Error, message::Message};

/// RFC 3339 timestamp before which the message must not be delivered.
pub const DELAYED_UNTIL_KEY: &str = "_millrace_delayed_until";
/// The delay length in seconds, kept for observability.
pub const DELAYED_FOR_KEY: &str = "_millrace_delayed_for";
/// How many times the message has been requeued.
pub const RETRIES_KEY: &str = "_millrace_requeue_retries";
/// The topic the message should be republished to.
pub const ORIGIN_TOPIC_KEY: &str = "_millrace_origin_topic";

/// Stamps the message with a ready-at time of `now + delay`.
pub fn delay_message(message: &mut Message, now: DateTime<Utc>, delay: Duration) {
    let until = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    message.set_metadata(DELAYED_UNTIL_KEY, until.to_rfc3339());
    message.set_metadata(DELAYED_FOR_KEY, format!("{}", delay.as_secs_f64()));
}

/// Reads the ready-at time back out of the metadata.
pub fn delayed_until(message: &Message) -> Result<DateTime<Utc>, Error> {
    let raw = message
        .metadata(DELAYED_UNTIL_KEY)
        .ok_or(Error::MissingMetadata(DELAYED_UNTIL_KEY))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| Error::MalformedMetadata {
            key: DELAYED_UNTIL_KEY,
            value: raw.to_string(),
        })
}

/// How many times the message has been through the requeuer. Absent or
/// unparsable counters read as zero.
pub fn retries(message: &Message) -> u32 {
    message
        .metadata(RETRIES_KEY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Removes the scheduling keys before a message is republished to its origin
/// topic. The retry counter and origin topic survive so a failing handler
/// keeps backing off across cycles.
pub fn strip_schedule(message: &mut Message) {
    message.metadata.remove(DELAYED_UNTIL_KEY);
    message.metadata.remove(DELAYED_FOR_KEY);
}

/// Capped exponential backoff.
///
/// The Nth retry waits `initial * multiplier^N`, capped at `max`. With a
/// multiplier of 1 this degenerates to a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(10),
            multiplier: 1.0,
        }
    }
}

impl Backoff {
    /// The wait before the retry with the given zero-based counter.
    /// Monotone non-decreasing in `retries` for multipliers >= 1.
    pub fn interval(&self, retries: u32) -> Duration {
        let multiplier = self.multiplier.max(1.0);
        let scaled = self.initial.as_secs_f64() * multiplier.powi(retries.min(i32::MAX as u32) as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Stamps the message with the next ready-at time and bumps its retry
    /// counter.
    pub fn apply(&self, message: &mut Message, now: DateTime<Utc>) {
        let attempt = retries(message);
        delay_message(message, now, self.interval(attempt));
        message.set_metadata(RETRIES_KEY, (attempt + 1).to_string());
    }
}
