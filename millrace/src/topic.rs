//! Topic name validation.
//!
//! Topic names end up interpolated into table names, so they are checked
//! against a strict allow-list instead of being escaped. A name that fails
//! validation is rejected before any statement reaches the database.

use crate::error::Error;

/// Returns the topic unchanged if it only contains `[A-Za-z0-9_]`.
pub fn validate_topic(topic: &str) -> Result<&str, Error> {
    if topic.is_empty() {
        return Err(Error::InvalidTopicName(topic.to_string()));
    }
    if topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(topic)
    } else {
        Err(Error::InvalidTopicName(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for topic in ["orders", "orders_v2", "Topic01", "_internal"] {
            assert!(validate_topic(topic).is_ok(), "{topic}");
        }
    }

    #[test]
    fn rejects_statement_breaking_names() {
        let cases = [
            "",
            "some_topic; DROP DATABASE `millrace`",
            "orders;--",
            "orders`",
            "orders'",
            "orders\"",
            "orders table",
            "orders-v2",
            "topic.name",
        ];
        for topic in cases {
            match validate_topic(topic) {
                Err(Error::InvalidTopicName(name)) => assert_eq!(name, topic),
                other => panic!("expected InvalidTopicName for {topic:?}, got {other:?}"),
            }
        }
    }
}
