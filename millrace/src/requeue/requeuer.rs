use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    delay::{self, ORIGIN_TOPIC_KEY},
    error::Error,
    message::Message,
    publisher::Publisher,
    subscriber::{DeliveredMessage, Subscriber},
};

/// Computes the topic a requeued message is republished to.
pub type GeneratePublishTopicFn =
    Arc<dyn Fn(&Message) -> Result<String, Error> + Send + Sync>;

/// The default: read the origin topic the intake step recorded in metadata.
pub fn origin_topic_from_metadata() -> GeneratePublishTopicFn {
    Arc::new(|message| {
        message
            .metadata(ORIGIN_TOPIC_KEY)
            .map(str::to_string)
            .ok_or(Error::MissingMetadata(ORIGIN_TOPIC_KEY))
    })
}

/// Configuration for [Requeuer].
pub struct RequeuerConfig {
    /// Source of ready rows, usually a delayed-schema subscriber.
    pub subscriber: Subscriber,
    /// Topic the subscriber reads from.
    pub subscribe_topic: String,
    /// Destination publisher for republished messages.
    pub publisher: Arc<Publisher>,
    /// Overrides how the publish topic is derived from a message.
    pub generate_publish_topic: Option<GeneratePublishTopicFn>,
}

/// Moves ready rows from the requeue topic back to their origin topics.
///
/// Each received message is republished first and acknowledged second, so a
/// crash between the two can only duplicate a message, never lose one. A
/// failed publish is negatively acknowledged and retried on a later tick.
pub struct Requeuer {
    subscriber: Subscriber,
    subscribe_topic: String,
    publisher: Arc<Publisher>,
    generate_publish_topic: GeneratePublishTopicFn,
}

impl Requeuer {
    pub fn new(config: RequeuerConfig) -> Result<Self, Error> {
        if config.subscribe_topic.is_empty() {
            return Err(Error::Config("subscribe_topic must not be empty"));
        }
        Ok(Self {
            subscriber: config.subscriber,
            subscribe_topic: config.subscribe_topic,
            publisher: config.publisher,
            generate_publish_topic: config
                .generate_publish_topic
                .unwrap_or_else(origin_topic_from_metadata),
        })
    }

    /// Runs the requeue loop until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        let mut subscription = self.subscriber.subscribe(&self.subscribe_topic).await?;

        loop {
            let delivered = tokio::select! {
                _ = token.cancelled() => break,
                delivered = subscription.recv() => delivered,
            };
            let Some(mut delivered) = delivered else {
                break;
            };
            self.requeue(&mut delivered).await;
        }

        subscription.cancel();
        Ok(())
    }

    async fn requeue(&self, delivered: &mut DeliveredMessage) {
        match self.republish(delivered.message()).await {
            Ok(topic) => {
                debug!(uuid = %delivered.uuid, topic = %topic, "message requeued");
                delivered.ack();
            }
            Err(err) => {
                warn!(uuid = %delivered.uuid, error = %err, "requeue failed; message will be retried");
                delivered.nack();
            }
        }
    }

    async fn republish(&self, message: &Message) -> Result<String, Error> {
        let topic = (self.generate_publish_topic)(message)?;
        let mut message = message.clone();
        delay::strip_schedule(&mut message);
        self.publisher.publish(&topic, vec![message]).await?;
        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topic_comes_from_metadata() {
        let generate = origin_topic_from_metadata();

        let tagged = Message::new("uuid", "payload").with_metadata(ORIGIN_TOPIC_KEY, "orders");
        assert_eq!(generate(&tagged).unwrap(), "orders");

        let untagged = Message::new("uuid", "payload");
        assert!(matches!(
            generate(&untagged),
            Err(Error::MissingMetadata(ORIGIN_TOPIC_KEY))
        ));
    }
}
