use std::ops::Deref;

use futures::future::BoxFuture;
use sqlx::PgConnection;
use tokio::sync::oneshot;

use crate::message::Message;

/// A closure run against the delivering transaction's connection before the
/// offsets advance commits, letting a consumer chain its own writes into the
/// same transaction that delivered the message.
pub type TxFollowup =
    Box<dyn for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send>;

/// Decision sent back to the poll loop.
pub(crate) enum Acknowledgment {
    Ack { followup: Option<TxFollowup> },
    Nack,
}

/// A message handed to a consumer, awaiting its decision.
///
/// Exactly one of [ack](Self::ack), [nack](Self::nack) or
/// [ack_with](Self::ack_with) takes effect; later calls return `false`.
/// Dropping the handle undecided counts as a negative acknowledgement, as
/// does letting the resend interval elapse.
pub struct DeliveredMessage {
    message: Message,
    replier: Option<oneshot::Sender<Acknowledgment>>,
}

impl DeliveredMessage {
    pub(crate) fn new(message: Message, replier: oneshot::Sender<Acknowledgment>) -> Self {
        Self {
            message,
            replier: Some(replier),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Marks the message processed. The poll loop advances the consumer
    /// group's offset and runs any consumed-row cleanup before moving on.
    /// Returns `false` if a decision was already sent or the poller is gone.
    pub fn ack(&mut self) -> bool {
        self.reply(Acknowledgment::Ack { followup: None })
    }

    /// Like [ack](Self::ack), but first runs `followup` inside the
    /// transaction that delivered this message. If the follow-up fails the
    /// whole tick is abandoned and the message is redelivered later.
    pub fn ack_with(&mut self, followup: TxFollowup) -> bool {
        self.reply(Acknowledgment::Ack {
            followup: Some(followup),
        })
    }

    /// Requests redelivery on a later poll tick. Remaining messages of the
    /// current batch are requeued along with this one.
    pub fn nack(&mut self) -> bool {
        self.reply(Acknowledgment::Nack)
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    fn reply(&mut self, decision: Acknowledgment) -> bool {
        match self.replier.take() {
            Some(replier) => replier.send(decision).is_ok(),
            None => false,
        }
    }
}

impl Deref for DeliveredMessage {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl std::fmt::Debug for DeliveredMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveredMessage")
            .field("message", &self.message)
            .field("decided", &self.replier.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_decision_counts() {
        let (tx, mut rx) = oneshot::channel();
        let mut delivered = DeliveredMessage::new(Message::new("uuid", "payload"), tx);

        assert!(delivered.ack());
        assert!(!delivered.nack());
        assert!(matches!(
            rx.try_recv(),
            Ok(Acknowledgment::Ack { followup: None })
        ));
    }

    #[test]
    fn dropping_undecided_reads_as_nack() {
        let (tx, mut rx) = oneshot::channel();
        let delivered = DeliveredMessage::new(Message::new("uuid", "payload"), tx);
        drop(delivered);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ack_after_poller_gone_reports_failure() {
        let (tx, rx) = oneshot::channel();
        let mut delivered = DeliveredMessage::new(Message::new("uuid", "payload"), tx);
        drop(rx);
        assert!(!delivered.ack());
    }
}
