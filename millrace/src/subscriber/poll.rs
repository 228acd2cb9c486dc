use std::{sync::Arc, time::Duration};

use sqlx::{PgPool, Postgres, Transaction};
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::Error,
    offsets::OffsetsAdapter,
    schema::{Row, SchemaAdapter},
    subscriber::message::{Acknowledgment, DeliveredMessage},
};

/// Outcome of one poll tick.
enum Tick {
    /// Nothing to read.
    Idle,
    /// Some rows were delivered; the acknowledged prefix committed.
    Consumed,
    /// The subscription was cancelled mid-batch.
    Interrupted,
}

enum Delivery {
    Acked,
    Nacked,
    TimedOut,
    Cancelled,
}

/// The background polling engine for one (topic, consumer group)
/// subscription.
///
/// Every tick runs the locking SELECT in a fresh transaction and walks the
/// batch in order, holding the offset-record lock until the batch ends. All
/// mutual exclusion between pollers of the same group is the database's row
/// lock; a conflicting tick simply fails and the next tick retries.
pub(crate) struct PollLoop {
    pub(crate) pool: PgPool,
    pub(crate) topic: String,
    /// Empty string for group-less (queue-style) consumption.
    pub(crate) consumer_group: String,
    pub(crate) schema_adapter: Arc<dyn SchemaAdapter>,
    pub(crate) offsets_adapter: Arc<dyn OffsetsAdapter>,
    pub(crate) poll_interval: Duration,
    pub(crate) resend_interval: Duration,
    pub(crate) out: mpsc::Sender<DeliveredMessage>,
    pub(crate) token: CancellationToken,
}

impl PollLoop {
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.out.is_closed() {
                break;
            }

            match self.poll_once().await {
                Ok(Tick::Interrupted) => break,
                Ok(Tick::Idle) | Ok(Tick::Consumed) => {}
                Err(err) => {
                    // Lock contention, deadlocks and connection drops all
                    // land here: abandon the tick and retry on the next one.
                    // This is the designed collision-avoidance path, not an
                    // error the consumer sees.
                    debug!(
                        topic = %self.topic,
                        consumer_group = %self.consumer_group,
                        error = %err,
                        "poll tick abandoned; retrying on next tick",
                    );
                }
            }
        }

        trace!(topic = %self.topic, consumer_group = %self.consumer_group, "poll loop stopped");
    }

    async fn poll_once(&mut self) -> Result<Tick, Error> {
        let query = self.schema_adapter.select_query(
            &self.topic,
            &self.consumer_group,
            self.offsets_adapter.as_ref(),
        )?;

        let mut tx = self.pool.begin().await?;
        let pg_rows = query.build().fetch_all(&mut *tx).await?;
        if pg_rows.is_empty() {
            tx.rollback().await?;
            return Ok(Tick::Idle);
        }

        let mut interrupted = false;
        for pg_row in &pg_rows {
            let row = self.schema_adapter.unmarshal_row(pg_row)?;
            match self.deliver(&mut tx, &row).await? {
                Delivery::Acked => {}
                Delivery::Nacked | Delivery::TimedOut => break,
                Delivery::Cancelled => {
                    interrupted = true;
                    break;
                }
            }
        }

        // The acknowledged prefix commits even when the batch stopped early;
        // unacknowledged rows stay eligible for a later tick.
        tx.commit().await?;

        Ok(if interrupted {
            Tick::Interrupted
        } else {
            Tick::Consumed
        })
    }

    /// Emits one row on the output stream and blocks until the consumer
    /// decides, the resend interval elapses, or the subscription is
    /// cancelled. On ack, the offsets advance and consumed-row cleanup run
    /// inside the lock-holding transaction.
    async fn deliver(
        &mut self,
        tx: &mut Transaction<'static, Postgres>,
        row: &Row,
    ) -> Result<Delivery, Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let delivered = DeliveredMessage::new(row.message.clone(), ack_tx);

        tokio::select! {
            _ = self.token.cancelled() => return Ok(Delivery::Cancelled),
            sent = self.out.send(delivered) => {
                if sent.is_err() {
                    return Ok(Delivery::Cancelled);
                }
            }
        }

        let decision = tokio::select! {
            _ = self.token.cancelled() => return Ok(Delivery::Cancelled),
            decision = tokio::time::timeout(self.resend_interval, ack_rx) => decision,
        };

        match decision {
            Err(_elapsed) => {
                trace!(uuid = %row.message.uuid, "no acknowledgement before resend interval");
                Ok(Delivery::TimedOut)
            }
            // a dropped handle is an implicit nack
            Ok(Err(_dropped)) => Ok(Delivery::Nacked),
            Ok(Ok(Acknowledgment::Nack)) => Ok(Delivery::Nacked),
            Ok(Ok(Acknowledgment::Ack { followup })) => {
                if let Some(followup) = followup {
                    followup(&mut *tx).await?;
                }
                if let Some(query) =
                    self.offsets_adapter
                        .ack_message_query(&self.topic, &self.consumer_group, row)
                {
                    query.build().execute(&mut *tx).await?;
                }
                if let Some(query) =
                    self.offsets_adapter
                        .consumed_message_query(&self.topic, &self.consumer_group, row)
                {
                    query.build().execute(&mut *tx).await?;
                }
                trace!(uuid = %row.message.uuid, offset = row.offset, "message acknowledged");
                Ok(Delivery::Acked)
            }
        }
    }
}
