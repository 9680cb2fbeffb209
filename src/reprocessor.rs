// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # DLQ Reprocessor
//!
//! Operator-triggered replay of dead-lettered messages. Two modes:
//!
//! - **Bulk**: snapshot the dead-queue depth, consume up to that many
//!   messages and republish each to its original exchange and routing key
//!   with the retry history stripped. A timeout yields a partial-success
//!   report, not an error.
//! - **Targeted**: scan for one message by correlation id (the order id),
//!   republish it on match, return non-matches to the queue. Bounded by a
//!   timeout and by one full pass over the snapshot depth.
//!
//! The scan runs with prefetch = 1 and assumes a single concurrent scanner;
//! competing scanners would cycle requeued non-matches between each other.

use crate::{
    errors::AmqpError,
    event,
    metadata::RetryMetadata,
    topology::{passive_queue_depth, MAIN_EXCHANGE, ORDER_CREATED_KEY},
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions,
    },
    types::FieldTable,
    Channel,
};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of a bulk replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprocessReport {
    /// Messages actually republished and acked.
    pub processed: u32,
    /// Dead-queue depth when the replay started.
    pub expected: u32,
    /// Whether the bounded timeout elapsed before `expected` was reached.
    pub timed_out: bool,
    /// Whether a replay failed mid-drain. The failed message and everything
    /// after it stay on the dead queue for a later run.
    pub replay_failed: bool,
}

/// Outcome of a targeted replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedReport {
    pub found: bool,
}

/// Replays dead-lettered messages back to their origin.
pub struct DlqReprocessor {
    channel: Arc<Channel>,
}

impl DlqReprocessor {
    pub fn new(channel: Arc<Channel>) -> DlqReprocessor {
        DlqReprocessor { channel }
    }

    /// Replays every message present on `queue` at invocation time.
    ///
    /// Messages arriving after the depth snapshot are left alone. On timeout
    /// the report carries how many were processed vs. expected.
    pub async fn reprocess_all(
        &self,
        queue: &str,
        limit: Duration,
    ) -> Result<ReprocessReport, AmqpError> {
        let expected = passive_queue_depth(&self.channel, queue).await?;
        if expected == 0 {
            info!(queue, "no messages to reprocess");
            return Ok(ReprocessReport {
                processed: 0,
                expected: 0,
                timed_out: false,
                replay_failed: false,
            });
        }

        info!(queue, expected, "reprocessing dead-lettered messages");

        let tag = format!("dlq-reprocessor-{}", Uuid::new_v4());
        let mut consumer = self.start_consumer(queue, &tag).await?;

        // Every exit out of the drain loop, including a replay failure,
        // must still cancel the consumer.
        let report = self.drain(queue, &mut consumer, expected, limit).await;
        self.stop_consumer(&tag).await;

        if report.replay_failed {
            warn!(
                queue,
                processed = report.processed,
                expected,
                "replay failure, remaining messages left on the dead queue"
            );
        } else if report.timed_out {
            warn!(
                queue,
                processed = report.processed,
                expected, "timeout before all messages were reprocessed"
            );
        } else {
            info!(queue, processed = report.processed, "reprocessing finished");
        }

        Ok(report)
    }

    async fn drain(
        &self,
        queue: &str,
        consumer: &mut lapin::Consumer,
        expected: u32,
        limit: Duration,
    ) -> ReprocessReport {
        let mut processed = 0u32;
        let mut timed_out = false;
        let mut replay_failed = false;
        let deadline = tokio::time::Instant::now() + limit;

        while processed < expected {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, consumer.next()).await {
                Ok(Some(Ok(delivery))) => {
                    if self.replay(&delivery).await.is_err() {
                        // Already logged and requeued by `replay`; partial
                        // progress is reported instead of spinning on a
                        // broken publish path.
                        replay_failed = true;
                        break;
                    }
                    processed += 1;
                    debug!(queue, processed, expected, "message reprocessed");
                }
                Ok(Some(Err(err))) => {
                    error!(error = err.to_string(), "error receiving dead letter");
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        ReprocessReport {
            processed,
            expected,
            timed_out,
            replay_failed,
        }
    }

    /// Scans `queue` for the message matching `correlation_id` and replays
    /// it. Non-matching messages are returned to the queue; the scan stops
    /// after one full pass over the snapshot depth or when `limit` elapses.
    pub async fn reprocess_one(
        &self,
        queue: &str,
        correlation_id: &str,
        limit: Duration,
    ) -> Result<TargetedReport, AmqpError> {
        let expected = passive_queue_depth(&self.channel, queue).await?;
        if expected == 0 {
            info!(queue, "dead queue is empty");
            return Ok(TargetedReport { found: false });
        }

        info!(queue, correlation_id, "searching dead queue");

        let tag = format!("dlq-reprocessor-{}", Uuid::new_v4());
        let mut consumer = self.start_consumer(queue, &tag).await?;

        let mut found = false;
        let mut scanned = 0u32;
        let deadline = tokio::time::Instant::now() + limit;

        while scanned < expected {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, consumer.next()).await {
                Ok(Some(Ok(delivery))) => {
                    if matches_correlation(&delivery, correlation_id) {
                        if let Err(err) = self.replay(&delivery).await {
                            self.stop_consumer(&tag).await;
                            return Err(err);
                        }
                        info!(queue, correlation_id, "message found and reprocessed");
                        found = true;
                        break;
                    }

                    scanned += 1;
                    if let Err(err) = delivery
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        })
                        .await
                    {
                        error!(error = err.to_string(), "error requeueing non-match");
                        self.stop_consumer(&tag).await;
                        return Err(AmqpError::NackMessageError);
                    }
                }
                Ok(Some(Err(err))) => {
                    error!(error = err.to_string(), "error receiving dead letter");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(queue, correlation_id, "timeout before a match was found");
                    break;
                }
            }
        }

        self.stop_consumer(&tag).await;

        if !found {
            info!(queue, correlation_id, "message not found in dead queue");
        }

        Ok(TargetedReport { found })
    }

    /// Republishes one dead letter to its recorded origin with the retry
    /// history stripped, then acks it off the dead queue.
    async fn replay(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        let metadata = RetryMetadata::from_properties(&delivery.properties);
        let exchange = metadata
            .original_exchange
            .unwrap_or_else(|| MAIN_EXCHANGE.to_owned());
        let routing_key = metadata
            .original_routing_key
            .unwrap_or_else(|| ORDER_CREATED_KEY.to_owned());

        debug!(exchange, routing_key, "republishing dead letter");

        // Fresh headers: the replayed copy starts a new retry lifecycle.
        let properties = delivery.properties.clone().with_headers(FieldTable::default());

        if let Err(err) = self
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await
        {
            error!(error = err.to_string(), "error republishing dead letter");
            // Keep the message on the dead queue for a later attempt.
            if let Err(nack_err) = delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                error!(error = nack_err.to_string(), "error requeueing dead letter");
                return Err(AmqpError::NackMessageError);
            }
            return Err(AmqpError::PublishFailure(exchange));
        }

        match delivery.ack(BasicAckOptions { multiple: false }).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error acking dead letter");
                Err(AmqpError::AckMessageError)
            }
        }
    }

    async fn start_consumer(
        &self,
        queue: &str,
        tag: &str,
    ) -> Result<lapin::Consumer, AmqpError> {
        // One in-flight message keeps the scan order stable.
        if let Err(err) = self.channel.basic_qos(1, BasicQosOptions::default()).await {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
        }

        match self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => Ok(consumer),
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
        }
    }

    async fn stop_consumer(&self, tag: &str) {
        if let Err(err) = self
            .channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
        {
            error!(error = err.to_string(), "error cancelling consumer");
        }
    }
}

/// Matches a dead letter against the operator-supplied correlation id: the
/// producer-stamped message id when present, otherwise the order id parsed
/// from the payload.
fn matches_correlation(delivery: &Delivery, correlation_id: &str) -> bool {
    if let Some(message_id) = delivery.properties.message_id() {
        if message_id.as_str() == correlation_id {
            return true;
        }
    }

    event::extract_order_id(&delivery.data).as_deref() == Some(correlation_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{acker::Acker, types::ShortString, BasicProperties};

    fn dead_letter(message_id: Option<&str>, payload: &[u8]) -> Delivery {
        let mut properties = BasicProperties::default();
        if let Some(id) = message_id {
            properties = properties.with_message_id(ShortString::from(id));
        }

        Delivery {
            delivery_tag: 1,
            exchange: ShortString::from("orders.dlx"),
            routing_key: ShortString::from("email-service.dead"),
            redelivered: false,
            properties,
            data: payload.to_vec(),
            acker: Acker::default(),
        }
    }

    #[test]
    fn correlation_matches_the_producer_stamped_message_id() {
        let delivery = dead_letter(Some("o-1"), b"{}");
        assert!(matches_correlation(&delivery, "o-1"));
        assert!(!matches_correlation(&delivery, "o-2"));
    }

    #[test]
    fn correlation_falls_back_to_the_payload_order_id() {
        let delivery = dead_letter(None, b"{\"order_id\":\"o-7\"}");
        assert!(matches_correlation(&delivery, "o-7"));
        assert!(!matches_correlation(&delivery, "o-1"));
    }

    #[test]
    fn bulk_report_distinguishes_early_stop_causes() {
        // A timeout and a failed replay both leave messages behind; the
        // operator needs to tell them apart to pick the follow-up.
        let timed = ReprocessReport {
            processed: 2,
            expected: 5,
            timed_out: true,
            replay_failed: false,
        };
        let failed = ReprocessReport {
            processed: 2,
            expected: 5,
            timed_out: false,
            replay_failed: true,
        };
        assert_ne!(timed, failed);
        assert!(failed.replay_failed && !failed.timed_out);
    }
}
