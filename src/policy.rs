// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Retry / Dead-Letter Decision Engine
//!
//! Single source of truth for what happens to a failed delivery. The pure
//! [`decide`] function picks between scheduling a delayed retry and moving
//! the message to its dead queue; [`RetryPolicy`] performs the corresponding
//! broker actions and guarantees the original delivery is resolved exactly
//! once — acked when a copy was published elsewhere, nacked with requeue as
//! the last-resort fallback when that publish fails.
//!
//! Delayed retries use a short-lived auto-deleting delay queue: the copy sits
//! there until its message TTL expires, then the queue's own dead-letter
//! routing returns it to the service's main queue through the default
//! exchange.

use crate::{
    backoff::Backoff,
    config::RetryConfig,
    errors::AmqpError,
    handler::HandlerError,
    metadata::RetryMetadata,
    queue::QueueDefinition,
    retry::{HeaderRetryStore, RetryStore},
    topology::{dead_routing_key, DEAD_LETTER_EXCHANGE},
};
use crate::backoff::JITTER_MAX_MS;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions},
    Channel,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, warn};
use uuid::Uuid;

/// Outcome of evaluating one failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Schedule redelivery after `delay_ms`, stamped with `next_count`.
    Retry { next_count: u32, delay_ms: u64 },
    /// Move to the dead queue carrying `final_count`.
    DeadLetter { final_count: u32 },
}

/// Picks retry vs. dead-letter for a message that has already failed
/// `previous_count` times.
pub fn decide(
    previous_count: u32,
    max_retries: u32,
    backoff: &Backoff,
) -> Result<Decision, AmqpError> {
    if previous_count < max_retries {
        let next_count = previous_count + 1;
        let delay_ms = backoff.delay_ms(next_count)?;
        Ok(Decision::Retry {
            next_count,
            delay_ms,
        })
    } else {
        Ok(Decision::DeadLetter {
            final_count: previous_count,
        })
    }
}

/// Pause applied before requeueing a delivery whose retry or dead-letter
/// copy could not be published. The retry count never advances on that path,
/// so without a pause a broker-side publish outage would spin the
/// fail/requeue cycle at full speed.
pub(crate) fn publish_failure_pause(backoff: &Backoff) -> Duration {
    // Attempt 1 is always valid; the fallback keeps the pause non-zero even
    // if that ever changes.
    let ms = backoff.delay_ms(1).unwrap_or(JITTER_MAX_MS);
    Duration::from_millis(ms)
}

/// Clamps a computed delay to the signed 32-bit range AMQP uses for TTL
/// arguments, so oversized `max_delay_ms` configurations cannot truncate or
/// wrap on the wire.
pub(crate) fn wire_ttl_ms(delay_ms: u64) -> u32 {
    delay_ms.min(i32::MAX as u64) as u32
}

/// Per-queue decision engine bound to a channel.
pub struct RetryPolicy {
    channel: Arc<Channel>,
    queue_name: String,
    max_retries: u32,
    backoff: Backoff,
    store: Arc<dyn RetryStore>,
}

impl RetryPolicy {
    pub fn new(
        channel: Arc<Channel>,
        queue_name: &str,
        max_retries: u32,
        backoff: Backoff,
        store: Arc<dyn RetryStore>,
    ) -> RetryPolicy {
        RetryPolicy {
            channel,
            queue_name: queue_name.to_owned(),
            max_retries,
            backoff,
            store,
        }
    }

    /// Policy for one queue from the shared retry configuration, tracking
    /// counts in the message headers (the restart-safe default).
    pub fn from_config(
        channel: Arc<Channel>,
        queue_name: &str,
        cfg: &RetryConfig,
    ) -> RetryPolicy {
        RetryPolicy::new(
            channel,
            queue_name,
            cfg.max_retries,
            Backoff::new(cfg.base_delay_ms, cfg.max_delay_ms),
            Arc::new(HeaderRetryStore),
        )
    }

    /// Queue this policy resolves deliveries for.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Acks a successfully handled delivery and drops its tracking state.
    pub async fn resolve_success(
        &self,
        delivery: &Delivery,
        correlation_id: &str,
    ) -> Result<(), AmqpError> {
        self.store.remove(&self.queue_name, correlation_id);

        match delivery.ack(BasicAckOptions { multiple: false }).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error while acking message");
                Err(AmqpError::AckMessageError)
            }
        }
    }

    /// Resolves a failed delivery: schedules a delayed retry or moves the
    /// message to the dead queue, then acks the original. If the republish
    /// fails, the original is nacked with requeue so it is never dropped.
    pub async fn handle_failure(
        &self,
        delivery: &Delivery,
        correlation_id: &str,
        failure: &HandlerError,
    ) -> Result<(), AmqpError> {
        let metadata = RetryMetadata::from_properties(&delivery.properties);

        // The count is taken exactly once, before the decision, and the new
        // count is the one persisted with whichever copy gets published.
        let (new_count, previous_count) =
            self.store
                .increment(&self.queue_name, correlation_id, &metadata);

        match decide(previous_count, self.max_retries, &self.backoff)? {
            Decision::Retry {
                next_count,
                delay_ms,
            } => {
                debug_assert_eq!(next_count, new_count);
                self.schedule_retry(delivery, &metadata, next_count, delay_ms, failure)
                    .await
            }
            Decision::DeadLetter { final_count } => {
                self.store.remove(&self.queue_name, correlation_id);
                self.dead_letter(delivery, &metadata, final_count, failure)
                    .await
            }
        }
    }

    async fn schedule_retry(
        &self,
        delivery: &Delivery,
        metadata: &RetryMetadata,
        next_count: u32,
        delay_ms: u64,
        failure: &HandlerError,
    ) -> Result<(), AmqpError> {
        warn!(
            queue = self.queue_name,
            retry = next_count,
            delay_ms,
            "handler failed, scheduling retry"
        );

        let next_metadata = metadata.next_attempt(
            next_count,
            &failure.to_string(),
            unix_now(),
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
        );

        // One throwaway queue per scheduled retry. Expiry dead-letters the
        // copy straight back to the main queue via the default exchange, so
        // it reappears there exactly once and only after the delay.
        let delay_queue = format!("{}.delay.{}", self.queue_name, Uuid::new_v4());
        let ttl_ms = wire_ttl_ms(delay_ms);
        let definition = QueueDefinition::new(&delay_queue)
            .durable()
            .delete()
            .ttl_ms(ttl_ms)
            .expires_ms(ttl_ms.saturating_add(60_000))
            .dead_letter_to("", &self.queue_name);

        if let Err(err) = self
            .channel
            .queue_declare(
                &delay_queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: true,
                    nowait: false,
                },
                definition.arguments(),
            )
            .await
        {
            error!(error = err.to_string(), "failure to declare delay queue");
            self.nack_requeue(delivery).await?;
            return Err(AmqpError::DeclareQueueError(delay_queue));
        }

        let properties = delivery
            .properties
            .clone()
            .with_headers(next_metadata.to_table());

        match self
            .channel
            .basic_publish(
                "",
                &delay_queue,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await
        {
            Ok(_) => self.ack(delivery).await,
            Err(err) => {
                error!(error = err.to_string(), "failure to publish retry copy");
                self.nack_requeue(delivery).await?;
                Err(AmqpError::PublishFailure(delay_queue))
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        metadata: &RetryMetadata,
        final_count: u32,
        failure: &HandlerError,
    ) -> Result<(), AmqpError> {
        error!(
            queue = self.queue_name,
            retries = final_count,
            "too many attempts, sending to dlq"
        );

        let final_metadata = metadata.dead(
            final_count,
            &failure.to_string(),
            unix_now(),
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
        );

        let properties = delivery
            .properties
            .clone()
            .with_headers(final_metadata.to_table());

        match self
            .channel
            .basic_publish(
                DEAD_LETTER_EXCHANGE,
                &dead_routing_key(&self.queue_name),
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await
        {
            Ok(_) => self.ack(delivery).await,
            Err(err) => {
                error!(error = err.to_string(), "failure to publish to dlq");
                self.nack_requeue(delivery).await?;
                Err(AmqpError::PublishFailure(DEAD_LETTER_EXCHANGE.to_owned()))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        match delivery.ack(BasicAckOptions { multiple: false }).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error while acking message");
                Err(AmqpError::AckMessageError)
            }
        }
    }

    /// Last-resort resolution when a republish fails: pause for one backoff
    /// interval, then put the delivery back on the main queue instead of
    /// leaving it unacknowledged.
    async fn nack_requeue(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        tokio::time::sleep(publish_failure_pause(&self.backoff)).await;

        match delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error while nacking message");
                Err(AmqpError::NackMessageError)
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::JITTER_MAX_MS;

    fn backoff() -> Backoff {
        Backoff::with_seed(1_000, 30_000, 11)
    }

    #[test]
    fn failures_below_the_limit_schedule_a_retry() {
        let backoff = backoff();

        for previous in 0..3 {
            match decide(previous, 3, &backoff).unwrap() {
                Decision::Retry {
                    next_count,
                    delay_ms,
                } => {
                    assert_eq!(next_count, previous + 1);
                    let floor = 1_000u64 * 2u64.pow(previous);
                    assert!((floor..=floor + JITTER_MAX_MS).contains(&delay_ms));
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
    }

    #[test]
    fn reaching_the_limit_dead_letters_with_the_final_count() {
        let decision = decide(3, 3, &backoff()).unwrap();
        assert_eq!(decision, Decision::DeadLetter { final_count: 3 });
    }

    #[test]
    fn counts_past_the_limit_never_re_enter_the_retry_path() {
        let decision = decide(7, 3, &backoff()).unwrap();
        assert_eq!(decision, Decision::DeadLetter { final_count: 7 });
    }

    #[test]
    fn zero_max_retries_dead_letters_immediately() {
        let decision = decide(0, 0, &backoff()).unwrap();
        assert_eq!(decision, Decision::DeadLetter { final_count: 0 });
    }

    #[test]
    fn publish_failure_pause_is_bounded_and_nonzero() {
        // A failed republish never advances the retry count, so the pause
        // before the requeue is what keeps the cycle from spinning.
        let pause = publish_failure_pause(&backoff());
        assert!(pause >= Duration::from_millis(1_000));
        assert!(pause <= Duration::from_millis(1_000 + JITTER_MAX_MS));
    }

    #[test]
    fn wire_ttl_clamps_oversized_delays() {
        assert_eq!(wire_ttl_ms(4_000), 4_000);
        assert_eq!(wire_ttl_ms(i32::MAX as u64), i32::MAX as u32);
        assert_eq!(wire_ttl_ms(u64::MAX), i32::MAX as u32);
    }

    #[test]
    fn scheduled_delays_grow_with_the_attempt() {
        let backoff = backoff();
        let mut previous_floor = 0u64;

        for previous in 0..5 {
            if let Decision::Retry { delay_ms, .. } = decide(previous, 10, &backoff).unwrap() {
                let floor = delay_ms.saturating_sub(JITTER_MAX_MS);
                assert!(floor >= previous_floor);
                previous_floor = floor;
            } else {
                panic!("expected retry");
            }
        }
    }
}
