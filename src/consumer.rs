// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Per-Delivery Consume Path
//!
//! Evaluates one delivery end to end: open a consumer span, invoke the
//! queue's domain handler, and resolve the delivery exactly once — ack on
//! success, retry policy on failure. Handler failures stop here; only
//! infrastructure errors propagate to the dispatcher loop.

use crate::{
    errors::AmqpError,
    event,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    policy::RetryPolicy,
};
use lapin::message::Delivery;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, warn};

pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handler: &Arc<dyn ConsumerHandler>,
    policy: &RetryPolicy,
) -> Result<(), AmqpError> {
    let msg_type = message_type(delivery);
    let correlation_id = correlation_id(delivery);

    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &msg_type);

    debug!(
        queue = policy.queue_name(),
        msg_type,
        correlation_id,
        exchange = delivery.exchange.as_str(),
        "received message"
    );

    let msg = ConsumerMessage::new(
        policy.queue_name(),
        &msg_type,
        &delivery.data,
        &correlation_id,
    );

    match handler.exec(&ctx, &msg).await {
        Ok(_) => {
            debug!("message successfully processed");
            match policy.resolve_success(delivery, &correlation_id).await {
                Ok(_) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
            }
        }
        Err(failure) => {
            warn!(
                error = failure.to_string(),
                correlation_id, "handler failed"
            );

            match policy
                .handle_failure(delivery, &correlation_id, &failure)
                .await
            {
                Ok(_) => {
                    // The failure itself still marks the span; the delivery
                    // was resolved into the retry or dead-letter path.
                    span.record_error(&failure);
                    span.set_status(Status::Error {
                        description: Cow::from("handler failure"),
                    });
                    Ok(())
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure resolving delivery"),
                    });
                    Err(err)
                }
            }
        }
    }
}

fn message_type(delivery: &Delivery) -> String {
    match delivery.properties.kind() {
        Some(kind) => kind.to_string(),
        None => String::new(),
    }
}

/// Stable application-level id for retry tracking: the message id stamped by
/// the producer when present (it survives republished copies because retry
/// copies keep the original properties), otherwise the order id parsed from
/// the payload.
pub(crate) fn correlation_id(delivery: &Delivery) -> String {
    if let Some(message_id) = delivery.properties.message_id() {
        if !message_id.as_str().is_empty() {
            return message_id.as_str().to_owned();
        }
    }

    event::extract_order_id(&delivery.data).unwrap_or_default()
}
