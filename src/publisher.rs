// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! Producer boundary: emits one message per validated order-creation fact to
//! the `orders` topic exchange under `order.created`, with the trace context
//! injected into the headers and the order id stamped as the message id (the
//! correlation id used by retry tracking and targeted replay).

use crate::{
    errors::AmqpError,
    event::OrderCreated,
    otel::AmqpTracePropagator,
    topology::{MAIN_EXCHANGE, ORDER_CREATED_KEY},
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{global, Context};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Content type of every published payload
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publisher bound to a channel.
pub struct RabbitMQPublisher {
    channel: Arc<Channel>,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<Channel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }

    /// Publishes an order-created event to the topic exchange.
    pub async fn publish_order_created(
        &self,
        ctx: &Context,
        event: &OrderCreated,
    ) -> Result<(), AmqpError> {
        let payload = serde_json::to_vec(event).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize event");
            AmqpError::ParsePayloadError
        })?;

        self.publish(
            ctx,
            MAIN_EXCHANGE,
            ORDER_CREATED_KEY,
            &payload,
            &event.order_id.to_string(),
        )
        .await
    }

    /// Publishes raw bytes with trace headers, a JSON content type and the
    /// given message id.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        message_id: &str,
    ) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut AmqpTracePropagator::new(&mut btree))
        });

        debug!(exchange, routing_key, message_id, "publishing message");

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_type(ShortString::from(routing_key.to_owned()))
                    .with_message_id(ShortString::from(message_id.to_owned()))
                    .with_headers(FieldTable::from(btree)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishFailure(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }
}
