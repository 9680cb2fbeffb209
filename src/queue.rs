// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builder for the queues the reliability topology declares: per-service main
//! queues (with dead-letter arguments), per-service dead queues, and the
//! short-lived delay queues the retry policy creates on demand.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument for the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument for the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for the per-queue message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for the idle-expiry of the queue itself
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Definition of a queue with its declaration parameters.
///
/// Built through the builder methods and turned into broker arguments with
/// [`QueueDefinition::arguments`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl_ms: Option<u32>,
    pub(crate) expires_ms: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Name of the queue as declared on the broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the per-queue message TTL in milliseconds.
    ///
    /// Combined with `dead_letter_to`, this is what turns a queue into a
    /// delay queue: messages sit until the TTL expires, then are routed to
    /// the configured dead-letter target.
    pub fn ttl_ms(mut self, ttl: u32) -> Self {
        self.ttl_ms = Some(ttl);
        self
    }

    /// Deletes the queue itself once it has been unused for `expires` ms.
    ///
    /// Delay queues set this so the broker garbage-collects them after their
    /// single message has expired; auto-delete alone never fires for a queue
    /// that no consumer ever attaches to.
    pub fn expires_ms(mut self, expires: u32) -> Self {
        self.expires_ms = Some(expires);
        self
    }

    /// Routes rejected or expired messages to the given exchange and key.
    pub fn dead_letter_to(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Broker arguments table for `queue_declare`.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(routing_key.clone())),
            );
        }
        // TTL arguments are signed 32-bit on the wire.
        if let Some(ttl) = self.ttl_ms {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl.min(i32::MAX as u32) as i32)),
            );
        }
        if let Some(expires) = self.expires_ms {
            args.insert(
                ShortString::from(AMQP_HEADERS_EXPIRES),
                AMQPValue::LongInt(LongInt::from(expires.min(i32::MAX as u32) as i32)),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_queue_arguments_carry_dead_letter_target() {
        let def = QueueDefinition::new("email-service")
            .durable()
            .dead_letter_to("orders.dlx", "email-service.dead");

        let args = def.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("orders.dlx")))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from(
                "email-service.dead"
            )))
        );
        assert!(inner.get(AMQP_HEADERS_MESSAGE_TTL).is_none());
    }

    #[test]
    fn delay_queue_arguments_carry_ttl() {
        let def = QueueDefinition::new("email-service.delay.1")
            .durable()
            .delete()
            .ttl_ms(4_000)
            .expires_ms(64_000)
            .dead_letter_to("", "email-service");

        let args = def.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(LongInt::from(4_000)))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_EXPIRES),
            Some(&AMQPValue::LongInt(LongInt::from(64_000)))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert!(def.delete);
    }

    #[test]
    fn oversized_ttls_clamp_to_the_signed_wire_range() {
        let def = QueueDefinition::new("email-service.delay.1")
            .ttl_ms(u32::MAX)
            .expires_ms(u32::MAX);

        let args = def.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(LongInt::from(i32::MAX)))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_EXPIRES),
            Some(&AMQPValue::LongInt(LongInt::from(i32::MAX)))
        );
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("order-processor.dead").durable();
        assert!(def.arguments().inner().is_empty());
    }
}
