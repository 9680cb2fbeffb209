// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Reliability Topology
//!
//! Declares everything the retry/dead-letter scheme needs before any publish
//! or consume happens: the `orders` topic exchange, the `orders.dlx` direct
//! exchange, one durable main queue per service (dead-lettering into the DLX
//! under `<service>.dead`) and one durable dead queue per service bound to
//! that same key.
//!
//! Declarations are idempotent as long as arguments match. A redeclare with
//! different arguments surfaces as [`AmqpError::TopologyConflict`] and must
//! abort startup.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Topic exchange carrying order events.
pub const MAIN_EXCHANGE: &str = "orders";
/// Direct exchange receiving dead-lettered messages.
pub const DEAD_LETTER_EXCHANGE: &str = "orders.dlx";
/// Routing key of the order-created event.
pub const ORDER_CREATED_KEY: &str = "order.created";

/// Name of the dead queue for a service.
pub fn dead_queue_name(service: &str) -> String {
    format!("{service}.dead")
}

/// Routing key a service's main queue dead-letters under. Identical to the
/// dead queue name so the DLX binding is a direct match.
pub fn dead_routing_key(service: &str) -> String {
    format!("{service}.dead")
}

/// Interface for assembling and installing a broker topology.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// Declares all exchanges, then all queues, then all bindings. Safe to
    /// call repeatedly with identical definitions.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the [`Topology`] trait.
pub struct AmqpTopology {
    channel: Arc<Channel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            bindings: vec![],
        }
    }

    /// Canonical reliability topology for the given services.
    pub fn for_services(channel: Arc<Channel>, services: &[String]) -> AmqpTopology {
        let mut topology = AmqpTopology::new(channel)
            .exchange(ExchangeDefinition::new(MAIN_EXCHANGE).topic().durable())
            .exchange(
                ExchangeDefinition::new(DEAD_LETTER_EXCHANGE)
                    .direct()
                    .durable(),
            );

        for service in services {
            let (main, dead) = service_queues(service);
            let (main_binding, dead_binding) = service_bindings(service);
            topology = topology
                .queue(main)
                .queue(dead)
                .queue_binding(main_binding)
                .queue_binding(dead_binding);
        }

        topology
    }
}

/// Main and dead queue definitions for one service.
pub(crate) fn service_queues(service: &str) -> (QueueDefinition, QueueDefinition) {
    let main = QueueDefinition::new(service)
        .durable()
        .dead_letter_to(DEAD_LETTER_EXCHANGE, &dead_routing_key(service));
    let dead = QueueDefinition::new(&dead_queue_name(service)).durable();
    (main, dead)
}

/// Bindings for one service: main queue to the topic exchange under the
/// order-created key, dead queue to the DLX under the dead routing key.
pub(crate) fn service_bindings(service: &str) -> (QueueBinding, QueueBinding) {
    let main = QueueBinding::new(service)
        .exchange(MAIN_EXCHANGE)
        .routing_key(ORDER_CREATED_KEY);
    let dead = QueueBinding::new(&dead_queue_name(service))
        .exchange(DEAD_LETTER_EXCHANGE)
        .routing_key(&dead_routing_key(service));
    (main, dead)
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.bind_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());

            match self
                .channel
                .exchange_declare(
                    exch.name(),
                    exch.kind.into(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name(),
                        "error to declare the exchange"
                    );
                    Err(declare_error(&err, exch.name(), |name| {
                        AmqpError::DeclareExchangeError(name)
                    }))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name());

            match self
                .channel
                .queue_declare(
                    def.name(),
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: def.exclusive,
                        auto_delete: def.delete,
                        nowait: false,
                    },
                    def.arguments(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = def.name(),
                        "error to declare the queue"
                    );
                    Err(declare_error(&err, def.name(), |name| {
                        AmqpError::DeclareQueueError(name)
                    }))
                }
                _ => {
                    debug!("queue: {} was created", def.name());
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    async fn bind_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Current depth of `queue` without touching its messages, via a passive
/// declare.
///
/// Fails when the queue does not exist; on AMQP brokers that failure also
/// closes the channel, so callers should treat it as fatal for the channel.
pub async fn passive_queue_depth(channel: &Channel, queue: &str) -> Result<u32, AmqpError> {
    match channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(state) => Ok(state.message_count()),
        Err(err) => {
            error!(error = err.to_string(), queue, "error inspecting queue");
            Err(AmqpError::DeclareQueueError(queue.to_owned()))
        }
    }
}

/// Maps a declare failure, surfacing argument mismatches (AMQP code 406,
/// PRECONDITION_FAILED) as the fatal `TopologyConflict`.
fn declare_error(
    err: &lapin::Error,
    name: &str,
    fallback: impl FnOnce(String) -> AmqpError,
) -> AmqpError {
    if let lapin::Error::ProtocolError(amqp_err) = err {
        if amqp_err.get_id() == 406 {
            return AmqpError::TopologyConflict(
                name.to_owned(),
                amqp_err.get_message().as_str().to_owned(),
            );
        }
    }
    fallback(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY};
    use lapin::types::{AMQPValue, LongString};

    #[test]
    fn service_queue_dead_letters_into_the_dlx() {
        let (main, dead) = service_queues("inventory-service");

        assert_eq!(main.name(), "inventory-service");
        assert!(main.durable);

        let args = main.arguments();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("orders.dlx")))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from(
                "inventory-service.dead"
            )))
        );

        assert_eq!(dead.name(), "inventory-service.dead");
        assert!(dead.durable);
        assert!(dead.arguments().inner().is_empty());
    }

    #[test]
    fn service_bindings_match_the_exchange_layout() {
        let (main, dead) = service_bindings("email-service");

        assert_eq!(main.queue_name, "email-service");
        assert_eq!(main.exchange_name, MAIN_EXCHANGE);
        assert_eq!(main.routing_key, ORDER_CREATED_KEY);

        assert_eq!(dead.queue_name, "email-service.dead");
        assert_eq!(dead.exchange_name, DEAD_LETTER_EXCHANGE);
        assert_eq!(dead.routing_key, "email-service.dead");
    }

    #[test]
    fn definitions_are_stable_across_rebuilds() {
        // Idempotence precondition: building the topology twice yields the
        // exact same declarations, so a second install is a no-op broker-side.
        let first = service_queues("order-processor");
        let second = service_queues("order-processor");
        assert_eq!(first, second);

        let first = service_bindings("order-processor");
        let second = service_bindings("order-processor");
        assert_eq!(first, second);
    }
}
