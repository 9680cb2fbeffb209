// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Consumer Loops
//!
//! One supervised task per registered queue: bounded prefetch of 1 (so
//! backoff delays are respected instead of racing a window of unacked
//! deliveries), explicit message-processing loop, and graceful shutdown — a
//! signal stops the intake of new deliveries immediately but the delivery
//! currently being evaluated always finishes its ack/retry/dead-letter
//! resolution before the loop exits.

use crate::{consumer::consume, errors::AmqpError, handler::ConsumerHandler, policy::RetryPolicy};
use futures_util::{future::join_all, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::global;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info};

/// Handler and policy bound to one queue.
#[derive(Clone)]
pub(crate) struct QueueDispatcherDefinition {
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) policy: Arc<RetryPolicy>,
}

/// Runs the consumer loops for every registered queue.
pub struct RabbitMQDispatcher {
    channel: Arc<Channel>,
    pub(crate) dispatchers_def: HashMap<String, QueueDispatcherDefinition>,
}

impl RabbitMQDispatcher {
    pub fn new(channel: Arc<Channel>) -> Self {
        RabbitMQDispatcher {
            channel,
            dispatchers_def: HashMap::default(),
        }
    }

    /// Registers a handler and its retry policy for one queue.
    pub fn register(
        mut self,
        queue_name: &str,
        handler: Arc<dyn ConsumerHandler>,
        policy: Arc<RetryPolicy>,
    ) -> Self {
        self.dispatchers_def
            .insert(queue_name.to_owned(), QueueDispatcherDefinition { handler, policy });
        self
    }

    /// Consumes from every registered queue until `shutdown` flips to true.
    ///
    /// Each queue gets its own task; the shared channel is configured with
    /// prefetch = 1 so each loop holds at most one unacked delivery.
    pub async fn consume_blocking(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), AmqpError> {
        let mut spawns = vec![];

        for (queue_name, def) in &self.dispatchers_def {
            if let Err(err) = self
                .channel
                .basic_qos(1, BasicQosOptions::default())
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(queue_name.clone()));
            }

            let mut consumer = match self
                .channel
                .basic_consume(
                    queue_name,
                    queue_name,
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
                Err(err) => {
                    error!(error = err.to_string(), "failure to create the consumer");
                    Err(AmqpError::ConsumerDeclarationError(queue_name.clone()))
                }
                Ok(c) => Ok(c),
            }?;

            let def = def.clone();
            let queue_name = queue_name.clone();
            let mut shutdown = shutdown.clone();

            spawns.push(tokio::spawn(async move {
                let tracer = global::tracer("amqp consumer");

                loop {
                    tokio::select! {
                        // Waiting for the NEXT delivery is the only
                        // cancellation point; an in-flight `consume` below is
                        // awaited to completion before the loop re-enters the
                        // select.
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!(queue = queue_name, "shutdown observed, stopping consumer");
                                break;
                            }
                        }
                        next = consumer.next() => {
                            match next {
                                Some(Ok(delivery)) => {
                                    if let Err(err) =
                                        consume(&tracer, &delivery, &def.handler, &def.policy).await
                                    {
                                        error!(error = err.to_string(), "error consuming message");
                                    }
                                }
                                Some(Err(err)) => {
                                    error!(error = err.to_string(), "error receiving delivery")
                                }
                                None => {
                                    info!(queue = queue_name, "consumer stream closed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }));
        }

        let spawned = join_all(spawns).await;
        for res in spawned {
            if res.is_err() {
                error!("consumer task panicked");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ConsumerMessage, HandlerError, MockConsumerHandler};
    use opentelemetry::Context;

    #[tokio::test]
    async fn registered_handler_is_invokable_through_the_trait_object() {
        let mut mock = MockConsumerHandler::new();
        mock.expect_exec()
            .times(1)
            .returning(|_, _| Err(HandlerError::Failed("nope".to_owned())));

        let handler: Arc<dyn ConsumerHandler> = Arc::new(mock);
        let msg = ConsumerMessage::new("email-service", "order.created", b"{}", "o-1");

        let result = handler.exec(&Context::new(), &msg).await;
        assert!(result.is_err());
    }
}
