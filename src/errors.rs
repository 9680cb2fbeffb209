// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Error Types for Reliable AMQP Delivery
//!
//! The `AmqpError` enum covers every failure class in the delivery pipeline:
//! connection/channel setup, topology declaration, publishing, delivery
//! resolution and the backoff calculator. Handler failures are deliberately
//! NOT part of this enum; they are a separate type (`handler::HandlerError`)
//! returned by the domain boundary and routed into the retry policy instead
//! of propagating as infrastructure errors.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A queue or exchange already exists with different arguments.
    ///
    /// Fatal at startup: the broker state contradicts the requested topology
    /// and proceeding would silently change delivery semantics.
    #[error("topology conflict on `{0}`: {1}")]
    TopologyConflict(String, String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingError(String, String),

    /// Error publishing a message to an exchange
    #[error("failure to publish to `{0}`")]
    PublishFailure(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Attempt numbers are counted starting at 1; 0 is a programming error
    /// in the integration, never a runtime condition to paper over.
    #[error("invalid backoff attempt `{0}`, attempts start at 1")]
    InvalidAttempt(u32),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos on `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),
}
