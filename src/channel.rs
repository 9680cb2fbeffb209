// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Establishes the connection to the RabbitMQ server and creates the channel
//! used by the topology manager, the dispatcher and the reprocessor. Both are
//! wrapped in `Arc` so the per-queue consumer tasks can share them.

use crate::{config::Config, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP connection and channel from the configuration.
///
/// Infrastructure failures here are fatal for the process; callers are
/// expected to propagate them to startup and let supervision restart.
pub async fn new_amqp_channel(cfg: &Config) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let uri = format!(
        "amqp://{}:{}@{}:{}/{}",
        cfg.amqp.user, cfg.amqp.password, cfg.amqp.host, cfg.amqp.port, cfg.amqp.vhost
    );

    let conn = match Connection::connect(&uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
