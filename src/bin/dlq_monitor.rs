// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! Watches a dead queue and logs every dead letter with its retry history.

use clap::Parser;
use futures_util::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions},
    types::FieldTable,
};
use redelivery::{
    channel::new_amqp_channel, config::Config, errors::AmqpError, metadata::RetryMetadata,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dlq-monitor", about = "Log dead-lettered order events")]
struct Cli {
    /// Dead queue to watch.
    #[arg(default_value = "order-processor.dead")]
    queue: String,
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env();

    let (_conn, channel) = new_amqp_channel(&cfg).await?;

    let mut consumer = channel
        .basic_consume(
            &cli.queue,
            "dlq-monitor",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to create the consumer");
            AmqpError::ConsumerDeclarationError(cli.queue.clone())
        })?;

    info!(queue = cli.queue, "watching dead queue, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping dlq monitor");
                break;
            }
            next = consumer.next() => {
                match next {
                    Some(Ok(delivery)) => {
                        let meta = RetryMetadata::from_properties(&delivery.properties);
                        info!(
                            queue = cli.queue,
                            retry_count = meta.retry_count,
                            exception = meta.last_exception.as_deref().unwrap_or("n/a"),
                            failed_at = meta.failed_at.unwrap_or_default(),
                            payload = %String::from_utf8_lossy(&delivery.data),
                            "dead letter"
                        );

                        if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                            error!(error = err.to_string(), "error acking dead letter");
                        }
                    }
                    Some(Err(err)) => error!(error = err.to_string(), "error receiving delivery"),
                    None => break,
                }
            }
        }
    }

    Ok(())
}
