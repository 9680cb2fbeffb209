// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! Operator CLI for replaying dead-lettered messages.

use clap::{Parser, Subcommand};
use redelivery::{
    channel::new_amqp_channel,
    config::Config,
    errors::AmqpError,
    reprocessor::DlqReprocessor,
    topology::{AmqpTopology, Topology},
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dlq-reprocess", about = "Replay dead-lettered order events")]
struct Cli {
    /// Bound on the replay, in seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay every message currently on a dead queue.
    All {
        /// Dead queue to drain, e.g. `email-service.dead`.
        queue: String,
    },
    /// Replay a single message matched by its order id.
    One {
        /// Dead queue to scan, e.g. `email-service.dead`.
        queue: String,
        /// Order id of the message to replay.
        correlation_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env();
    let limit = Duration::from_secs(cli.timeout_secs);

    let (_conn, channel) = new_amqp_channel(&cfg).await?;

    // Make sure the dead queues exist before touching them; a conflicting
    // topology is fatal here like everywhere else.
    AmqpTopology::for_services(channel.clone(), &cfg.services)
        .install()
        .await?;

    let reprocessor = DlqReprocessor::new(channel);

    match cli.command {
        Command::All { queue } => {
            let report = reprocessor.reprocess_all(&queue, limit).await?;
            info!(
                processed = report.processed,
                expected = report.expected,
                timed_out = report.timed_out,
                replay_failed = report.replay_failed,
                "bulk replay finished"
            );
        }
        Command::One {
            queue,
            correlation_id,
        } => {
            let report = reprocessor
                .reprocess_one(&queue, &correlation_id, limit)
                .await?;
            info!(found = report.found, "targeted replay finished");
        }
    }

    Ok(())
}
