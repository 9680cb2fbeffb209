// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! Periodically reports main and dead queue depths for every configured
//! service and warns when a dead queue is filling up.

use clap::Parser;
use lapin::Channel;
use redelivery::{
    channel::new_amqp_channel,
    config::Config,
    errors::AmqpError,
    topology::{dead_queue_name, passive_queue_depth},
};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "health-check", about = "Report queue depths for the order pipeline")]
struct Cli {
    /// Seconds between checks.
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,

    /// Dead-queue depth above which a warning is logged.
    #[arg(long, default_value_t = 10)]
    dead_alert_threshold: u32,
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env();

    info!(
        interval_secs = cli.interval_secs,
        "watching queue depths, ctrl-c to stop"
    );

    loop {
        // A failed passive declare closes the channel, so each cycle gets a
        // fresh connection and a broker outage only costs one cycle.
        match new_amqp_channel(&cfg).await {
            Ok((_conn, channel)) => {
                for service in &cfg.services {
                    check_service(&channel, service, cli.dead_alert_threshold).await;
                }
            }
            Err(err) => error!(error = err.to_string(), "broker unreachable"),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping health check");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(cli.interval_secs)) => {}
        }
    }

    Ok(())
}

async fn check_service(channel: &Channel, service: &str, threshold: u32) {
    let main_depth = match passive_queue_depth(channel, service).await {
        Ok(depth) => depth,
        Err(_) => return,
    };
    let dead_depth = match passive_queue_depth(channel, &dead_queue_name(service)).await {
        Ok(depth) => depth,
        Err(_) => return,
    };

    info!(service, main_depth, dead_depth, "queue depths");

    if dead_depth > threshold {
        warn!(service, dead_depth, threshold, "dead queue is filling up");
    }
}
