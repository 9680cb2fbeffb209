// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Environment-driven configuration for the broker connection, the retry
//! policy and the set of consumer services. Every field has a default so the
//! crate runs against a local broker with no environment at all.

use std::env;
use std::str::FromStr;

/// Default services consuming the `order.created` event.
pub const DEFAULT_SERVICES: [&str; 3] = ["order-processor", "email-service", "inventory-service"];

/// Connection parameters for the RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
        }
    }
}

/// Parameters of the retry/dead-letter policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Failed attempts tolerated before a message is dead-lettered.
    pub max_retries: u32,
    /// First backoff interval; doubles on every attempt.
    pub base_delay_ms: u64,
    /// Cap for the exponential growth.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Top-level configuration assembled from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Used as the AMQP connection name.
    pub app_name: String,
    pub amqp: AmqpConfig,
    pub retry: RetryConfig,
    /// Services for which a main queue and a dead queue are declared.
    pub services: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_name: "redelivery".to_owned(),
            amqp: AmqpConfig::default(),
            retry: RetryConfig::default(),
            services: DEFAULT_SERVICES.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

impl Config {
    /// Builds the configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    ///
    /// Recognized variables: `APP_NAME`, `AMQP_HOST`, `AMQP_PORT`,
    /// `AMQP_USER`, `AMQP_PASSWORD`, `AMQP_VHOST`, `MAX_RETRIES`,
    /// `BASE_DELAY_MS`, `MAX_DELAY_MS` and `SERVICES` (comma-separated).
    pub fn from_env() -> Config {
        let defaults = Config::default();

        let services = match env::var("SERVICES") {
            Ok(raw) => {
                let parsed: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
                if parsed.is_empty() {
                    defaults.services
                } else {
                    parsed
                }
            }
            Err(_) => defaults.services,
        };

        Config {
            app_name: var_or("APP_NAME", defaults.app_name),
            amqp: AmqpConfig {
                host: var_or("AMQP_HOST", defaults.amqp.host),
                port: parse_or("AMQP_PORT", defaults.amqp.port),
                user: var_or("AMQP_USER", defaults.amqp.user),
                password: var_or("AMQP_PASSWORD", defaults.amqp.password),
                vhost: var_or("AMQP_VHOST", defaults.amqp.vhost),
            },
            retry: RetryConfig {
                max_retries: parse_or("MAX_RETRIES", defaults.retry.max_retries),
                base_delay_ms: parse_or("BASE_DELAY_MS", defaults.retry.base_delay_ms),
                max_delay_ms: parse_or("MAX_DELAY_MS", defaults.retry.max_delay_ms),
            },
            services,
        }
    }
}

fn var_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy_documentation() {
        let cfg = Config::default();

        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.amqp.port, 5672);
        assert_eq!(cfg.services.len(), 3);
        assert!(cfg.services.contains(&"email-service".to_owned()));
    }

    #[test]
    fn unset_environment_falls_back_to_defaults() {
        // None of these variables are set under `cargo test`.
        std::env::remove_var("AMQP_PORT");
        std::env::remove_var("MAX_RETRIES");

        let cfg = Config::from_env();
        assert_eq!(cfg.retry, RetryConfig::default());
        assert_eq!(cfg.amqp.port, 5672);
    }
}
