// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Retry Metadata
//!
//! Strongly-typed retry history carried in message headers. This module is
//! the only place that touches raw AMQP header values; everything else works
//! with [`RetryMetadata`].
//!
//! Wire headers: `x-retry-count`, `x-exception`, `x-failed-at` (unix
//! seconds), `x-original-exchange`, `x-original-routing-key`.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Header carrying the number of attempts already made
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the last failure reason (informational)
pub const AMQP_HEADERS_EXCEPTION: &str = "x-exception";
/// Header carrying the unix timestamp of the last failure
pub const AMQP_HEADERS_FAILED_AT: &str = "x-failed-at";
/// Header preserving the exchange the message was first published to
pub const AMQP_HEADERS_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Header preserving the routing key the message was first published under
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// Retry history of one logical message.
///
/// `retry_count` is monotonically non-decreasing across the message's retry
/// lifecycle; the origin fields are captured on the first failure and carried
/// unchanged so a dead-lettered message can be replayed to its true origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetadata {
    pub retry_count: u32,
    pub last_exception: Option<String>,
    pub failed_at: Option<i64>,
    pub original_exchange: Option<String>,
    pub original_routing_key: Option<String>,
}

impl RetryMetadata {
    /// Reads the retry history out of delivery properties. Absent or
    /// foreign-typed headers read as the zero state.
    pub fn from_properties(props: &AMQPProperties) -> RetryMetadata {
        match props.headers() {
            Some(table) => RetryMetadata::from_table(table),
            None => RetryMetadata::default(),
        }
    }

    pub fn from_table(table: &FieldTable) -> RetryMetadata {
        let inner = table.inner();

        RetryMetadata {
            retry_count: inner
                .get(AMQP_HEADERS_RETRY_COUNT)
                .and_then(as_i64)
                .map(|count| count.max(0) as u32)
                .unwrap_or(0),
            last_exception: inner.get(AMQP_HEADERS_EXCEPTION).and_then(as_string),
            failed_at: inner.get(AMQP_HEADERS_FAILED_AT).and_then(as_i64),
            original_exchange: inner
                .get(AMQP_HEADERS_ORIGINAL_EXCHANGE)
                .and_then(as_string),
            original_routing_key: inner
                .get(AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
                .and_then(as_string),
        }
    }

    /// Serializes the metadata back into a header table.
    pub fn to_table(&self) -> FieldTable {
        let mut btree = BTreeMap::new();

        btree.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(self.retry_count as i64)),
        );
        if let Some(exception) = &self.last_exception {
            btree.insert(
                ShortString::from(AMQP_HEADERS_EXCEPTION),
                AMQPValue::LongString(LongString::from(exception.clone())),
            );
        }
        if let Some(failed_at) = self.failed_at {
            btree.insert(
                ShortString::from(AMQP_HEADERS_FAILED_AT),
                AMQPValue::LongLongInt(LongLongInt::from(failed_at)),
            );
        }
        if let Some(exchange) = &self.original_exchange {
            btree.insert(
                ShortString::from(AMQP_HEADERS_ORIGINAL_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(routing_key) = &self.original_routing_key {
            btree.insert(
                ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(routing_key.clone())),
            );
        }

        FieldTable::from(btree)
    }

    /// Metadata for the retry copy of a failed delivery.
    ///
    /// The origin fields are captured on the first failure (when the delivery
    /// still carries its true exchange/routing key) and preserved verbatim on
    /// every subsequent one.
    pub fn next_attempt(
        &self,
        next_count: u32,
        exception: &str,
        failed_at: i64,
        delivery_exchange: &str,
        delivery_routing_key: &str,
    ) -> RetryMetadata {
        RetryMetadata {
            retry_count: next_count,
            last_exception: Some(exception.to_owned()),
            failed_at: Some(failed_at),
            original_exchange: Some(
                self.original_exchange
                    .clone()
                    .unwrap_or_else(|| delivery_exchange.to_owned()),
            ),
            original_routing_key: Some(
                self.original_routing_key
                    .clone()
                    .unwrap_or_else(|| delivery_routing_key.to_owned()),
            ),
        }
    }

    /// Final metadata attached when the message moves to its dead queue.
    pub fn dead(
        &self,
        final_count: u32,
        exception: &str,
        failed_at: i64,
        delivery_exchange: &str,
        delivery_routing_key: &str,
    ) -> RetryMetadata {
        // Same origin-preservation rule as `next_attempt`; the count stops
        // incrementing once the message leaves the retry path.
        self.next_attempt(
            final_count,
            exception,
            failed_at,
            delivery_exchange,
            delivery_routing_key,
        )
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_once() -> RetryMetadata {
        RetryMetadata {
            retry_count: 1,
            last_exception: Some("smtp timeout".to_owned()),
            failed_at: Some(1_700_000_000),
            original_exchange: Some("orders".to_owned()),
            original_routing_key: Some("order.created".to_owned()),
        }
    }

    #[test]
    fn header_round_trip_preserves_every_field() {
        let meta = failed_once();
        let table = meta.to_table();
        assert_eq!(RetryMetadata::from_table(&table), meta);
    }

    #[test]
    fn missing_headers_read_as_zero_state() {
        let meta = RetryMetadata::from_table(&FieldTable::default());
        assert_eq!(meta, RetryMetadata::default());
        assert_eq!(meta.retry_count, 0);
    }

    #[test]
    fn foreign_typed_count_is_ignored() {
        let mut btree = BTreeMap::new();
        btree.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongString(LongString::from("three")),
        );
        let meta = RetryMetadata::from_table(&FieldTable::from(btree));
        assert_eq!(meta.retry_count, 0);
    }

    #[test]
    fn integer_count_widths_all_parse() {
        let mut btree = BTreeMap::new();
        btree.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(2.into()),
        );
        let meta = RetryMetadata::from_table(&FieldTable::from(btree));
        assert_eq!(meta.retry_count, 2);
    }

    #[test]
    fn first_failure_captures_the_delivery_origin() {
        let meta = RetryMetadata::default().next_attempt(
            1,
            "boom",
            1_700_000_123,
            "orders",
            "order.created",
        );

        assert_eq!(meta.retry_count, 1);
        assert_eq!(meta.original_exchange.as_deref(), Some("orders"));
        assert_eq!(meta.original_routing_key.as_deref(), Some("order.created"));
    }

    #[test]
    fn later_failures_preserve_the_captured_origin() {
        // Redeliveries from a delay queue arrive via the default exchange;
        // the origin recorded on the first failure must win.
        let meta = failed_once().next_attempt(2, "boom again", 1_700_000_200, "", "email-service");

        assert_eq!(meta.retry_count, 2);
        assert_eq!(meta.original_exchange.as_deref(), Some("orders"));
        assert_eq!(meta.original_routing_key.as_deref(), Some("order.created"));
        assert_eq!(meta.last_exception.as_deref(), Some("boom again"));
    }

    #[test]
    fn dead_metadata_keeps_the_final_count() {
        let meta = failed_once().dead(3, "boom", 1_700_000_300, "", "email-service");
        assert_eq!(meta.retry_count, 3);
        assert_eq!(meta.original_exchange.as_deref(), Some("orders"));
    }
}
