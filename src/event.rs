// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Order Event Payload
//!
//! The `order.created` fact carried through the broker. The delivery
//! machinery treats the payload as opaque bytes; this type exists for the
//! producer boundary, the binaries and for extracting the correlation id
//! (the order id) during retry tracking and targeted replay.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ordered line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

/// The "order created" fact published to the `orders` exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub total_amount: f64,
    /// Unix seconds.
    pub created_at: i64,
    pub items: Vec<OrderItem>,
}

/// Pulls the order id out of a payload without requiring the full event
/// shape, so replay still works for messages produced by older schemas.
pub fn extract_order_id(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value
        .get("order_id")
        .and_then(|id| id.as_str())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> OrderCreated {
        OrderCreated {
            order_id: Uuid::new_v4(),
            customer_name: "Ada Lovelace".to_owned(),
            customer_email: "ada@example.com".to_owned(),
            total_amount: 199.90,
            created_at: 1_700_000_000,
            items: vec![OrderItem {
                product_id: Uuid::new_v4(),
                product_name: "Widget".to_owned(),
                quantity: 2,
                unit_price: 99.95,
            }],
        }
    }

    #[test]
    fn event_json_round_trip() {
        let event = sample_event();
        let json = serde_json::to_vec(&event).unwrap();
        let decoded: OrderCreated = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn order_id_is_extractable_from_raw_payload() {
        let event = sample_event();
        let json = serde_json::to_vec(&event).unwrap();
        assert_eq!(extract_order_id(&json), Some(event.order_id.to_string()));
    }

    #[test]
    fn extraction_tolerates_foreign_payloads() {
        assert_eq!(extract_order_id(b"not json"), None);
        assert_eq!(extract_order_id(b"{\"other\":1}"), None);
    }
}
