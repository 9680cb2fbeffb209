// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Domain Handler Boundary
//!
//! The consumer loop invokes one [`ConsumerHandler`] per queue and branches
//! on its explicit result. Handler failures never escalate past the failing
//! message: they are routed into the retry policy, not surfaced to the loop's
//! caller.

use async_trait::async_trait;
use opentelemetry::Context;
use thiserror::Error;

/// A delivery as seen by the domain handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Message type announced in the properties, when present.
    pub msg_type: String,
    /// Raw payload bytes, opaque to the delivery machinery.
    pub data: Vec<u8>,
    /// Application-level id used for retry tracking and targeted replay.
    pub correlation_id: String,
}

impl ConsumerMessage {
    pub fn new(queue: &str, msg_type: &str, data: &[u8], correlation_id: &str) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            msg_type: msg_type.to_owned(),
            data: data.to_vec(),
            correlation_id: correlation_id.to_owned(),
        }
    }
}

/// Typed failure returned by the domain boundary.
///
/// A malformed payload is a handler failure like any other and enters the
/// same retry/dead-letter path.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("handler failure: {0}")]
    Failed(String),
}

/// Domain handler invoked by the consumer loop.
///
/// The loop does not know what the handler does, only whether it completed
/// without error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mocked_handler_reports_typed_failures() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::Failed("smtp timeout".to_owned())));

        let msg = ConsumerMessage::new("email-service", "order.created", b"{}", "o-1");
        let result = handler.exec(&Context::new(), &msg).await;

        assert_eq!(result, Err(HandlerError::Failed("smtp timeout".to_owned())));
    }
}
