// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Retry Tracking
//!
//! Answers "how many times has this logical message already failed?" through
//! an injected [`RetryStore`] so deployments can choose where the counter
//! lives.
//!
//! Two strategies ship with the crate:
//!
//! - [`HeaderRetryStore`] (default): the counter travels inside the message's
//!   own `x-retry-count` header, so it survives process restarts and is
//!   correct with any number of consumer instances.
//! - [`InMemoryRetryStore`]: a per-process map keyed by queue and correlation
//!   id. Known limitation: the count resets on restart and is not shared
//!   between instances, which delays dead-lettering indefinitely under
//!   multi-instance deployment. Only suitable for single-instance setups.

use crate::metadata::RetryMetadata;
use std::collections::HashMap;
use std::sync::Mutex;

/// Store of per-message failure counts.
///
/// `increment` must be called exactly once per failed-delivery evaluation,
/// before the retry/dead-letter decision, and the returned `new` count is the
/// one persisted with the redelivered or dead-lettered copy.
#[cfg_attr(test, mockall::automock)]
pub trait RetryStore: Send + Sync {
    /// Attempts already made for this message (0 before the first failure).
    fn current(&self, queue: &str, correlation_id: &str, metadata: &RetryMetadata) -> u32;

    /// Records one more failure; returns `(new_count, previous_count)`.
    fn increment(&self, queue: &str, correlation_id: &str, metadata: &RetryMetadata)
        -> (u32, u32);

    /// Drops tracking state once the message leaves the retry path
    /// (successful ack or move to the dead queue).
    fn remove(&self, queue: &str, correlation_id: &str);
}

/// Stateless tracker reading the count from the message's own headers.
///
/// "Incrementing" produces the count to stamp on the republished copy; there
/// is nothing to mutate in-process, which is exactly why this variant is safe
/// across restarts and multiple consumer instances.
#[derive(Debug, Default)]
pub struct HeaderRetryStore;

impl RetryStore for HeaderRetryStore {
    fn current(&self, _queue: &str, _correlation_id: &str, metadata: &RetryMetadata) -> u32 {
        metadata.retry_count
    }

    fn increment(
        &self,
        _queue: &str,
        _correlation_id: &str,
        metadata: &RetryMetadata,
    ) -> (u32, u32) {
        (metadata.retry_count + 1, metadata.retry_count)
    }

    fn remove(&self, _queue: &str, _correlation_id: &str) {}
}

/// Process-local tracker keyed by `(queue, correlation_id)`.
///
/// Access is serialized behind a mutex so overlapping evaluations cannot lose
/// an increment. See the module docs for the restart/multi-instance caveat.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    counts: Mutex<HashMap<(String, String), u32>>,
}

impl InMemoryRetryStore {
    pub fn new() -> InMemoryRetryStore {
        InMemoryRetryStore::default()
    }
}

impl RetryStore for InMemoryRetryStore {
    fn current(&self, queue: &str, correlation_id: &str, _metadata: &RetryMetadata) -> u32 {
        let counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counts
            .get(&(queue.to_owned(), correlation_id.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    fn increment(
        &self,
        queue: &str,
        correlation_id: &str,
        _metadata: &RetryMetadata,
    ) -> (u32, u32) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counts
            .entry((queue.to_owned(), correlation_id.to_owned()))
            .or_insert(0);
        let previous = *entry;
        *entry += 1;
        (*entry, previous)
    }

    fn remove(&self, queue: &str, correlation_id: &str) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counts.remove(&(queue.to_owned(), correlation_id.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_count(retry_count: u32) -> RetryMetadata {
        RetryMetadata {
            retry_count,
            ..RetryMetadata::default()
        }
    }

    #[test]
    fn header_store_reads_the_count_from_metadata() {
        let store = HeaderRetryStore;
        assert_eq!(store.current("email-service", "o-1", &meta_with_count(2)), 2);
        assert_eq!(
            store.increment("email-service", "o-1", &meta_with_count(2)),
            (3, 2)
        );
    }

    #[test]
    fn header_store_treats_a_fresh_message_as_zero() {
        let store = HeaderRetryStore;
        assert_eq!(
            store.current("email-service", "o-1", &RetryMetadata::default()),
            0
        );
    }

    #[test]
    fn in_memory_store_counts_per_key() {
        let store = InMemoryRetryStore::new();
        let meta = RetryMetadata::default();

        assert_eq!(store.increment("email-service", "o-1", &meta), (1, 0));
        assert_eq!(store.increment("email-service", "o-1", &meta), (2, 1));
        // A different queue or message is an independent counter.
        assert_eq!(store.increment("inventory-service", "o-1", &meta), (1, 0));
        assert_eq!(store.increment("email-service", "o-2", &meta), (1, 0));

        assert_eq!(store.current("email-service", "o-1", &meta), 2);
    }

    #[test]
    fn in_memory_store_remove_resets_the_key() {
        let store = InMemoryRetryStore::new();
        let meta = RetryMetadata::default();

        store.increment("email-service", "o-1", &meta);
        store.remove("email-service", "o-1");
        assert_eq!(store.current("email-service", "o-1", &meta), 0);
    }

    #[test]
    fn stores_are_swappable_behind_the_trait_object() {
        // Deployments with multiple consumer instances inject a shared store
        // instead; the policy only sees the trait.
        let mut mock = MockRetryStore::new();
        mock.expect_increment().returning(|_, _, _| (5, 4));
        mock.expect_remove().times(1).return_const(());

        let store: std::sync::Arc<dyn RetryStore> = std::sync::Arc::new(mock);
        assert_eq!(
            store.increment("email-service", "o-1", &RetryMetadata::default()),
            (5, 4)
        );
        store.remove("email-service", "o-1");
    }

    #[test]
    fn in_memory_store_forgets_everything_across_restarts() {
        // Documented limitation: a replacement instance starts counting from
        // zero even for a message that already failed, so backoff restarts
        // and dead-lettering is postponed. The header store does not have
        // this problem because the count rides in the message itself.
        let before_restart = InMemoryRetryStore::new();
        let meta = meta_with_count(2); // ignored by this store
        before_restart.increment("email-service", "o-1", &meta);
        before_restart.increment("email-service", "o-1", &meta);

        let after_restart = InMemoryRetryStore::new();
        assert_eq!(after_restart.current("email-service", "o-1", &meta), 0);

        let header_store = HeaderRetryStore;
        assert_eq!(header_store.current("email-service", "o-1", &meta), 2);
    }
}
