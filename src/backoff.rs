// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Backoff Calculator
//!
//! Maps an attempt number to the delay before the next redelivery:
//! `min(max_delay, base_delay * 2^(attempt - 1)) + jitter`, jitter uniform in
//! `0..=1000` ms so simultaneous failures don't retry in lockstep.

use crate::errors::AmqpError;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Mutex;

/// Upper bound of the uniform jitter added to every delay.
pub const JITTER_MAX_MS: u64 = 1_000;

/// Exponential backoff with jitter.
///
/// The jitter source is seeded from entropy in production; `with_seed` pins
/// it for reproducible tests.
#[derive(Debug)]
pub struct Backoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    rng: Mutex<SmallRng>,
}

impl Backoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Backoff {
        Backoff {
            base_delay_ms,
            max_delay_ms,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(base_delay_ms: u64, max_delay_ms: u64, seed: u64) -> Backoff {
        Backoff {
            base_delay_ms,
            max_delay_ms,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    /// Delay in milliseconds before redelivering attempt `attempt`.
    ///
    /// Attempts are counted starting at 1; 0 is rejected with
    /// [`AmqpError::InvalidAttempt`].
    pub fn delay_ms(&self, attempt: u32) -> Result<u64, AmqpError> {
        if attempt == 0 {
            return Err(AmqpError::InvalidAttempt(attempt));
        }

        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt - 1));
        let capped = exponential.min(self.max_delay_ms);

        let jitter = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen_range(0..=JITTER_MAX_MS);

        Ok(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_zero_is_rejected() {
        let backoff = Backoff::with_seed(1_000, 30_000, 7);
        assert_eq!(backoff.delay_ms(0), Err(AmqpError::InvalidAttempt(0)));
    }

    #[test]
    fn delay_follows_the_doubling_formula() {
        let backoff = Backoff::with_seed(1_000, 30_000, 7);

        for (attempt, expected_base) in [(1u32, 1_000u64), (2, 2_000), (3, 4_000), (4, 8_000)] {
            let delay = backoff.delay_ms(attempt).unwrap();
            assert!(
                (expected_base..=expected_base + JITTER_MAX_MS).contains(&delay),
                "attempt {attempt}: {delay} outside [{expected_base}, {}]",
                expected_base + JITTER_MAX_MS
            );
        }
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let backoff = Backoff::with_seed(1_000, 30_000, 7);

        // 2^(10-1) seconds is far past the cap.
        let delay = backoff.delay_ms(10).unwrap();
        assert!((30_000..=30_000 + JITTER_MAX_MS).contains(&delay));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let backoff = Backoff::with_seed(1_000, 30_000, 7);
        let delay = backoff.delay_ms(u32::MAX).unwrap();
        assert!((30_000..=30_000 + JITTER_MAX_MS).contains(&delay));
    }

    #[test]
    fn same_seed_yields_the_same_sequence() {
        let a = Backoff::with_seed(1_000, 30_000, 42);
        let b = Backoff::with_seed(1_000, 30_000, 42);

        for attempt in 1..=5 {
            assert_eq!(a.delay_ms(attempt).unwrap(), b.delay_ms(attempt).unwrap());
        }
    }

    #[test]
    fn expected_delay_is_non_decreasing_up_to_the_cap() {
        let backoff = Backoff::with_seed(1_000, 30_000, 9);

        let mut previous_floor = 0u64;
        for attempt in 1..=8 {
            let delay = backoff.delay_ms(attempt).unwrap();
            // The deterministic part (delay minus worst-case jitter) never
            // shrinks as attempts grow.
            let floor = delay.saturating_sub(JITTER_MAX_MS);
            assert!(floor >= previous_floor, "attempt {attempt} went backwards");
            previous_floor = floor;
        }
    }
}
