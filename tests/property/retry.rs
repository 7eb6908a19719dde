//! Property tests for retry backoff.
//!
//! Invariants tested:
//! - Delays never shrink from one attempt to the next
//! - Delays never exceed the configured cap
//! - The executor never makes more than `max_attempts` calls

use catalog_readthrough::{RetryExecutor, RetryPlan, UpstreamError};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Builder;

fn plan(initial_ms: u64, multiplier: f64, max_attempts: usize, cap_ms: Option<u64>) -> RetryPlan {
    RetryPlan {
        max_attempts,
        initial_delay: Duration::from_millis(initial_ms),
        backoff_multiplier: multiplier,
        per_attempt_timeout: Duration::from_secs(1),
        max_delay: cap_ms.map(Duration::from_millis),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: backoff is monotonic and capped.
    #[test]
    fn backoff_is_monotonic_and_capped(
        initial_ms in 1u64..2_000,
        multiplier in 1.0f64..4.0,
        cap_ms in prop::option::of(1u64..60_000),
    ) {
        let plan = plan(initial_ms, multiplier, 10, cap_ms);
        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = plan.delay_after(attempt);
            prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            if let Some(cap) = plan.max_delay {
                prop_assert!(delay <= cap);
            }
            previous = delay;
        }
    }

    /// Property: a failing operation is called exactly `max_attempts` times.
    #[test]
    fn attempts_are_bounded(max_attempts in 1usize..8, status in 500u16..600) {
        let rt = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&calls);
            let executor = RetryExecutor::new(plan(50, 2.0, max_attempts, None));

            let result: Result<(), _> = executor
                .execute("prop", || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async move { Err(UpstreamError::Http { status }) }
                })
                .await;

            prop_assert_eq!(result, Err(UpstreamError::Http { status }));
            prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
            Ok(())
        })?;
    }
}
