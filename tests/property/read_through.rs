//! Property tests for the orchestrator over random outage schedules.
//!
//! Invariants tested:
//! - After the first successful fetch, every request gets records back
//! - A request never causes more than one upstream call

use catalog_readthrough::{
    EndpointCandidate, QueryShape, ReadThrough, ReadThroughConfig, ResourceConfig, RetryPlan,
    UpstreamError, UpstreamRequest,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Builder;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn cached_data_is_never_lost(
        schedule in prop::collection::vec((any::<bool>(), 0u64..900), 1..30),
    ) {
        let rt = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let healthy = Arc::new(AtomicBool::new(true));
            let calls = Arc::new(AtomicUsize::new(0));
            let (h, c) = (Arc::clone(&healthy), Arc::clone(&calls));
            let upstream = tower::service_fn(move |_req: UpstreamRequest| {
                c.fetch_add(1, Ordering::SeqCst);
                let up = h.load(Ordering::SeqCst);
                async move {
                    if up {
                        Ok(json!([{ "id": 1 }, { "id": 2 }]))
                    } else {
                        Err(UpstreamError::Http { status: 503 })
                    }
                }
            });

            let config = ReadThroughConfig::builder()
                .retry_plan(RetryPlan { max_attempts: 1, ..RetryPlan::default() })
                .build()
                .unwrap();
            let resources = vec![ResourceConfig::new(
                "products",
                vec![EndpointCandidate::new("all", "products")],
            )];
            let cache = ReadThrough::new(upstream, config, resources).unwrap();
            let shape = QueryShape::new("products");

            let mut seeded = false;
            for (index, (up, wait)) in schedule.into_iter().enumerate() {
                healthy.store(up, Ordering::SeqCst);
                tokio::time::advance(Duration::from_secs(wait)).await;

                let result = cache.fetch_normalized(&shape, 10).await;
                cache.join_background().await;

                if seeded {
                    let response = result.map_err(|e| TestCaseError::fail(e.to_string()))?;
                    prop_assert_eq!(response.records.len(), 2);
                } else if let Ok(response) = result {
                    seeded = !response.records.is_empty();
                }
                prop_assert!(calls.load(Ordering::SeqCst) <= index + 1);
            }
            Ok(())
        })?;
    }
}
