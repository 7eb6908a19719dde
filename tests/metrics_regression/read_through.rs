//! Read-through metrics regression tests

use super::helpers::*;
use catalog_readthrough::{
    EndpointCandidate, QueryShape, ReadThrough, ReadThroughConfig, ResourceConfig, UpstreamError,
    UpstreamRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const NAME: &str = "metrics_catalog";

#[tokio::test(start_paused = true)]
async fn read_through_counters_and_labels() {
    init_recorder();

    let healthy = Arc::new(AtomicBool::new(true));
    let h = Arc::clone(&healthy);
    let upstream = tower::service_fn(move |_req: UpstreamRequest| {
        let up = h.load(Ordering::SeqCst);
        async move {
            if up {
                Ok(json!([{ "id": 1, "status": "publish" }]))
            } else {
                Err(UpstreamError::Http { status: 503 })
            }
        }
    });
    let config = ReadThroughConfig::builder()
        .name(NAME)
        .fresh_window(Duration::from_secs(60))
        .max_serve_window(Duration::from_secs(600))
        .failure_threshold(2)
        .cooldown(Duration::from_secs(30))
        .max_attempts(2)
        .initial_delay(Duration::from_millis(100))
        .build()
        .unwrap();
    let resources = vec![ResourceConfig::new(
        "products",
        vec![EndpointCandidate::new("all", "products")],
    )];
    let cache = ReadThrough::new(upstream, config, resources).unwrap();
    let shape = QueryShape::new("products");

    // Cold fetch, then a fresh hit.
    cache.fetch_normalized(&shape, 10).await.unwrap();
    cache.fetch_normalized(&shape, 10).await.unwrap();

    // Stale hit with a background refresh.
    tokio::time::advance(Duration::from_secs(120)).await;
    cache.fetch_normalized(&shape, 10).await.unwrap();
    cache.join_background().await;

    // Expired entry, failing upstream: two degraded answers trip the breaker.
    healthy.store(false, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(601)).await;
    assert!(cache.fetch_normalized(&shape, 10).await.unwrap().cached);
    assert!(cache.fetch_normalized(&shape, 10).await.unwrap().cached);

    // Open circuit: bypassed.
    assert!(cache.fetch_normalized(&shape, 10).await.unwrap().breaker_engaged);

    // Cooldown over: the probe succeeds and closes the circuit.
    healthy.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(31)).await;
    let recovered = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert!(!recovered.cached);
    cache.shutdown().await;

    let snapshot = snapshot();
    let requests = |outcome| {
        counter_value(
            &snapshot,
            "readthrough_requests_total",
            &[("readthrough", NAME), ("outcome", outcome)],
        )
    };
    assert_eq!(requests("fetched"), 2);
    assert_eq!(requests("fresh"), 1);
    assert_eq!(requests("stale"), 1);
    assert_eq!(requests("degraded"), 2);
    assert_eq!(requests("bypassed"), 1);
    assert_eq!(requests("error"), 0);

    let fetches = |outcome| {
        counter_value(
            &snapshot,
            "readthrough_upstream_fetches_total",
            &[("readthrough", NAME), ("outcome", outcome)],
        )
    };
    assert_eq!(fetches("success"), 3);
    assert_eq!(fetches("failure"), 2);

    let transitions = |to| {
        counter_value(
            &snapshot,
            "readthrough_circuit_transitions_total",
            &[("readthrough", NAME), ("to", to)],
        )
    };
    assert_eq!(transitions("open"), 1);
    assert_eq!(transitions("closed"), 1);

    // One retry per failed chain run.
    assert_eq!(
        counter_value(&snapshot, "readthrough_retries_total", &[("readthrough", NAME)]),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn cold_start_failure_counts_as_error() {
    init_recorder();

    let name = "metrics_cold_start";
    let upstream = tower::service_fn(|_req: UpstreamRequest| async {
        Err::<serde_json::Value, _>(UpstreamError::Http { status: 500 })
    });
    let config = ReadThroughConfig::builder()
        .name(name)
        .max_attempts(1)
        .build()
        .unwrap();
    let resources = vec![ResourceConfig::new(
        "products",
        vec![EndpointCandidate::new("all", "products")],
    )];
    let cache = ReadThrough::new(upstream, config, resources).unwrap();

    let err = cache
        .fetch_normalized(&QueryShape::new("products"), 10)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 500);

    let snapshot = snapshot();
    assert_eq!(
        counter_value(
            &snapshot,
            "readthrough_requests_total",
            &[("readthrough", name), ("outcome", "error")]
        ),
        1
    );
    assert_eq!(
        counter_value(
            &snapshot,
            "readthrough_upstream_fetches_total",
            &[("readthrough", name), ("outcome", "failure")]
        ),
        1
    );
    assert_eq!(
        counter_value(&snapshot, "readthrough_retries_total", &[("readthrough", name)]),
        0
    );
}
