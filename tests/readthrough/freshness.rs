//! Cache freshness tiers and what each one does to the upstream.

use super::{FakeUpstream, builder, cache_over, cache_with, ids, single_resource};
use catalog_readthrough::{QueryShape, ReadThroughEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn fresh_entry_is_served_without_upstream_calls() {
    let fake = FakeUpstream::serving(&[1, 2, 3]);
    let cache = cache_over(&fake);
    let shape = QueryShape::new("products");

    let first = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&first.records), vec![1, 2, 3]);
    assert!(!first.cached);
    assert_eq!(fake.calls(), 1);

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(10)).await;
        let response = cache.fetch_normalized(&shape, 10).await.unwrap();
        assert!(response.cached);
        assert!(!response.breaker_engaged);
        assert_eq!(ids(&response.records), vec![1, 2, 3]);
    }
    assert_eq!(fake.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_entry_is_served_then_refreshed_in_background() {
    let fake = FakeUpstream::serving(&[1]);
    let cache = cache_over(&fake);
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    fake.serve(&[2, 3]);
    fake.set_delay(Duration::from_secs(3));
    tokio::time::advance(Duration::from_secs(120)).await;

    let started = tokio::time::Instant::now();
    let stale = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(ids(&stale.records), vec![1]);
    assert!(stale.cached);

    cache.join_background().await;
    assert_eq!(fake.calls(), 2);

    let refreshed = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&refreshed.records), vec![2, 3]);
    assert!(refreshed.cached);
    assert_eq!(fake.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_stale_hits_start_one_refresh() {
    let fake = FakeUpstream::serving(&[1]);
    let cache = cache_over(&fake);
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    fake.set_delay(Duration::from_secs(1));
    tokio::time::advance(Duration::from_secs(120)).await;

    for _ in 0..5 {
        cache.fetch_normalized(&shape, 10).await.unwrap();
    }
    assert_eq!(cache.in_flight_count(), 1);

    cache.join_background().await;
    assert_eq!(fake.calls(), 2);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_is_swallowed_and_reported() {
    let refresh_failures = Arc::new(AtomicUsize::new(0));
    let rf = Arc::clone(&refresh_failures);
    let config = builder()
        .on_refresh_failed(move |_kind| {
            rf.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let fake = FakeUpstream::serving(&[1]);
    let cache = cache_with(&fake, config, single_resource());
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    fake.fail(503);
    tokio::time::advance(Duration::from_secs(120)).await;

    let stale = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&stale.records), vec![1]);

    cache.join_background().await;
    assert_eq!(refresh_failures.load(Ordering::SeqCst), 1);
    assert_eq!(cache.consecutive_failures(), 1);

    // Still stale, still served.
    let again = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&again.records), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_fetched_synchronously() {
    let fake = FakeUpstream::serving(&[1]);
    let cache = cache_over(&fake);
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    fake.serve(&[4]);
    tokio::time::advance(Duration::from_secs(601)).await;

    let response = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&response.records), vec![4]);
    assert!(!response.cached);
    assert_eq!(fake.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_served_when_fetch_fails() {
    let fake = FakeUpstream::serving(&[1, 2]);
    let cache = cache_over(&fake);
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    fake.fail(500);
    tokio::time::advance(Duration::from_secs(700)).await;

    let degraded = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&degraded.records), vec![1, 2]);
    assert!(degraded.cached);
    assert!(!degraded.breaker_engaged);
    assert_eq!(cache.consecutive_failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_result_does_not_replace_cached_records() {
    let fake = FakeUpstream::serving(&[1, 2]);
    let cache = cache_over(&fake);
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    fake.serve(&[]);
    tokio::time::advance(Duration::from_secs(700)).await;

    let response = cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(ids(&response.records), vec![1, 2]);
    assert!(response.cached);
    assert_eq!(cache.consecutive_failures(), 0);
    assert_eq!(fake.calls(), 2);

    // The kept entry was re-stamped, so it is fresh again.
    cache.fetch_normalized(&shape, 10).await.unwrap();
    assert_eq!(fake.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn empty_result_on_cold_start_is_a_success() {
    let fake = FakeUpstream::serving(&[]);
    let cache = cache_over(&fake);

    let response = cache
        .fetch_normalized(&QueryShape::new("products"), 10)
        .await
        .unwrap();
    assert!(response.records.is_empty());
    assert!(!response.cached);
}

#[tokio::test(start_paused = true)]
async fn query_params_are_separate_entries() {
    let fake = FakeUpstream::new(|request| {
        let id = match request.query.get("search").map(String::as_str) {
            Some("kayak") => 7,
            _ => 1,
        };
        Ok(super::products(&[id]))
    });
    let cache = cache_over(&fake);

    let all = cache
        .fetch_normalized(&QueryShape::new("products"), 10)
        .await
        .unwrap();
    let kayaks = cache
        .fetch_normalized(&QueryShape::new("products").param("search", "kayak"), 10)
        .await
        .unwrap();

    assert_eq!(ids(&all.records), vec![1]);
    assert_eq!(ids(&kayaks.records), vec![7]);
    assert_eq!(fake.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_hit_events_carry_freshness() {
    let stale_hits = Arc::new(AtomicUsize::new(0));
    let sh = Arc::clone(&stale_hits);
    let config = builder()
        .on_event(move |event| {
            if let ReadThroughEvent::CacheHit { freshness, .. } = event {
                if freshness.as_str() == "stale" {
                    sh.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .build()
        .unwrap();

    let fake = FakeUpstream::serving(&[1]);
    let cache = cache_with(&fake, config, single_resource());
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    cache.fetch_normalized(&shape, 10).await.unwrap();
    tokio::time::advance(Duration::from_secs(90)).await;
    cache.fetch_normalized(&shape, 10).await.unwrap();
    cache.shutdown().await;

    assert_eq!(stale_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_reported_as_a_miss() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let config = builder()
        .on_event(move |event| match event {
            ReadThroughEvent::CacheHit { freshness, .. } => {
                log.lock().unwrap().push(format!("hit:{}", freshness.as_str()));
            }
            ReadThroughEvent::CacheMiss { expired, .. } => {
                log.lock().unwrap().push(format!("miss:{expired}"));
            }
            _ => {}
        })
        .build()
        .unwrap();

    let fake = FakeUpstream::serving(&[1]);
    let cache = cache_with(&fake, config, single_resource());
    let shape = QueryShape::new("products");

    cache.fetch_normalized(&shape, 10).await.unwrap();
    cache.fetch_normalized(&shape, 10).await.unwrap();
    tokio::time::advance(Duration::from_secs(601)).await;
    let refetched = cache.fetch_normalized(&shape, 10).await.unwrap();
    cache.shutdown().await;

    assert!(!refetched.cached);
    assert_eq!(fake.calls(), 2);
    assert_eq!(*seen.lock().unwrap(), vec!["miss:false", "hit:fresh", "miss:true"]);
}
