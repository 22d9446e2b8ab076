//! Behavior-driven tests for rate resolution.
//!
//! These tests verify HOW the resolver combines the cache, retries and
//! alerting when the remote source is healthy, flaky or down.

use std::sync::Arc;
use std::time::Duration;

use ratekeep_tests::*;
use rust_decimal_macros::dec;
use tokio::time::Instant;

// =============================================================================
// Cache interaction
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_live_entry_exists_resolver_never_calls_remote() {
    // Given: A cache holding a fresh rate
    let (cache, backend) = memory_cache();
    backend
        .put(DEFAULT_CACHE_KEY, CachedValue::Text(String::from("0.10")), Duration::from_secs(60))
        .await
        .expect("seed");
    let source = Arc::new(ScriptedSource::healthy(rate("0.99")));
    let resolver = Resolver::builder(source.clone()).cache(cache).build();

    // When: The rate is resolved
    let resolved = resolver.resolve().await.expect("cache hit");

    // Then: The cached rate is returned without a remote call
    assert_eq!(resolved, rate("0.10"));
    assert_eq!(source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn when_remote_recovers_before_the_budget_runs_out_cache_is_written_once() {
    // Given: A source that fails twice, then succeeds
    let (cache, backend) = memory_cache();
    let source = Arc::new(ScriptedSource::new(vec![
        Err(RateError::transient("503")),
        Err(RateError::transient("timeout")),
        Ok(rate("0.12")),
    ]));
    let publisher = Arc::new(RecordingPublisher::default());
    let resolver = Resolver::builder(source.clone())
        .cache(cache)
        .retry(three_attempts())
        .publisher(publisher.clone())
        .build();

    // When: The rate is resolved
    let started = Instant::now();
    let resolved = resolver.resolve().await.expect("third attempt succeeds");
    let elapsed = started.elapsed();

    // Then: The backoff waited 1s then 2s, the cache holds the rate, no alert fired
    assert_eq!(resolved, rate("0.12"));
    assert_eq!(source.calls(), 3);
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");
    assert!(publisher.events().is_empty());

    let stored = backend.get(DEFAULT_CACHE_KEY).await.expect("get").expect("entry written");
    assert_eq!(stored.value.coerce().expect("coerce"), rate("0.12"));
    assert_eq!(backend.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn when_every_attempt_fails_caller_sees_unavailability_and_one_alert() {
    // Given: A source that is down and an empty cache
    let source = Arc::new(ScriptedSource::failing());
    let publisher = Arc::new(RecordingPublisher::default());
    let resolver = Resolver::builder(source.clone())
        .retry(three_attempts())
        .publisher(publisher.clone())
        .build();

    // When: The rate is resolved
    let error = resolver.resolve().await.expect_err("remote down");

    // Then: Exactly three calls, one event, and the terminal error names them
    assert_eq!(source.calls(), 3);
    assert!(matches!(error, RateError::RemoteUnavailable { attempts: 3, .. }), "{error:?}");

    let events = publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].attempts, 3);
    assert_eq!(events[0].source_identifier, "rate-api");
    assert!(events[0].error_message.starts_with("Failed to fetch percentage after 3 attempts"));
}

#[tokio::test(start_paused = true)]
async fn when_remote_rejects_the_request_resolver_stops_at_once() {
    // Given: A source answering with a terminal error
    let source = Arc::new(ScriptedSource::new(vec![]).with_fallback(Err(RateError::terminal("404 Not Found"))));
    let publisher = Arc::new(RecordingPublisher::default());
    let resolver = Resolver::builder(source.clone())
        .retry(three_attempts())
        .publisher(publisher.clone())
        .build();

    // When: The rate is resolved
    let error = resolver.resolve().await.expect_err("terminal");

    // Then: No further attempts and no alert
    assert_eq!(source.calls(), 1);
    assert!(matches!(error, RateError::RemoteUnavailable { attempts: 1, .. }), "{error:?}");
    assert!(publisher.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn when_the_cache_backend_is_down_the_remote_rate_is_still_returned() {
    // Given: A cache whose reads and writes both fail, and a healthy source
    let (cache, backend) = broken_cache();
    let source = Arc::new(ScriptedSource::healthy(rate("0.12")));
    let resolver = Resolver::builder(source.clone()).cache(cache).build();

    // When: The rate is resolved
    let resolved = resolver.resolve().await.expect("remote rate despite cache failures");

    // Then: The remote was called once and the failing cache was tried both ways
    assert_eq!(resolved, rate("0.12"));
    assert_eq!(source.calls(), 1);
    assert_eq!(backend.reads(), 1);
    assert_eq!(backend.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn when_both_cache_and_remote_are_down_caller_sees_unavailability() {
    // Given: A failing cache and a source that is down
    let (cache, _backend) = broken_cache();
    let source = Arc::new(ScriptedSource::failing());
    let resolver = Resolver::builder(source.clone())
        .cache(cache)
        .retry(RetryConfig::no_retry())
        .build();

    // When: The rate is resolved
    let error = resolver.resolve().await.expect_err("nothing to serve");

    // Then: The stale read failure does not mask the remote outage
    assert!(matches!(error, RateError::RemoteUnavailable { .. }), "{error:?}");
    assert_eq!(source.calls(), 1);
}

// =============================================================================
// Stale fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_remote_is_down_an_expired_entry_is_served() {
    // Given: An entry that has outlived its TTL and a failing source
    let (cache, backend) = memory_cache();
    backend
        .put(DEFAULT_CACHE_KEY, CachedValue::Decimal(dec!(0.08)), Duration::from_secs(1))
        .await
        .expect("seed");
    tokio::time::advance(Duration::from_secs(2)).await;

    let source = Arc::new(ScriptedSource::failing());
    let resolver = Resolver::builder(source.clone())
        .cache(cache)
        .retry(three_attempts())
        .build();

    // When: The rate is resolved
    let resolved = resolver.resolve().await.expect("stale fallback");

    // Then: The remote was tried in full, then the stale rate was served
    assert_eq!(source.calls(), 3);
    assert_eq!(resolved, rate("0.08"));
}

#[tokio::test(start_paused = true)]
async fn when_bypassing_the_cache_no_stale_rate_is_served() {
    // Given: An expired entry and a failing source
    let (cache, backend) = memory_cache();
    backend
        .put(DEFAULT_CACHE_KEY, CachedValue::Decimal(dec!(0.08)), Duration::from_secs(1))
        .await
        .expect("seed");
    tokio::time::advance(Duration::from_secs(2)).await;
    let resolver = Resolver::builder(Arc::new(ScriptedSource::failing()))
        .cache(cache)
        .retry(RetryConfig::no_retry())
        .build();

    // When: The rate is resolved in bypass mode
    let error = resolver.resolve_with(CacheMode::Bypass).await.expect_err("no fallback");

    // Then: Unavailability surfaces
    assert!(matches!(error, RateError::RemoteUnavailable { .. }));
}

// =============================================================================
// Stored representations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn every_stored_representation_of_fifteen_percent_resolves_exactly() {
    let representations = [
        CachedValue::Text(String::from("0.15")),
        CachedValue::Float(0.15),
        CachedValue::Decimal(dec!(0.15)),
    ];

    for stored in representations {
        // Given: The cache holds 0.15 in one representation
        let (cache, backend) = memory_cache();
        backend
            .put(DEFAULT_CACHE_KEY, stored.clone(), Duration::from_secs(60))
            .await
            .expect("seed");
        let resolver = Resolver::builder(Arc::new(ScriptedSource::failing())).cache(cache).build();

        // When: The rate is resolved
        let resolved = resolver.resolve().await.expect("cache hit");

        // Then: It is exactly 0.15
        assert_eq!(resolved.as_decimal(), dec!(0.15), "stored as {}", stored.kind());
    }
}

// =============================================================================
// Alert delivery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_retries_are_exhausted_one_message_reaches_the_alert_topic() {
    // Given: A failing source publishing through an in-memory channel
    let channel = Arc::new(MemoryAlertChannel::new());
    let publisher = Arc::new(ChannelPublisher::new(channel.clone(), DEFAULT_TOPIC));
    let resolver = Resolver::builder(Arc::new(ScriptedSource::failing()))
        .retry(three_attempts())
        .publisher(publisher.clone())
        .build();

    // When: The rate is resolved and pending publishes settle
    let _ = resolver.resolve().await;
    publisher.flush().await;

    // Then: Exactly one message with the wire attempts field "3"
    let deliveries = channel.poll(DEFAULT_TOPIC, 10).await.expect("poll");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].message.attempts, "3");
    assert_eq!(deliveries[0].message.source, "rate-api");
    assert!(deliveries[0].message.error.contains("after 3 attempts"));
}
