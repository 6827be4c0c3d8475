//! End-to-end scenarios against a scripted transport: dispatch ordering,
//! breaker behavior, retry timing, rate limiting and single-flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatchq::{
    join_all, BreakerState, ConfigBuilder, Coordinator, DispatchOutcome, MockTransport,
    OutcomeKind, Priority, RequestDescriptor, Scripted, TransportErrorKind,
};

fn get(url: impl Into<String>) -> RequestDescriptor {
    RequestDescriptor::get(url).build().unwrap()
}

/// Routes engine logs through the test harness; safe to call repeatedly.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn priority_bands_dictate_dispatch_order() {
    init_tracing();
    let transport = Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(60)));
    let config = ConfigBuilder::new()
        .workers(1)
        .rate_limit(10_000)
        .cache_enabled(false)
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    // Occupy the single worker so the next three queue up together.
    let plug = coordinator
        .submit(get("https://h.example.com/plug"), Priority::Critical)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let low = coordinator
        .submit(get("https://h.example.com/low"), Priority::Low)
        .unwrap();
    let critical = coordinator
        .submit(get("https://h.example.com/critical"), Priority::Critical)
        .unwrap();
    let normal = coordinator
        .submit(get("https://h.example.com/normal"), Priority::Normal)
        .unwrap();

    let outcomes = join_all(vec![plug, low, critical, normal]).await;
    assert!(outcomes.iter().all(DispatchOutcome::is_success));

    let urls: Vec<String> = transport.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(
        urls,
        vec![
            "https://h.example.com/plug",
            "https://h.example.com/critical",
            "https://h.example.com/normal",
            "https://h.example.com/low",
        ]
    );

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn breaker_trips_after_threshold_and_rejects_without_wire_calls() {
    init_tracing();
    let transport = Arc::new(MockTransport::always(500));
    let config = ConfigBuilder::new()
        .workers(1)
        .rate_limit(10_000)
        .cache_enabled(false)
        .breaker_failure_threshold(5)
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    // Five 500s open the circuit (500 is a breaker failure but not
    // retryable, so each request is exactly one attempt).
    for i in 0..5 {
        let handle = coordinator
            .submit(get(format!("https://down.example.com/{i}")), Priority::Normal)
            .unwrap();
        assert_eq!(handle.outcome().await.kind(), OutcomeKind::HttpError);
    }
    assert_eq!(transport.sent(), 5);

    let sixth = coordinator
        .submit(get("https://down.example.com/6"), Priority::Normal)
        .unwrap();
    let outcome = sixth.outcome().await;
    assert_eq!(outcome.kind(), OutcomeKind::CircuitOpen);
    assert_eq!(transport.sent(), 5, "open circuit must not reach the wire");

    // Other origins stay unaffected.
    let status = coordinator.status();
    let snapshot = status.breaker_states.get("https://down.example.com:443").unwrap();
    assert_eq!(snapshot.state, BreakerState::Open);

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn breaker_recovers_through_half_open_probes_and_counts_from_zero() {
    init_tracing();
    let transport = Arc::new(MockTransport::sequence(vec![
        Scripted::Status(500),
        Scripted::Status(500),
        Scripted::Status(200),
        Scripted::Status(200),
        Scripted::Status(500),
        Scripted::Status(500),
    ]));
    let config = ConfigBuilder::new()
        .workers(1)
        .rate_limit(10_000)
        .cache_enabled(false)
        .breaker_failure_threshold(2)
        .breaker_timeout(Duration::from_millis(200))
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    let origin = "https://flaky.example.com:443";
    for i in 0..2 {
        let handle = coordinator
            .submit(get(format!("https://flaky.example.com/a{i}")), Priority::Normal)
            .unwrap();
        handle.outcome().await;
    }
    assert_eq!(
        coordinator.status().breaker_states.get(origin).unwrap().state,
        BreakerState::Open
    );

    // Cool-down elapses; two successful probes close the circuit
    // (probe_required defaults to 2).
    tokio::time::sleep(Duration::from_millis(250)).await;
    for i in 0..2 {
        let handle = coordinator
            .submit(get(format!("https://flaky.example.com/b{i}")), Priority::Normal)
            .unwrap();
        assert!(handle.outcome().await.is_success());
    }
    assert_eq!(
        coordinator.status().breaker_states.get(origin).unwrap().state,
        BreakerState::Closed
    );

    // Failures after recovery accumulate from zero: the first leaves the
    // circuit closed, the second opens it again.
    let handle = coordinator
        .submit(get("https://flaky.example.com/c0"), Priority::Normal)
        .unwrap();
    handle.outcome().await;
    assert_eq!(
        coordinator.status().breaker_states.get(origin).unwrap().state,
        BreakerState::Closed
    );

    let handle = coordinator
        .submit(get("https://flaky.example.com/c1"), Priority::Normal)
        .unwrap();
    handle.outcome().await;
    assert_eq!(
        coordinator.status().breaker_states.get(origin).unwrap().state,
        BreakerState::Open
    );

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn retry_after_header_overrides_backoff_delay() {
    let transport = Arc::new(MockTransport::sequence(vec![
        Scripted::StatusWithHeaders(429, vec![("Retry-After".to_string(), "2".to_string())]),
        Scripted::Status(200),
    ]));
    let config = ConfigBuilder::new()
        .workers(2)
        .rate_limit(10_000)
        .cache_enabled(false)
        .max_retries(2)
        .retry_base_delay(Duration::from_millis(10))
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    let started = Instant::now();
    let handle = coordinator
        .submit(get("https://api.example.com/throttled"), Priority::Normal)
        .unwrap();
    let outcome = handle.outcome().await;
    let elapsed = started.elapsed();

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 2);
    assert_eq!(transport.sent(), 2);
    // The server-advertised 2s wins over the 10ms backoff; the upper bound
    // tolerates scheduler overhead.
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_600), "elapsed {elapsed:?}");

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn token_bucket_bounds_sustained_throughput() {
    let transport = Arc::new(MockTransport::always(200));
    let config = ConfigBuilder::new()
        .workers(25)
        .rate_limit(10)
        .cache_enabled(false)
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    // 25 requests at 10/s with a 10-token burst: the tail waits at least
    // (25 - 10) / 10 = 1.5 s.
    let started = Instant::now();
    let handles: Vec<_> = (0..25)
        .map(|i| {
            coordinator
                .submit(get(format!("https://h.example.com/{i}")), Priority::Normal)
                .unwrap()
        })
        .collect();
    let outcomes = join_all(handles).await;
    let elapsed = started.elapsed();

    assert!(outcomes.iter().all(DispatchOutcome::is_success));
    assert_eq!(transport.sent(), 25);
    assert!(elapsed >= Duration::from_millis(1_400), "elapsed {elapsed:?}");

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn identical_requests_coalesce_to_one_wire_call() {
    let transport = Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(300)));
    let config = ConfigBuilder::new()
        .workers(32)
        .rate_limit(10_000)
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    let handles: Vec<_> = (0..30)
        .map(|_| {
            coordinator
                .submit(get("https://api.example.com/hot"), Priority::Normal)
                .unwrap()
        })
        .collect();
    let outcomes = join_all(handles).await;

    assert_eq!(transport.sent(), 1, "single-flight must coalesce to one send");
    assert!(outcomes.iter().all(DispatchOutcome::is_success));
    let hits = outcomes
        .iter()
        .filter(|o| o.record().map(|r| r.cache_hit).unwrap_or(false))
        .count();
    assert_eq!(hits, 29, "everyone but the leader is a cache hit");

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn attempts_are_monotonic_and_bounded() {
    let transport = Arc::new(MockTransport::sequence(vec![
        Scripted::Status(503),
        Scripted::Status(503),
        Scripted::Status(200),
    ]));
    let config = ConfigBuilder::new()
        .workers(2)
        .rate_limit(10_000)
        .cache_enabled(false)
        .max_retries(3)
        .retry_base_delay(Duration::from_millis(10))
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    let handle = coordinator
        .submit(get("https://api.example.com/eventually"), Priority::Normal)
        .unwrap();
    let id = handle.id();
    let outcome = handle.outcome().await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(transport.calls_for(id), 3);

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn retries_exhaust_at_retry_count_plus_one_attempts() {
    let transport = Arc::new(MockTransport::failing(TransportErrorKind::Connect));
    let config = ConfigBuilder::new()
        .workers(2)
        .rate_limit(10_000)
        .cache_enabled(false)
        .max_retries(2)
        .retry_base_delay(Duration::from_millis(5))
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    let handle = coordinator
        .submit(get("https://gone.example.com/x"), Priority::Normal)
        .unwrap();
    let id = handle.id();
    let outcome = handle.outcome().await;

    assert_eq!(outcome.kind(), OutcomeKind::TransportError);
    assert_eq!(outcome.attempts(), 3, "retry_count + 1 total attempts");
    assert_eq!(transport.calls_for(id), 3);
    assert_eq!(coordinator.dead_letters().len(), 1);

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn no_descriptor_is_dispatched_twice_concurrently() {
    let transport = Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(20)));
    let config = ConfigBuilder::new()
        .workers(16)
        .rate_limit(10_000)
        .cache_enabled(false)
        .build();
    let coordinator = Coordinator::new(config, transport.clone());
    coordinator.start().unwrap();

    let handles: Vec<_> = (0..60)
        .map(|i| {
            coordinator
                .submit(get(format!("https://h.example.com/{i}")), Priority::Normal)
                .unwrap()
        })
        .collect();
    let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
    let outcomes = join_all(handles).await;

    assert!(outcomes.iter().all(DispatchOutcome::is_success));
    for id in ids {
        assert_eq!(transport.calls_for(id), 1, "exclusive ownership per descriptor");
    }

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn metrics_reflect_the_event_stream() {
    let transport = Arc::new(MockTransport::always(200));
    let config = ConfigBuilder::new()
        .workers(2)
        .rate_limit(10_000)
        .cache_enabled(false)
        .collect_interval(Duration::from_millis(20))
        .build();
    let coordinator = Coordinator::new(config, transport);
    coordinator.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            coordinator
                .submit(get(format!("https://h.example.com/{i}")), Priority::Normal)
                .unwrap()
        })
        .collect();
    join_all(handles).await;

    // Give the monitor a couple of collection cycles.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = coordinator.metrics();
    assert_eq!(metrics.counter("requests.submitted"), 4.0);
    assert_eq!(metrics.counter("requests.succeeded"), 4.0);
    assert!(metrics.summary("request.duration").is_some());
    assert!(metrics.summary("queue.wait").is_some());

    coordinator.stop(Duration::from_secs(1)).await.unwrap();
}
