mod common;

use common::{Reply, ScriptedTransport};
use lifeguard::telemetry::{BreakerEvent, CallEvent, MemorySink, PolicyEvent};
use lifeguard::{
    CallError, CallExecutor, CircuitBreakerRegistry, CircuitState, ManualClock, MapConfigSource,
    PropertyResolver, Rejection,
};
use std::sync::Arc;
use std::time::Duration;

fn registry(source: MapConfigSource) -> Arc<CircuitBreakerRegistry> {
    Arc::new(CircuitBreakerRegistry::from_source(source))
}

fn fallback(_err: CallError) -> Result<Vec<u8>, CallError> {
    Ok(b"fallback".to_vec())
}

#[tokio::test(start_paused = true)]
async fn quotes_recovers_within_retry_budget() {
    let transport = Arc::new(ScriptedTransport::new([
        Reply::Status(500, "boom"),
        Reply::Status(500, "boom"),
        Reply::Status(500, "boom"),
        Reply::Status(200, "ok"),
    ]));
    let executor = CallExecutor::new(registry(MapConfigSource::new()), transport.clone())
        .with_retries(3);

    let started = tokio::time::Instant::now();
    let body = executor
        .execute("quotes", "http://quotes-service:8080/api/quote", "GET", fallback)
        .await
        .unwrap();

    assert_eq!(body, b"ok".to_vec());
    assert_eq!(transport.calls(), 4);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310),
        "three constant 100ms pauses, got {elapsed:?}"
    );
    assert_eq!(transport.urls()[0], "GET http://quotes-service:8080/api/quote");
    assert!(!executor.registry().is_open("quotes"));
}

#[tokio::test]
async fn open_breaker_never_contacts_transport() {
    let source = MapConfigSource::new().with("hystrix.command.images.RequestVolumeThreshold", 1);
    let reg = registry(source);
    reg.configure(["images"]).unwrap();
    reg.record_outcome("images", false).unwrap();
    assert!(reg.is_open("images"));

    let transport = Arc::new(ScriptedTransport::new([]));
    let executor = CallExecutor::new(reg, transport.clone());
    let body = executor
        .execute("images", "http://imageservice:7777/file/cake.jpg", "GET", |err| {
            assert!(matches!(err, CallError::Rejected(Rejection::CircuitOpen { .. })));
            Ok(b"default.jpg".to_vec())
        })
        .await
        .unwrap();

    assert_eq!(body, b"default.jpg".to_vec());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_stops_waiting_after_breaker_timeout() {
    let source = MapConfigSource::new().with("hystrix.command.slow.Timeout", 250);
    let transport =
        Arc::new(ScriptedTransport::always(Reply::Slow(Duration::from_secs(2), 200, "late")));
    let executor = CallExecutor::new(registry(source), transport.clone()).with_retries(0);

    let started = tokio::time::Instant::now();
    let body = executor
        .execute("slow", "http://slow", "GET", |err| {
            assert!(err.is_timeout(), "unexpected error: {err}");
            Ok(b"fallback".to_vec())
        })
        .await
        .unwrap();

    assert_eq!(body, b"fallback".to_vec());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(260));
    let breaker = executor.registry().breaker("slow").unwrap();
    assert_eq!(breaker.in_flight(), 0, "slot released when the caller gives up");
    assert_eq!(breaker.snapshot().error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_rejects_extra_callers() {
    let source = MapConfigSource::new().with("hystrix.command.pdf.MaxConcurrentRequests", 2);
    let transport =
        Arc::new(ScriptedTransport::always(Reply::Slow(Duration::from_millis(500), 200, "pdf")));
    let executor = Arc::new(CallExecutor::new(registry(source), transport.clone()));

    let mut holders = Vec::new();
    for _ in 0..2 {
        let executor = executor.clone();
        holders.push(tokio::spawn(async move {
            executor.execute("pdf", "http://pdf", "GET", fallback).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(executor.registry().breaker("pdf").unwrap().in_flight(), 2);

    let rejected = executor
        .execute("pdf", "http://pdf", "GET", |err| {
            assert!(matches!(
                err.rejection(),
                Some(Rejection::MaxConcurrency { in_flight: 2, max: 2 })
            ));
            Ok(b"busy".to_vec())
        })
        .await
        .unwrap();
    assert_eq!(rejected, b"busy".to_vec());
    assert!(!executor.registry().is_open("pdf"), "backpressure is not failure");

    for holder in holders {
        assert_eq!(holder.await.unwrap().unwrap(), b"pdf".to_vec());
    }
    assert_eq!(transport.calls(), 2);
    assert_eq!(executor.registry().breaker("pdf").unwrap().in_flight(), 0);
}

#[tokio::test]
async fn failures_trip_breaker_and_probe_closes_it() {
    let source = MapConfigSource::new()
        .with("hystrix.command.accounts.RequestVolumeThreshold", 3)
        .with("hystrix.command.accounts.SleepWindow", 1_000);
    let clock = ManualClock::new();
    let reg = Arc::new(CircuitBreakerRegistry::with_clock(
        PropertyResolver::new(source),
        Arc::new(clock.clone()),
    ));
    let transport = Arc::new(ScriptedTransport::new([
        Reply::Fail("connection refused"),
        Reply::Fail("connection refused"),
        Reply::Fail("connection refused"),
    ]));
    let sink = MemorySink::new();
    let executor = CallExecutor::new(reg, transport.clone()).with_retries(0).with_sink(sink.clone());

    for _ in 0..3 {
        let body = executor.execute("accounts", "http://accounts", "GET", fallback).await;
        assert_eq!(body.unwrap(), b"fallback".to_vec());
    }
    assert_eq!(executor.registry().state("accounts"), Some(CircuitState::Open));

    let body = executor.execute("accounts", "http://accounts", "GET", fallback).await;
    assert_eq!(body.unwrap(), b"fallback".to_vec());
    assert_eq!(transport.calls(), 3, "open breaker short-circuits");

    clock.advance(1_000);
    let body = executor.execute("accounts", "http://accounts", "GET", fallback).await;
    assert_eq!(body.unwrap(), b"ok".to_vec());
    assert_eq!(executor.registry().state("accounts"), Some(CircuitState::Closed));

    let events = sink.events();
    let breaker_events: Vec<&BreakerEvent> = events
        .iter()
        .filter_map(|e| match e {
            PolicyEvent::Breaker(b) => Some(b),
            PolicyEvent::Call(_) => None,
        })
        .collect();
    assert!(matches!(breaker_events[0], BreakerEvent::Opened { request_count: 3, .. }));
    assert_eq!(breaker_events[1], &BreakerEvent::HalfOpen { name: "accounts".into() });
    assert_eq!(breaker_events[2], &BreakerEvent::Closed { name: "accounts".into() });
    assert!(events
        .iter()
        .any(|e| matches!(e, PolicyEvent::Call(CallEvent::Rejected { name, .. }) if name == "accounts")));
}

#[tokio::test]
async fn call_without_fallback_surfaces_error() {
    let transport = Arc::new(ScriptedTransport::always(Reply::Status(503, "unavailable")));
    let executor = CallExecutor::new(registry(MapConfigSource::new()), transport.clone())
        .with_retries(1)
        .with_retry_delay(Duration::ZERO);
    let err = executor.call("vip", "http://vip", "GET").await.unwrap_err();
    assert_eq!(err, CallError::Status { status: 503 });
    assert_eq!(transport.calls(), 2);
}
