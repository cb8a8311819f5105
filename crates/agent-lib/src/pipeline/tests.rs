//! Cross-component tests for sample delivery

use super::*;
use crate::models::{DeviceId, SourceProtocol};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

fn pipeline(capacity: usize, timeout_ms: u64) -> Pipeline {
    Pipeline::new(
        BusConfig {
            capacity,
            publish_timeout: Duration::from_millis(timeout_ms),
        },
        CollectorMetrics::new(),
        StructuredLogger::new("test-node"),
    )
}

fn samples(device: &str, range: std::ops::Range<u32>) -> Vec<Sample> {
    range
        .map(|i| {
            Sample::new(
                DeviceId::from(device),
                "if.in_octets",
                f64::from(i),
                Utc::now(),
                SourceProtocol::Snmp,
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_device_order_survives_concurrent_producers() {
    let pipeline = pipeline(10_000, 1_000);
    let mut scoring = pipeline.subscribe("scoring");
    let mut caching = pipeline.subscribe("caching");

    let mut handles = Vec::new();
    for d in 0..8 {
        let sink = pipeline.sink();
        handles.push(tokio::spawn(async move {
            let device = format!("dev-{}", d);
            // Several emits per device, like successive poll cycles.
            for chunk in 0..10u32 {
                sink.emit(samples(&device, chunk * 10..chunk * 10 + 10)).await;
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for sub in [&mut scoring, &mut caching] {
        let mut last: HashMap<DeviceId, f64> = HashMap::new();
        let mut seen = 0;
        while let Some(sample) = sub.try_recv() {
            if let Some(prev) = last.insert(sample.device.clone(), sample.value) {
                assert!(sample.value > prev, "out of order for {}", sample.device);
            }
            seen += 1;
        }
        assert_eq!(seen, 800);
    }
    assert_eq!(pipeline.counters().samples_dropped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_key_timestamps_never_regress() {
    let pipeline = pipeline(10_000, 1_000);
    let mut scoring = pipeline.subscribe("scoring");
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    // Syslog over UDP and TCP for one host race on the same key.
    let mut handles = Vec::new();
    for producer in 0..4i64 {
        let sink = pipeline.sink();
        handles.push(tokio::spawn(async move {
            for i in 0..200i64 {
                let at = base + chrono::Duration::seconds(i * 10 + producer * 3);
                let sample = Sample::new(
                    DeviceId::from("edge-7"),
                    "syslog.local0",
                    (producer * 1000 + i) as f64,
                    at,
                    SourceProtocol::Syslog,
                );
                sink.emit(vec![sample]).await;
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut received = Vec::new();
    while let Some(sample) = scoring.try_recv() {
        received.push(sample);
    }
    assert_eq!(received.len(), 800);
    for pair in received.windows(2) {
        assert!(
            pair[1].timestamp >= pair[0].timestamp,
            "timestamp went from {} to {}",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }

    // The cache holds what was delivered last.
    let last = received.last().unwrap();
    let cached = pipeline
        .cache()
        .get(&"edge-7".into(), "syslog.local0")
        .unwrap();
    assert_eq!(cached.value, last.value);
    assert_eq!(cached.timestamp, last.timestamp);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_consumer_bounds_producer_time() {
    let pipeline = pipeline(4, 20);
    let _stalled = pipeline.subscribe("stalled");
    let sink = pipeline.sink();

    let started = Instant::now();
    let report = sink.emit(samples("r1", 0..10)).await;

    assert_eq!(report.produced, 10);
    assert_eq!(report.dropped, 6);
    // Each dropped sample waited at most one publish timeout.
    assert!(started.elapsed() <= Duration::from_millis(6 * 20));

    let counters = pipeline.counters();
    assert_eq!(counters.samples_produced, 10);
    assert_eq!(counters.samples_delivered, 4);
    assert_eq!(counters.samples_dropped, 6);
}

#[tokio::test(start_paused = true)]
async fn test_cache_is_updated_even_when_bus_drops() {
    let pipeline = pipeline(1, 5);
    let _stalled = pipeline.subscribe("stalled");
    let sink = pipeline.sink();

    sink.emit(samples("r1", 0..3)).await;

    let cached = pipeline.cache().get(&"r1".into(), "if.in_octets").unwrap();
    assert_eq!(cached.value, 2.0);
    assert_eq!(pipeline.cache().len(), 1);
}

#[tokio::test]
async fn test_emit_after_close_stops_quietly() {
    let pipeline = pipeline(4, 5);
    let mut sub = pipeline.subscribe("scoring");
    pipeline.close();

    let report = pipeline.sink().emit(samples("r1", 0..2)).await;
    assert_eq!(report.dropped, 0);
    assert!(sub.recv().await.is_none());
}
