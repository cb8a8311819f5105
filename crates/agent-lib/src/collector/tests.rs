//! Scheduler scenarios driven by a manual clock and scripted pollers

use super::*;
use crate::error::ErrorKind;
use crate::models::{Device, DeviceId, DeviceKind, HealthState, Sample};
use crate::observability::{CollectorMetrics, StructuredLogger};
use crate::pipeline::{BusConfig, Pipeline};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Succeed(usize),
    SucceedAfter(Duration, usize),
    Fail(ErrorKind),
    Hang,
    Panic,
}

/// Poller whose answer per device is fixed up front
struct ScriptedPoller {
    behaviors: HashMap<DeviceId, Behavior>,
    fallback: Behavior,
    timeout: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedPoller {
    fn new(fallback: Behavior, timeout: Duration) -> Self {
        Self {
            behaviors: HashMap::new(),
            fallback,
            timeout,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(DeviceId::from(id), behavior);
        self
    }
}

/// Decrements the active count even when a poll is cancelled
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Poller for ScriptedPoller {
    fn protocol(&self) -> SourceProtocol {
        SourceProtocol::Snmp
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn poll(&self, device: &Device) -> Result<Vec<Sample>, PollError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let behavior = self
            .behaviors
            .get(&device.id)
            .copied()
            .unwrap_or(self.fallback);
        let samples = |count: usize| {
            (0..count)
                .map(|i| {
                    Sample::new(
                        device.id.clone(),
                        format!("metric.{}", i),
                        i as f64,
                        Utc::now(),
                        SourceProtocol::Snmp,
                    )
                })
                .collect::<Vec<_>>()
        };

        match behavior {
            Behavior::Succeed(count) => Ok(samples(count)),
            Behavior::SucceedAfter(delay, count) => {
                tokio::time::sleep(delay).await;
                Ok(samples(count))
            }
            Behavior::Fail(ErrorKind::AuthError) => Err(PollError::Auth("bad community".into())),
            Behavior::Fail(ErrorKind::ProtocolError) => Err(PollError::Protocol("garbage".into())),
            Behavior::Fail(ErrorKind::Unreachable) => Err(PollError::Unreachable(
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            )),
            Behavior::Fail(ErrorKind::Timeout) => Err(PollError::Timeout),
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("poller bug"),
        }
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn device(id: &str, interval_secs: u64) -> Device {
    Device::new(id, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), DeviceKind::Router)
        .with_interval(Duration::from_secs(interval_secs))
}

struct Harness {
    registry: DeviceRegistry,
    pipeline: Pipeline,
    clock: Arc<ManualClock>,
    poller: Arc<ScriptedPoller>,
    scheduler: Scheduler,
}

async fn harness(poller: ScriptedPoller, devices: Vec<Device>, workers: usize) -> Harness {
    let registry = DeviceRegistry::default();
    for device in devices {
        registry.add(device, t0()).await;
    }
    let pipeline = Pipeline::new(
        BusConfig::default(),
        CollectorMetrics::new(),
        StructuredLogger::new("test-node"),
    );
    let clock = Arc::new(ManualClock::new(t0()));
    let poller = Arc::new(poller);
    let scheduler = SchedulerBuilder::new()
        .registry(registry.clone())
        .poller(poller.clone())
        .sink(pipeline.sink())
        .clock(clock.clone())
        .logger(StructuredLogger::new("test-node"))
        .worker_pool_size(workers)
        .build()
        .unwrap();

    Harness {
        registry,
        pipeline,
        clock,
        poller,
        scheduler,
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_timeouts_through_scheduler() {
    let mut h = harness(
        ScriptedPoller::new(Behavior::Hang, Duration::from_secs(2)),
        vec![device("R1", 5)],
        4,
    )
    .await;
    let id = DeviceId::from("R1");

    let expected = [
        (HealthState::Degraded, 10),
        (HealthState::Degraded, 20),
        (HealthState::Unreachable, 40),
    ];
    for (health, interval) in expected {
        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched, 1);
        h.scheduler.drain().await;

        let status = h.registry.status(&id).await.unwrap();
        assert_eq!(status.health, health);
        assert_eq!(status.interval_secs, interval);
        assert_eq!(status.last_error, Some(ErrorKind::Timeout));
        assert_eq!(status.poll_state, PollState::Idle);

        // Nothing is due until the backoff has elapsed.
        assert_eq!(h.scheduler.tick().await.dispatched, 0);
        h.clock.set(status.next_poll_time);
    }

    assert_eq!(h.pipeline.counters().polls_failed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_does_not_delay_others() {
    let poller = ScriptedPoller::new(Behavior::Succeed(2), Duration::from_secs(30))
        .with("slow", Behavior::Hang);
    let mut h = harness(poller, vec![device("slow", 5), device("fast", 5)], 4).await;
    let mut subscription = h.pipeline.subscribe("test");

    let report = h.scheduler.tick().await;
    assert_eq!(report.dispatched, 2);

    let first = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.device.as_str(), "fast");

    let fast = h.registry.status(&"fast".into()).await.unwrap();
    assert_eq!(fast.health, HealthState::Healthy);
    let slow = h.registry.status(&"slow".into()).await.unwrap();
    assert_eq!(slow.poll_state, PollState::Polling);

    h.scheduler.drain().await;
    let slow = h.registry.status(&"slow".into()).await.unwrap();
    assert_eq!(slow.last_error, Some(ErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_poll_is_skipped() {
    let mut h = harness(
        ScriptedPoller::new(Behavior::Hang, Duration::from_secs(30)),
        vec![device("r1", 1)],
        4,
    )
    .await;

    assert_eq!(h.scheduler.tick().await.dispatched, 1);
    h.clock.advance(Duration::from_secs(5));

    let report = h.scheduler.tick().await;
    assert_eq!(report.due, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.scheduler.in_flight(), 1);
    assert_eq!(h.pipeline.counters().polls_skipped, 1);

    h.scheduler.drain().await;
    assert_eq!(h.poller.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_bounds_concurrency() {
    let devices = (0..6).map(|i| device(&format!("d{}", i), 60)).collect();
    let mut h = harness(
        ScriptedPoller::new(
            Behavior::SucceedAfter(Duration::from_secs(1), 1),
            Duration::from_secs(10),
        ),
        devices,
        2,
    )
    .await;

    let first = h.scheduler.tick().await;
    assert_eq!(first.dispatched, 2);
    assert_eq!(first.deferred, 4);

    // Deferred devices stay due and go out as slots free up.
    for _ in 0..2 {
        h.scheduler.drain().await;
        assert_eq!(h.scheduler.tick().await.dispatched, 2);
    }
    h.scheduler.drain().await;

    assert_eq!(h.poller.calls.load(Ordering::SeqCst), 6);
    assert_eq!(h.poller.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(h.pipeline.counters().polls_succeeded, 6);
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_jumps_neither_stall_nor_burst() {
    let mut h = harness(
        ScriptedPoller::new(Behavior::Succeed(1), Duration::from_secs(5)),
        vec![device("a", 10), device("b", 30)],
        4,
    )
    .await;
    let secs = chrono::Duration::seconds;

    assert_eq!(h.scheduler.tick().await.dispatched, 2);
    h.scheduler.drain().await;

    // Backwards: nothing is due, nothing breaks.
    h.clock.set(t0() - chrono::Duration::hours(1));
    let report = h.scheduler.tick().await;
    assert_eq!((report.due, report.dispatched), (0, 0));

    // Catching up makes the device due again.
    h.clock.set(t0() + secs(9));
    assert_eq!(h.scheduler.tick().await.dispatched, 0);
    h.clock.set(t0() + secs(10));
    assert_eq!(h.scheduler.tick().await.dispatched, 1);

    // The clock steps back while the poll is running.
    h.clock.set(t0() - secs(60));
    h.scheduler.drain().await;
    let a = h.registry.status(&"a".into()).await.unwrap();
    assert_eq!(a.next_poll_time, t0() - secs(50));
    assert_eq!(h.scheduler.tick().await.dispatched, 0);
    h.clock.set(t0() - secs(50));
    assert_eq!(h.scheduler.tick().await.dispatched, 1);
    h.scheduler.drain().await;

    // Forwards by a day: one poll per device, no backlog of missed intervals.
    h.clock.set(t0() + chrono::Duration::days(1));
    let report = h.scheduler.tick().await;
    assert_eq!(report.dispatched, 2);
    h.scheduler.drain().await;
    assert_eq!(h.scheduler.tick().await.dispatched, 0);
    h.scheduler.drain().await;

    assert_eq!(h.poller.calls.load(Ordering::SeqCst), 6);
    assert_eq!(h.pipeline.counters().polls_succeeded, 6);
    for id in ["a", "b"] {
        let status = h.registry.status(&id.into()).await.unwrap();
        assert_eq!(status.health, HealthState::Healthy);
        assert_eq!(status.poll_state, PollState::Idle);
        assert!(status.next_poll_time > t0() + chrono::Duration::days(1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_parks_device() {
    let mut h = harness(
        ScriptedPoller::new(Behavior::Fail(ErrorKind::AuthError), Duration::from_secs(5)),
        vec![device("r1", 5)],
        4,
    )
    .await;

    h.scheduler.tick().await;
    h.scheduler.drain().await;

    let status = h.registry.status(&"r1".into()).await.unwrap();
    assert_eq!(status.health, HealthState::Unreachable);
    assert_eq!(status.last_error, Some(ErrorKind::AuthError));
    assert_eq!(status.interval_secs, 300);

    h.clock.advance(Duration::from_secs(299));
    assert_eq!(h.scheduler.tick().await.dispatched, 0);
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.scheduler.tick().await.dispatched, 1);
    h.scheduler.drain().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_device_does_not_affect_others() {
    let poller = ScriptedPoller::new(Behavior::Succeed(1), Duration::from_secs(5))
        .with("broken", Behavior::Fail(ErrorKind::ProtocolError));
    let mut h = harness(poller, vec![device("broken", 5), device("ok", 5)], 4).await;

    for _ in 0..3 {
        h.scheduler.tick().await;
        h.scheduler.drain().await;
        h.clock.advance(Duration::from_secs(5));
    }

    let ok = h.registry.status(&"ok".into()).await.unwrap();
    assert_eq!(ok.health, HealthState::Healthy);
    assert_eq!(ok.consecutive_failures, 0);
    assert_eq!(ok.interval_secs, 5);

    let broken = h.registry.status(&"broken".into()).await.unwrap();
    assert_eq!(broken.last_error, Some(ErrorKind::ProtocolError));
    assert!(broken.consecutive_failures >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_poll_returns_device_to_idle() {
    let mut h = harness(
        ScriptedPoller::new(Behavior::Panic, Duration::from_secs(5)),
        vec![device("r1", 5)],
        4,
    )
    .await;

    assert_eq!(h.scheduler.tick().await.dispatched, 1);
    h.scheduler.drain().await;

    let id = DeviceId::from("r1");
    for _ in 0..100 {
        if h.registry.status(&id).await.unwrap().poll_state == PollState::Idle {
            break;
        }
        tokio::task::yield_now().await;
    }
    let status = h.registry.status(&id).await.unwrap();
    assert_eq!(status.poll_state, PollState::Idle);
    assert_eq!(status.last_error, Some(ErrorKind::ProtocolError));
}

#[tokio::test(start_paused = true)]
async fn test_run_drains_in_flight_polls_on_shutdown() {
    let h = harness(
        ScriptedPoller::new(
            Behavior::SucceedAfter(Duration::from_millis(500), 1),
            Duration::from_secs(5),
        ),
        vec![device("r1", 5)],
        4,
    )
    .await;
    let registry = h.registry.clone();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(h.scheduler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.in_flight().await, 1);
    shutdown_tx.send(()).unwrap();
    assert_ok!(handle.await);

    let status = registry.status(&"r1".into()).await.unwrap();
    assert_eq!(status.poll_state, PollState::Idle);
    assert_eq!(status.health, HealthState::Healthy);
    assert!(status.last_success.is_some());
}

#[tokio::test]
async fn test_builder_requires_poller() {
    let pipeline = Pipeline::new(
        BusConfig::default(),
        CollectorMetrics::new(),
        StructuredLogger::new("test-node"),
    );
    let result = SchedulerBuilder::new()
        .registry(DeviceRegistry::default())
        .sink(pipeline.sink())
        .build();
    assert_err!(result);
}

#[tokio::test]
async fn test_builder_rejects_empty_pool() {
    let pipeline = Pipeline::new(
        BusConfig::default(),
        CollectorMetrics::new(),
        StructuredLogger::new("test-node"),
    );
    let result = SchedulerBuilder::new()
        .registry(DeviceRegistry::default())
        .poller(Arc::new(ScriptedPoller::new(
            Behavior::Succeed(0),
            Duration::from_secs(1),
        )))
        .sink(pipeline.sink())
        .worker_pool_size(0)
        .build();
    assert_err!(result);
}
