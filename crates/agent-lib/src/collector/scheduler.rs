//! Collection scheduler
//!
//! On every tick, asks the registry which devices are due and hands each one
//! to the poller on a bounded worker pool. The coordinator never waits on a
//! device: polls run as tasks, each bounded by the poller's timeout, and
//! report their outcome back to the registry when they finish.

use super::{DeviceRegistry, Poller};
use crate::error::{ErrorKind, PollError};
use crate::models::{Device, PollOutcome, PollStatus};
use crate::observability::{CollectorMetrics, StructuredLogger};
use crate::pipeline::SampleSink;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Source of wall-clock time for scheduling decisions
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += step;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due devices are checked (default: 1 second)
    pub tick_interval: Duration,
    /// Maximum concurrent polls (default: 32)
    pub worker_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            worker_pool_size: 32,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Devices whose next poll time had passed
    pub due: usize,
    /// Polls started this tick
    pub dispatched: usize,
    /// Due devices still being polled from an earlier tick
    pub skipped: usize,
    /// Due devices left for a later tick because the pool was full
    pub deferred: usize,
}

/// State shared with every poll task
struct PollContext {
    registry: DeviceRegistry,
    poller: Arc<dyn Poller>,
    sink: SampleSink,
    clock: Arc<dyn Clock>,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
}

pub struct Scheduler {
    ctx: Arc<PollContext>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        registry: DeviceRegistry,
        poller: Arc<dyn Poller>,
        sink: SampleSink,
        clock: Arc<dyn Clock>,
        logger: StructuredLogger,
        config: SchedulerConfig,
    ) -> Self {
        let metrics = sink.stats().metrics().clone();
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            ctx: Arc::new(PollContext {
                registry,
                poller,
                sink,
                clock,
                metrics,
                logger,
            }),
            config,
            workers,
            tasks: JoinSet::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.ctx.registry
    }

    /// Polls currently running
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Run until `shutdown` fires, then wait for in-flight polls to finish
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            workers = self.config.worker_pool_size,
            protocol = self.ctx.poller.protocol().as_str(),
            "Starting collection scheduler"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.dispatched > 0 || report.deferred > 0 {
                        debug!(
                            due = report.due,
                            dispatched = report.dispatched,
                            skipped = report.skipped,
                            deferred = report.deferred,
                            in_flight = self.tasks.len(),
                            "Scheduler tick"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!(in_flight = self.tasks.len(), "Shutting down collection scheduler");
                    break;
                }
            }
        }

        self.drain().await;
    }

    /// Dispatch every due device that is idle and fits in the pool
    pub async fn tick(&mut self) -> TickReport {
        self.reap();

        let now = self.ctx.clock.now();
        let due = self.ctx.registry.list_due(now).await;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for device in due {
            let permit = match self.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    report.deferred += 1;
                    continue;
                }
            };

            let Some(device) = self.ctx.registry.begin_poll(&device.id).await else {
                // Previous poll of this device has not finished yet.
                report.skipped += 1;
                self.ctx.sink.stats().record_poll_skipped();
                debug!(device_id = %device.id, "Poll still in flight, skipping");
                continue;
            };

            report.dispatched += 1;
            self.tasks
                .spawn(poll_device(Arc::clone(&self.ctx), device, permit));
        }

        self.ctx.metrics.set_polls_in_flight(self.tasks.len() as i64);
        report
    }

    /// Wait for every in-flight poll to report its outcome
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Poll task failed");
            }
        }
        self.ctx.metrics.set_polls_in_flight(0);
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Poll task failed");
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("in_flight", &self.tasks.len())
            .finish()
    }
}

/// Returns a device to idle if its poll task unwinds before reporting
struct PanicGuard {
    ctx: Arc<PollContext>,
    device: Option<Device>,
}

impl PanicGuard {
    fn disarm(mut self) {
        self.device = None;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let ctx = Arc::clone(&self.ctx);
        handle.spawn(async move {
            let outcome =
                PollOutcome::failed(device.id.clone(), Duration::ZERO, ErrorKind::ProtocolError);
            ctx.sink
                .stats()
                .record_poll(Duration::ZERO, Some(ErrorKind::ProtocolError));
            ctx.registry.record_outcome(&outcome, ctx.clock.now()).await;
        });
    }
}

/// One poll, start to finish. Holding `_permit` keeps the worker slot.
async fn poll_device(ctx: Arc<PollContext>, device: Device, _permit: OwnedSemaphorePermit) {
    let guard = PanicGuard {
        ctx: Arc::clone(&ctx),
        device: Some(device.clone()),
    };
    let started = Instant::now();
    let result = tokio::time::timeout(ctx.poller.timeout(), ctx.poller.poll(&device)).await;
    let latency = started.elapsed();

    let outcome = match result {
        Ok(Ok(samples)) => {
            let count = samples.len();
            // Publish before going idle so the next poll of this device
            // cannot overtake these samples.
            ctx.sink.emit(samples).await;
            PollOutcome::success(device.id.clone(), latency, count)
        }
        Ok(Err(e)) => {
            if let PollError::Auth(details) = &e {
                ctx.logger.log_auth_failure(&device.id, details);
            } else {
                debug!(device_id = %device.id, error = %e, "Poll failed");
            }
            PollOutcome::failed(device.id.clone(), latency, e.kind())
        }
        Err(_) => {
            debug!(
                device_id = %device.id,
                timeout_ms = ctx.poller.timeout().as_millis() as u64,
                "Poll timed out"
            );
            PollOutcome::failed(device.id.clone(), latency, ErrorKind::Timeout)
        }
    };

    let failure = match outcome.status {
        PollStatus::Failed(kind) => Some(kind),
        PollStatus::Success { .. } => None,
    };
    ctx.sink.stats().record_poll(latency, failure);
    guard.disarm();

    let applied = ctx
        .registry
        .record_outcome(&outcome, ctx.clock.now())
        .await;
    if let Some(applied) = applied {
        if applied.health_changed() {
            ctx.logger.log_health_change(
                &device.id,
                applied.previous,
                applied.current,
                applied.consecutive_failures,
                applied.next_interval,
            );
            ctx.metrics
                .set_device_health(&ctx.registry.health_counts().await);
        }
    }
}

/// Builder for a [`Scheduler`]
pub struct SchedulerBuilder {
    registry: Option<DeviceRegistry>,
    poller: Option<Arc<dyn Poller>>,
    sink: Option<SampleSink>,
    clock: Arc<dyn Clock>,
    logger: Option<StructuredLogger>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            poller: None,
            sink: None,
            clock: Arc::new(SystemClock),
            logger: None,
            config: SchedulerConfig::default(),
        }
    }

    pub fn registry(mut self, registry: DeviceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn poller(mut self, poller: Arc<dyn Poller>) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn sink(mut self, sink: SampleSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Registry is required"))?;
        let poller = self
            .poller
            .ok_or_else(|| anyhow::anyhow!("Poller is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Sample sink is required"))?;
        if self.config.worker_pool_size == 0 {
            anyhow::bail!("Worker pool size must be at least 1");
        }
        if self.config.tick_interval.is_zero() {
            anyhow::bail!("Tick interval must be positive");
        }
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new("unknown"));

        Ok(Scheduler::new(
            registry,
            poller,
            sink,
            self.clock,
            logger,
            self.config,
        ))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
