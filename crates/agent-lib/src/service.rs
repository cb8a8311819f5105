//! Owned lifecycle of the whole collector
//!
//! [`TelemetryService::start`] binds the listeners, starts the scheduler and
//! marks the service ready. [`TelemetryService::shutdown`] stops intake,
//! waits for in-flight polls, then closes the bus.

use crate::collector::{
    Clock, DeviceRegistry, Listener, NetflowConfig, NetflowListener, OidCatalogue, Poller,
    SchedulerBuilder, SchedulerConfig, SnmpConfig, SnmpPoller, SyslogConfig, SyslogListener,
    SystemClock,
};
use crate::collector::{BackoffPolicy, DeviceStatus};
use crate::health::{self, components, HealthRegistry};
use crate::models::{Device, FlowRecord, Sample};
use crate::observability::{CollectorMetrics, StructuredLogger};
use crate::pipeline::{BusConfig, Pipeline, PipelineCounters, Subscription};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything needed to start the collector
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub node_name: String,
    pub scheduler: SchedulerConfig,
    pub backoff: BackoffPolicy,
    pub bus: BusConfig,
    pub snmp: SnmpConfig,
    /// `None` disables the syslog listener
    pub syslog: Option<SyslogConfig>,
    /// `None` disables the NetFlow listener
    pub netflow: Option<NetflowConfig>,
    /// How often component health is re-evaluated
    pub health_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node_name: "noc-agent".to_string(),
            scheduler: SchedulerConfig::default(),
            backoff: BackoffPolicy::default(),
            bus: BusConfig::default(),
            snmp: SnmpConfig::default(),
            syslog: Some(SyslogConfig::default()),
            netflow: Some(NetflowConfig::default()),
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Devices plus aggregate counters, as served on the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub node: String,
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<DeviceStatus>,
    pub counters: PipelineCounters,
}

/// Cloneable read side of the service for the status endpoint
#[derive(Debug, Clone)]
pub struct StatusHandle {
    node: String,
    registry: DeviceRegistry,
    pipeline: Pipeline,
}

impl StatusHandle {
    pub fn new(node: impl Into<String>, registry: DeviceRegistry, pipeline: Pipeline) -> Self {
        Self {
            node: node.into(),
            registry,
            pipeline,
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            node: self.node.clone(),
            generated_at: Utc::now(),
            devices: self.registry.snapshot().await,
            counters: self.pipeline.counters(),
        }
    }
}

/// Addresses the listeners actually bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub syslog_udp: Option<SocketAddr>,
    pub syslog_tcp: Option<SocketAddr>,
    pub netflow: Option<SocketAddr>,
}

pub struct TelemetryService {
    registry: DeviceRegistry,
    pipeline: Pipeline,
    health: HealthRegistry,
    logger: StructuredLogger,
    clock: Arc<dyn Clock>,
    addrs: BoundAddrs,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TelemetryService {
    /// Start with the SNMP poller built from `catalogue`
    pub async fn start(
        config: ServiceConfig,
        devices: Vec<Device>,
        catalogue: OidCatalogue,
        metrics: CollectorMetrics,
    ) -> Result<Self> {
        let poller = Arc::new(SnmpPoller::new(Arc::new(catalogue), config.snmp.clone()));
        Self::start_with(config, devices, poller, Arc::new(SystemClock), metrics).await
    }

    /// Start with an explicit poller and clock
    pub async fn start_with(
        config: ServiceConfig,
        devices: Vec<Device>,
        poller: Arc<dyn Poller>,
        clock: Arc<dyn Clock>,
        metrics: CollectorMetrics,
    ) -> Result<Self> {
        let logger = StructuredLogger::new(config.node_name.clone());
        let pipeline = Pipeline::new(config.bus.clone(), metrics.clone(), logger.clone());
        let health = HealthRegistry::new();
        for name in [components::SCHEDULER, components::SNMP_POLLER, components::EVENT_BUS] {
            health.register(name).await;
        }

        let registry = DeviceRegistry::new(config.backoff);
        let device_count = devices.len();
        registry.sync(devices, clock.now()).await;
        metrics.set_device_health(&registry.health_counts().await);

        // Bind everything before spawning anything so a bind failure
        // leaves nothing running.
        let mut listeners: Vec<(&'static str, Box<dyn Listener>)> = Vec::new();
        let mut addrs = BoundAddrs::default();
        if let Some(syslog) = config.syslog.clone() {
            health.register(components::SYSLOG_LISTENER).await;
            match SyslogListener::bind(syslog).await {
                Ok(listener) => {
                    addrs.syslog_udp = listener.udp_addr();
                    addrs.syslog_tcp = listener.tcp_addr();
                    listeners.push((components::SYSLOG_LISTENER, Box::new(listener) as Box<dyn Listener>));
                }
                Err(e) => {
                    health
                        .set_unhealthy(components::SYSLOG_LISTENER, e.to_string())
                        .await;
                    return Err(e);
                }
            }
        }
        if let Some(netflow) = config.netflow.clone() {
            health.register(components::NETFLOW_LISTENER).await;
            match NetflowListener::bind(netflow, pipeline.flow_bus().clone(), logger.clone())
                .await
            {
                Ok(listener) => {
                    addrs.netflow = listener.local_addr();
                    listeners.push((components::NETFLOW_LISTENER, Box::new(listener) as Box<dyn Listener>));
                }
                Err(e) => {
                    health
                        .set_unhealthy(components::NETFLOW_LISTENER, e.to_string())
                        .await;
                    return Err(e);
                }
            }
        }

        let scheduler = SchedulerBuilder::new()
            .registry(registry.clone())
            .poller(poller)
            .sink(pipeline.sink())
            .clock(Arc::clone(&clock))
            .logger(logger.clone())
            .tick_interval(config.scheduler.tick_interval)
            .worker_pool_size(config.scheduler.worker_pool_size)
            .build()
            .context("Failed to build scheduler")?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();
        tasks.push((
            components::SCHEDULER,
            tokio::spawn(scheduler.run(shutdown_tx.subscribe())),
        ));
        for (name, listener) in listeners {
            tasks.push((name, tokio::spawn(listener.run(pipeline.sink(), shutdown_tx.subscribe()))));
        }
        tasks.push((
            "health_monitor",
            tokio::spawn(monitor_health(
                registry.clone(),
                pipeline.clone(),
                health.clone(),
                config.health_interval,
                shutdown_tx.subscribe(),
            )),
        ));

        health.set_ready(true).await;
        logger.log_startup(env!("CARGO_PKG_VERSION"), device_count);

        Ok(Self {
            registry,
            pipeline,
            health,
            logger,
            clock,
            addrs,
            shutdown_tx,
            tasks,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn bound_addrs(&self) -> BoundAddrs {
        self.addrs
    }

    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<Sample> {
        self.pipeline.subscribe(name)
    }

    pub fn subscribe_flows(&self, name: impl Into<String>) -> Subscription<FlowRecord> {
        self.pipeline.subscribe_flows(name)
    }

    /// Replace the device list; devices no longer listed are deactivated
    pub async fn reload_devices(&self, devices: Vec<Device>) {
        info!(devices = devices.len(), "Reloading device list");
        self.registry.sync(devices, self.clock.now()).await;
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle::new(
            self.logger.node_name(),
            self.registry.clone(),
            self.pipeline.clone(),
        )
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.status_handle().snapshot().await
    }

    /// Stop listeners and the scheduler, wait for in-flight polls, close the bus
    pub async fn shutdown(self, reason: &str) {
        self.logger.log_shutdown(reason);
        self.health.set_ready(false).await;
        // Receivers may already be gone if a task exited early.
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }

        self.pipeline.close();
        self.health
            .set_unhealthy(components::EVENT_BUS, "event bus closed")
            .await;
        info!("Telemetry collector stopped");
    }
}

impl std::fmt::Debug for TelemetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryService")
            .field("node", &self.logger.node_name())
            .field("addrs", &self.addrs)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Periodically fold device and bus state into component health
async fn monitor_health(
    registry: DeviceRegistry,
    pipeline: Pipeline,
    health: HealthRegistry,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    let mut last_dropped = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let counts = registry.health_counts().await;
                pipeline.stats().metrics().set_device_health(&counts);
                health
                    .update(components::SNMP_POLLER, health::poller_health(&counts))
                    .await;

                let dropped = pipeline.bus_stats().dropped;
                health
                    .update(
                        components::EVENT_BUS,
                        health::bus_health(dropped.saturating_sub(last_dropped), pipeline.is_closed()),
                    )
                    .await;
                last_dropped = dropped;
            }
            _ = shutdown.recv() => break,
        }
    }
}
