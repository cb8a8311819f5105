//! Observability infrastructure for the telemetry agent
//!
//! Provides:
//! - Prometheus metrics (poll latency, poll outcomes, bus throughput and drops,
//!   flow decoding, syslog parsing, device health)
//! - Structured JSON logging with tracing

use crate::error::ErrorKind;
use crate::models::{DeviceId, HealthState};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for poll latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<CollectorMetricsInner> = OnceLock::new();

struct CollectorMetricsInner {
    poll_latency_seconds: Histogram,
    polls_total: IntCounterVec,
    polls_skipped: IntCounter,
    polls_in_flight: IntGauge,
    samples_produced: IntCounter,
    bus_delivered: IntCounterVec,
    bus_dropped: IntCounterVec,
    bus_subscribers: IntGaugeVec,
    flow_packets_decoded: IntCounter,
    flow_records_decoded: IntCounter,
    flow_decode_errors: IntCounter,
    flow_unknown_templates: IntCounter,
    flow_template_evictions: IntCounter,
    syslog_messages: IntCounter,
    syslog_malformed: IntCounter,
    devices_by_health: IntGaugeVec,
}

impl CollectorMetricsInner {
    fn new() -> Self {
        Self {
            poll_latency_seconds: register_histogram!(
                "noc_agent_poll_latency_seconds",
                "Time spent polling a single device",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),

            polls_total: register_int_counter_vec!(
                "noc_agent_polls_total",
                "Completed device polls by outcome",
                &["outcome"]
            )
            .expect("Failed to register polls_total"),

            polls_skipped: register_int_counter!(
                "noc_agent_polls_skipped_total",
                "Due polls skipped because a poll was in flight or the worker pool was full"
            )
            .expect("Failed to register polls_skipped"),

            polls_in_flight: register_int_gauge!(
                "noc_agent_polls_in_flight",
                "Number of device polls currently running"
            )
            .expect("Failed to register polls_in_flight"),

            samples_produced: register_int_counter!(
                "noc_agent_samples_produced_total",
                "Total number of normalized samples produced"
            )
            .expect("Failed to register samples_produced"),

            bus_delivered: register_int_counter_vec!(
                "noc_agent_bus_delivered_total",
                "Events delivered to subscribers",
                &["bus"]
            )
            .expect("Failed to register bus_delivered"),

            bus_dropped: register_int_counter_vec!(
                "noc_agent_bus_dropped_total",
                "Events dropped under backpressure",
                &["bus"]
            )
            .expect("Failed to register bus_dropped"),

            bus_subscribers: register_int_gauge_vec!(
                "noc_agent_bus_subscribers",
                "Number of attached subscribers",
                &["bus"]
            )
            .expect("Failed to register bus_subscribers"),

            flow_packets_decoded: register_int_counter!(
                "noc_agent_flow_packets_decoded_total",
                "Total number of flow export packets decoded"
            )
            .expect("Failed to register flow_packets_decoded"),

            flow_records_decoded: register_int_counter!(
                "noc_agent_flow_records_decoded_total",
                "Total number of flow records decoded"
            )
            .expect("Failed to register flow_records_decoded"),

            flow_decode_errors: register_int_counter!(
                "noc_agent_flow_decode_errors_total",
                "Total number of rejected flow export packets"
            )
            .expect("Failed to register flow_decode_errors"),

            flow_unknown_templates: register_int_counter!(
                "noc_agent_flow_unknown_template_flowsets_total",
                "Data flowsets skipped because their template was unknown"
            )
            .expect("Failed to register flow_unknown_templates"),

            flow_template_evictions: register_int_counter!(
                "noc_agent_flow_template_sets_evicted_total",
                "Template sets evicted to stay within the per-exporter and total limits"
            )
            .expect("Failed to register flow_template_evictions"),

            syslog_messages: register_int_counter!(
                "noc_agent_syslog_messages_total",
                "Total number of syslog messages parsed"
            )
            .expect("Failed to register syslog_messages"),

            syslog_malformed: register_int_counter!(
                "noc_agent_syslog_malformed_total",
                "Total number of malformed syslog lines dropped"
            )
            .expect("Failed to register syslog_malformed"),

            devices_by_health: register_int_gauge_vec!(
                "noc_agent_devices",
                "Active devices by health state",
                &["health"]
            )
            .expect("Failed to register devices_by_health"),
        }
    }
}

/// Collector metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct CollectorMetrics {
    _private: (),
}

impl std::fmt::Debug for CollectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CollectorMetrics")
    }
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CollectorMetricsInner {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new)
    }

    pub fn observe_poll(&self, latency: Duration, failure: Option<ErrorKind>) {
        let inner = self.inner();
        inner.poll_latency_seconds.observe(latency.as_secs_f64());
        let outcome = failure.map_or("success", |kind| kind.as_str());
        inner.polls_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_polls_skipped(&self) {
        self.inner().polls_skipped.inc();
    }

    pub fn set_polls_in_flight(&self, count: i64) {
        self.inner().polls_in_flight.set(count);
    }

    pub fn inc_samples_produced(&self, count: u64) {
        self.inner().samples_produced.inc_by(count);
    }

    pub fn inc_bus_delivered(&self, bus: &str, count: u64) {
        self.inner()
            .bus_delivered
            .with_label_values(&[bus])
            .inc_by(count);
    }

    pub fn inc_bus_dropped(&self, bus: &str, count: u64) {
        self.inner()
            .bus_dropped
            .with_label_values(&[bus])
            .inc_by(count);
    }

    pub fn set_bus_subscribers(&self, bus: &str, count: i64) {
        self.inner()
            .bus_subscribers
            .with_label_values(&[bus])
            .set(count);
    }

    pub fn inc_flow_packets(&self) {
        self.inner().flow_packets_decoded.inc();
    }

    pub fn inc_flow_records(&self, count: u64) {
        self.inner().flow_records_decoded.inc_by(count);
    }

    pub fn inc_flow_decode_errors(&self) {
        self.inner().flow_decode_errors.inc();
    }

    pub fn inc_flow_unknown_templates(&self, count: u64) {
        self.inner().flow_unknown_templates.inc_by(count);
    }

    pub fn inc_flow_template_evictions(&self, count: u64) {
        self.inner().flow_template_evictions.inc_by(count);
    }

    pub fn inc_syslog_messages(&self) {
        self.inner().syslog_messages.inc();
    }

    pub fn inc_syslog_malformed(&self) {
        self.inner().syslog_malformed.inc();
    }

    /// Replace the per-health device gauges
    pub fn set_device_health(&self, counts: &HashMap<HealthState, usize>) {
        for state in HealthState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            self.inner()
                .devices_by_health
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
    }
}

/// Structured logger for collector events
///
/// Provides consistent JSON-formatted logging for device health changes,
/// backpressure and decode failures.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log a device health transition
    pub fn log_health_change(
        &self,
        device_id: &DeviceId,
        previous: HealthState,
        current: HealthState,
        consecutive_failures: u32,
        next_interval: Duration,
    ) {
        match current {
            HealthState::Unreachable | HealthState::Degraded => {
                warn!(
                    event = "device_health_changed",
                    node = %self.node_name,
                    device_id = %device_id,
                    previous = previous.as_str(),
                    current = current.as_str(),
                    consecutive_failures = consecutive_failures,
                    next_interval_secs = next_interval.as_secs(),
                    "Device health degraded"
                );
            }
            _ => {
                info!(
                    event = "device_health_changed",
                    node = %self.node_name,
                    device_id = %device_id,
                    previous = previous.as_str(),
                    current = current.as_str(),
                    "Device health changed"
                );
            }
        }
    }

    /// Log a credential rejection, which needs operator action
    pub fn log_auth_failure(&self, device_id: &DeviceId, details: &str) {
        warn!(
            event = "device_auth_failed",
            node = %self.node_name,
            device_id = %device_id,
            details = %details,
            "Device rejected credentials, parked until reconfigured"
        );
    }

    /// Log samples dropped under backpressure
    pub fn log_backpressure_drop(&self, bus: &str, device_id: &str, dropped: usize) {
        warn!(
            event = "backpressure_drop",
            node = %self.node_name,
            bus = %bus,
            device_id = %device_id,
            dropped = dropped,
            "Subscriber full, event dropped"
        );
    }

    /// Log a rejected flow export packet
    pub fn log_flow_decode_failure(&self, exporter: SocketAddr, len: usize, error: &str) {
        warn!(
            event = "flow_decode_failed",
            node = %self.node_name,
            exporter = %exporter,
            packet_len = len,
            error = %error,
            "Rejected flow export packet"
        );
    }

    /// Log collector startup
    pub fn log_startup(&self, version: &str, devices: usize) {
        info!(
            event = "collector_started",
            node = %self.node_name,
            agent_version = %version,
            devices = devices,
            "Telemetry collector started"
        );
    }

    /// Log collector shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "collector_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Telemetry collector shutting down"
        );
    }
}
