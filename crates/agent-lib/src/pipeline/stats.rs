//! Aggregate pipeline counters
//!
//! Per-instance atomics back the status snapshot; every increment is also
//! mirrored into the process-wide Prometheus metrics.

use crate::error::ErrorKind;
use crate::observability::CollectorMetrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct PipelineStats {
    samples_produced: AtomicU64,
    flow_packets_decoded: AtomicU64,
    flow_records_decoded: AtomicU64,
    decode_errors: AtomicU64,
    unknown_template_flowsets: AtomicU64,
    template_sets_evicted: AtomicU64,
    syslog_messages: AtomicU64,
    syslog_malformed: AtomicU64,
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    polls_skipped: AtomicU64,
    metrics: CollectorMetrics,
}

/// Serializable view of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub samples_produced: u64,
    pub samples_delivered: u64,
    pub samples_dropped: u64,
    pub flow_packets_decoded: u64,
    pub flow_records_decoded: u64,
    pub flow_records_dropped: u64,
    pub decode_errors: u64,
    pub unknown_template_flowsets: u64,
    pub template_sets_evicted: u64,
    pub syslog_messages: u64,
    pub syslog_malformed: u64,
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub polls_skipped: u64,
}

impl PipelineStats {
    pub fn new(metrics: CollectorMetrics) -> Self {
        Self {
            metrics,
            ..Default::default()
        }
    }

    pub fn metrics(&self) -> &CollectorMetrics {
        &self.metrics
    }

    pub fn record_samples(&self, count: usize) {
        self.samples_produced
            .fetch_add(count as u64, Ordering::Relaxed);
        self.metrics.inc_samples_produced(count as u64);
    }

    pub fn record_flow_packet(&self, records: usize, unknown_templates: usize) {
        self.flow_packets_decoded.fetch_add(1, Ordering::Relaxed);
        self.flow_records_decoded
            .fetch_add(records as u64, Ordering::Relaxed);
        self.metrics.inc_flow_packets();
        self.metrics.inc_flow_records(records as u64);
        if unknown_templates > 0 {
            self.unknown_template_flowsets
                .fetch_add(unknown_templates as u64, Ordering::Relaxed);
            self.metrics
                .inc_flow_unknown_templates(unknown_templates as u64);
        }
    }

    pub fn record_template_evictions(&self, count: usize) {
        self.template_sets_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
        self.metrics.inc_flow_template_evictions(count as u64);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_flow_decode_errors();
    }

    pub fn record_syslog_message(&self) {
        self.syslog_messages.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_syslog_messages();
    }

    pub fn record_syslog_malformed(&self) {
        self.syslog_malformed.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_syslog_malformed();
    }

    pub fn record_poll(&self, latency: Duration, failure: Option<ErrorKind>) {
        match failure {
            None => self.polls_succeeded.fetch_add(1, Ordering::Relaxed),
            Some(_) => self.polls_failed.fetch_add(1, Ordering::Relaxed),
        };
        self.metrics.observe_poll(latency, failure);
    }

    pub fn record_poll_skipped(&self) {
        self.polls_skipped.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_polls_skipped();
    }

    /// Counters owned here; bus-level fields are filled in by the pipeline
    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            samples_produced: self.samples_produced.load(Ordering::Relaxed),
            flow_packets_decoded: self.flow_packets_decoded.load(Ordering::Relaxed),
            flow_records_decoded: self.flow_records_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unknown_template_flowsets: self.unknown_template_flowsets.load(Ordering::Relaxed),
            template_sets_evicted: self.template_sets_evicted.load(Ordering::Relaxed),
            syslog_messages: self.syslog_messages.load(Ordering::Relaxed),
            syslog_malformed: self.syslog_malformed.load(Ordering::Relaxed),
            polls_succeeded: self.polls_succeeded.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
