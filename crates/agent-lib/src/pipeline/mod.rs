//! Sample delivery: event bus, metrics cache and counters
//!
//! Every producer (active pollers and passive listeners alike) hands its
//! samples to a [`SampleSink`], which mirrors them into the
//! [`MetricsCache`] and publishes them on the sample [`EventBus`].

mod bus;
mod cache;
mod stats;

#[cfg(test)]
mod tests;

pub use bus::{BusConfig, BusEvent, BusStats, EventBus, Subscription};
pub use cache::{CachedValue, MetricsCache};
pub use stats::{PipelineCounters, PipelineStats};

use crate::error::BusError;
use crate::models::{FlowRecord, Sample};
use crate::observability::{CollectorMetrics, StructuredLogger};
use std::sync::Arc;

/// Bus name for normalized samples
pub const SAMPLE_BUS: &str = "samples";
/// Bus name for decoded flow records
pub const FLOW_BUS: &str = "flows";

/// The shared delivery side of the pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    samples: EventBus<Sample>,
    flows: EventBus<FlowRecord>,
    cache: MetricsCache,
    stats: Arc<PipelineStats>,
    logger: StructuredLogger,
}

impl Pipeline {
    pub fn new(config: BusConfig, metrics: CollectorMetrics, logger: StructuredLogger) -> Self {
        Self {
            samples: EventBus::new(SAMPLE_BUS, config.clone(), metrics.clone()),
            flows: EventBus::new(FLOW_BUS, config, metrics.clone()),
            cache: MetricsCache::new(),
            stats: Arc::new(PipelineStats::new(metrics)),
            logger,
        }
    }

    /// Attach a consumer of normalized samples
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<Sample> {
        self.samples.subscribe(name)
    }

    /// Attach a consumer of raw decoded flow records
    pub fn subscribe_flows(&self, name: impl Into<String>) -> Subscription<FlowRecord> {
        self.flows.subscribe(name)
    }

    pub fn sink(&self) -> SampleSink {
        SampleSink {
            samples: self.samples.clone(),
            cache: self.cache.clone(),
            stats: Arc::clone(&self.stats),
            logger: self.logger.clone(),
        }
    }

    pub fn flow_bus(&self) -> &EventBus<FlowRecord> {
        &self.flows
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// All aggregate counters, including bus delivery and drops
    pub fn counters(&self) -> PipelineCounters {
        let samples = self.samples.stats();
        let flows = self.flows.stats();
        PipelineCounters {
            samples_delivered: samples.delivered,
            samples_dropped: samples.dropped,
            flow_records_dropped: flows.dropped,
            ..self.stats.counters()
        }
    }

    pub fn bus_stats(&self) -> BusStats {
        self.samples.stats()
    }

    /// Close both buses; subscribers drain and then end
    pub fn close(&self) {
        self.samples.close();
        self.flows.close();
    }

    pub fn is_closed(&self) -> bool {
        self.samples.is_closed()
    }
}

/// Outcome of handing a batch to the sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub produced: usize,
    pub dropped: usize,
}

/// Producer handle: the single entry point for samples into the pipeline
#[derive(Debug, Clone)]
pub struct SampleSink {
    samples: EventBus<Sample>,
    cache: MetricsCache,
    stats: Arc<PipelineStats>,
    logger: StructuredLogger,
}

impl SampleSink {
    /// Mirror samples into the cache and publish them in order.
    ///
    /// Timestamps are clamped to be non-decreasing per (device, metric),
    /// both in the cache and on the bus.
    ///
    /// Backpressure drops are counted, never returned as errors.
    pub async fn emit(&self, samples: Vec<Sample>) -> EmitReport {
        let mut report = EmitReport {
            produced: samples.len(),
            dropped: 0,
        };
        if samples.is_empty() {
            return report;
        }
        self.stats.record_samples(samples.len());

        let cache = &self.cache;
        for sample in samples {
            let device = sample.device.clone();
            // The clamp and the publish share one key lock.
            let published = self
                .samples
                .publish_with(sample, |sample| sample.timestamp = cache.record(sample))
                .await;
            match published {
                Ok(_) => {}
                Err(BusError::BackpressureDrop { dropped }) => {
                    report.dropped += dropped;
                    self.logger
                        .log_backpressure_drop(SAMPLE_BUS, device.as_str(), dropped);
                }
                Err(BusError::Closed) => break,
            }
        }

        report
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}
