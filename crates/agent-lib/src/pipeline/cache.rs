//! Last-known-good value per (device, metric)

use crate::models::{DeviceId, Sample, SourceProtocol};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Latest value stored for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: SourceProtocol,
}

/// Write-many/read-many snapshot of the latest sample per key
#[derive(Debug, Clone, Default)]
pub struct MetricsCache {
    entries: Arc<DashMap<(DeviceId, String), CachedValue>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a sample, replacing any previous value for its key.
    ///
    /// A timestamp older than the stored one is raised to it so readers never
    /// see time go backwards for a key after a wall-clock jump. The effective
    /// timestamp is returned.
    pub fn record(&self, sample: &Sample) -> DateTime<Utc> {
        let key = (sample.device.clone(), sample.metric.clone());
        let mut entry = self.entries.entry(key).or_insert_with(|| CachedValue {
            value: sample.value,
            timestamp: sample.timestamp,
            source: sample.source,
        });
        let timestamp = entry.timestamp.max(sample.timestamp);
        *entry = CachedValue {
            value: sample.value,
            timestamp,
            source: sample.source,
        };
        timestamp
    }

    pub fn get(&self, device: &DeviceId, metric: &str) -> Option<CachedValue> {
        self.entries
            .get(&(device.clone(), metric.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// All cached metrics of one device, sorted by metric name
    pub fn device(&self, device: &DeviceId) -> Vec<(String, CachedValue)> {
        let mut metrics: Vec<(String, CachedValue)> = self
            .entries
            .iter()
            .filter(|entry| &entry.key().0 == device)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        metrics
    }

    /// Drop every entry of a device; returns how many were removed
    pub fn evict_device(&self, device: &DeviceId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(id, _), _| id != device);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
