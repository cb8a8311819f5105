//! Metric catalogue: which OIDs to poll for each kind of device

use super::ber::Oid;
use crate::models::DeviceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_scale() -> f64 {
    1.0
}

/// One metric polled over SNMP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricOid {
    /// Metric name used on emitted samples
    pub name: String,
    pub oid: Oid,
    /// Multiplier applied to the raw value
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl MetricOid {
    pub fn new(name: impl Into<String>, oid: Oid) -> Self {
        Self {
            name: name.into(),
            oid,
            scale: 1.0,
        }
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

/// OIDs polled per device kind
///
/// Kinds without an explicit entry use the standard MIB-II set.
#[derive(Debug, Clone, PartialEq)]
pub struct OidCatalogue {
    by_kind: HashMap<DeviceKind, Vec<MetricOid>>,
    fallback: Vec<MetricOid>,
}

impl OidCatalogue {
    /// A catalogue with no per-kind entries
    pub fn with_fallback(fallback: Vec<MetricOid>) -> Self {
        Self {
            by_kind: HashMap::new(),
            fallback,
        }
    }

    pub fn set(&mut self, kind: DeviceKind, metrics: Vec<MetricOid>) {
        self.by_kind.insert(kind, metrics);
    }

    pub fn for_kind(&self, kind: DeviceKind) -> &[MetricOid] {
        self.by_kind
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&self.fallback)
    }
}

impl Default for OidCatalogue {
    fn default() -> Self {
        let standard = standard_metrics();
        let mut router = standard.clone();
        router.extend(cisco_metrics());

        let mut catalogue = Self::with_fallback(standard.clone());
        catalogue.set(DeviceKind::Router, router);
        catalogue.set(DeviceKind::Switch, standard);
        catalogue
    }
}

fn metric(name: &str, oid: &str) -> MetricOid {
    MetricOid::new(name, oid.parse().expect("built-in OID is valid"))
}

/// MIB-II and HOST-RESOURCES metrics every agent answers
fn standard_metrics() -> Vec<MetricOid> {
    vec![
        // sysUpTime, hundredths of a second
        metric("sys.uptime_seconds", "1.3.6.1.2.1.1.3.0").scaled(0.01),
        metric("if.in_octets", "1.3.6.1.2.1.2.2.1.10.1"),
        metric("if.out_octets", "1.3.6.1.2.1.2.2.1.16.1"),
        metric("if.in_errors", "1.3.6.1.2.1.2.2.1.14.1"),
        metric("if.out_errors", "1.3.6.1.2.1.2.2.1.20.1"),
        metric("cpu.load_percent", "1.3.6.1.2.1.25.3.3.1.2.1"),
        metric("storage.used_units", "1.3.6.1.2.1.25.2.3.1.6.1"),
    ]
}

/// CISCO-PROCESS-MIB and CISCO-MEMORY-POOL-MIB
fn cisco_metrics() -> Vec<MetricOid> {
    vec![
        metric("cpu.5min_percent", "1.3.6.1.4.1.9.9.109.1.1.1.1.8.1"),
        metric("memory.pool_used_bytes", "1.3.6.1.4.1.9.9.48.1.1.1.5.1"),
        metric("memory.pool_free_bytes", "1.3.6.1.4.1.9.9.48.1.1.1.6.1"),
    ]
}
