//! Core data models for the telemetry pipeline

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Lower bound for any device polling interval (no busy-polling)
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stable identity of a monitored device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Declared device type, used to pick an OID catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Router,
    Switch,
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Router => "router",
            DeviceKind::Switch => "switch",
            DeviceKind::Other => "other",
        }
    }
}

/// Protocol-specific credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub community: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            community: "public".to_string(),
        }
    }
}

// Keep community strings out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("community", &"<redacted>")
            .finish()
    }
}

/// A monitored network endpoint and its polling parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub address: IpAddr,
    pub port: u16,
    pub credentials: Credentials,
    pub kind: DeviceKind,
    /// Base polling interval, never below [`MIN_POLL_INTERVAL`]
    pub poll_interval: Duration,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, address: IpAddr, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            address,
            port: 161,
            credentials: Credentials::default(),
            kind,
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_community(mut self, community: impl Into<String>) -> Self {
        self.credentials.community = community.into();
        self
    }

    /// Set the base interval, clamped to [`MIN_POLL_INTERVAL`]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }
}

/// Health state of a device as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthState {
    pub const ALL: [HealthState; 4] = [
        HealthState::Unknown,
        HealthState::Healthy,
        HealthState::Degraded,
        HealthState::Unreachable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unreachable => "unreachable",
        }
    }
}

/// Where a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    Snmp,
    Syslog,
    Netflow,
}

impl SourceProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceProtocol::Snmp => "snmp",
            SourceProtocol::Syslog => "syslog",
            SourceProtocol::Netflow => "netflow",
        }
    }
}

/// One normalized measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device: DeviceId,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: SourceProtocol,
}

impl Sample {
    pub fn new(
        device: DeviceId,
        metric: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        source: SourceProtocol,
    ) -> Self {
        Self {
            device,
            metric: metric.into(),
            value,
            timestamp,
            source,
        }
    }
}

/// A decoded NetFlow entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub tcp_flags: u8,
    pub tos: u8,
    pub octets: u64,
    pub packets: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exporter: IpAddr,
}

/// Result of one scheduler dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub device_id: DeviceId,
    pub latency: Duration,
    pub status: PollStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Success { samples: usize },
    Failed(ErrorKind),
}

impl PollOutcome {
    pub fn success(device_id: DeviceId, latency: Duration, samples: usize) -> Self {
        Self {
            device_id,
            latency,
            status: PollStatus::Success { samples },
        }
    }

    pub fn failed(device_id: DeviceId, latency: Duration, kind: ErrorKind) -> Self {
        Self {
            device_id,
            latency,
            status: PollStatus::Failed(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, PollStatus::Success { .. })
    }
}
