//! Network telemetry collector library
//!
//! This crate provides the core functionality for:
//! - Device registry with health tracking and backoff
//! - Collection scheduling over SNMP, plus syslog and NetFlow listeners
//! - NetFlow v5/v9 decoding
//! - Ordered, bounded sample delivery with a latest-value cache
//! - Health checks and observability

pub mod collector;
pub mod error;
pub mod flow;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod service;

pub use error::{BusError, DecodeError, ErrorKind, PollError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CollectorMetrics, StructuredLogger};
pub use service::{ServiceConfig, StatusHandle, StatusSnapshot, TelemetryService};
