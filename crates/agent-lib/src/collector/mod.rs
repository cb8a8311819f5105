//! Telemetry collection from network devices
//!
//! Active collection runs through the [`Scheduler`], which dispatches due
//! devices from the [`DeviceRegistry`] to a [`Poller`]. Passive sources
//! (syslog, NetFlow) run as [`Listener`]s that push into the same
//! [`SampleSink`].

pub mod ber;
mod catalogue;
mod netflow;
mod registry;
mod scheduler;
mod snmp;
mod syslog;

#[cfg(test)]
mod tests;

pub use catalogue::{MetricOid, OidCatalogue};
pub use netflow::{NetflowConfig, NetflowListener};
pub use registry::{
    BackoffPolicy, DeviceRegistry, DeviceStatus, OutcomeApplied, PollState,
};
pub use scheduler::{
    Clock, ManualClock, Scheduler, SchedulerBuilder, SchedulerConfig, SystemClock, TickReport,
};
pub use snmp::{SnmpConfig, SnmpPoller};
pub use syslog::{parse_syslog, SyslogConfig, SyslogListener, SyslogMessage};

use crate::error::PollError;
use crate::models::{Device, Sample, SourceProtocol};
use crate::pipeline::SampleSink;
use std::time::Duration;
use tokio::sync::broadcast;

pub use async_trait::async_trait;

/// A request/response source queried by the scheduler
#[async_trait]
pub trait Poller: Send + Sync {
    fn protocol(&self) -> SourceProtocol;

    /// Upper bound on one device poll; the scheduler enforces it
    fn timeout(&self) -> Duration;

    /// Query one device. Partial results are a success.
    async fn poll(&self, device: &Device) -> Result<Vec<Sample>, PollError>;
}

/// A push source that feeds samples until shutdown
#[async_trait]
pub trait Listener: Send {
    fn protocol(&self) -> SourceProtocol;

    /// Receive until `shutdown` fires. Sockets are already bound.
    async fn run(self: Box<Self>, sink: SampleSink, shutdown: broadcast::Receiver<()>);
}
