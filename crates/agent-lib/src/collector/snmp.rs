//! SNMPv2c poller
//!
//! Issues one GET per catalogue metric over a connected UDP socket. A device
//! poll succeeds when at least one metric comes back; metrics that fail or
//! answer with an exception are left out of the result.

use super::ber::{self, Oid, SnmpValue};
use super::catalogue::OidCatalogue;
use super::Poller;
use crate::error::PollError;
use crate::models::{Device, Sample, SourceProtocol};
use async_trait::async_trait;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// `noAccess` error status
const ERR_NO_ACCESS: i64 = 6;
/// `authorizationError` error status
const ERR_AUTHORIZATION: i64 = 16;
/// `noSuchName`, returned by agents that answer v2c with v1 semantics
const ERR_NO_SUCH_NAME: i64 = 2;

const MAX_DATAGRAM: usize = 65_535;

/// Share of the poll timeout kept back so collected samples are returned
/// before the scheduler's own timeout fires
const DEADLINE_MARGIN_DIVISOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct SnmpConfig {
    /// Wait for a single response before retrying
    pub request_timeout: Duration,
    /// Retries per metric after the first attempt
    pub retries: u32,
    /// Bound on a whole device poll
    pub poll_timeout: Duration,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            retries: 1,
            poll_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SnmpPoller {
    catalogue: Arc<OidCatalogue>,
    config: SnmpConfig,
    next_request_id: AtomicI32,
}

impl SnmpPoller {
    pub fn new(catalogue: Arc<OidCatalogue>, config: SnmpConfig) -> Self {
        Self {
            catalogue,
            config,
            next_request_id: AtomicI32::new(seed_request_id()),
        }
    }

    pub fn catalogue(&self) -> &OidCatalogue {
        &self.catalogue
    }

    fn request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
    }

    /// Point by which a poll started now must have returned
    fn poll_deadline(&self) -> Instant {
        let budget = self.config.poll_timeout;
        Instant::now() + budget.saturating_sub(budget / DEADLINE_MARGIN_DIVISOR)
    }

    /// GET a single OID, retrying on timeout. No attempt outlives
    /// `poll_deadline`.
    async fn get(
        &self,
        socket: &UdpSocket,
        community: &str,
        oid: &Oid,
        poll_deadline: Instant,
    ) -> Result<SnmpValue, PollError> {
        let request_id = self.request_id();
        let request = ber::encode_get_request(community, request_id, std::slice::from_ref(oid));
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for attempt in 0..=self.config.retries {
            if Instant::now() >= poll_deadline {
                break;
            }
            socket.send(&request).await?;
            let deadline = (Instant::now() + self.config.request_timeout).min(poll_deadline);

            // Drain until our response shows up or the attempt times out.
            loop {
                let len = match timeout_at(deadline, socket.recv(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                let response = ber::decode_response(&buf[..len])
                    .map_err(|e| PollError::Protocol(e.to_string()))?;
                if response.request_id != request_id {
                    trace!(
                        expected = request_id,
                        got = response.request_id,
                        "Ignoring stale SNMP response"
                    );
                    continue;
                }
                return value_from_response(response, oid);
            }

            debug!(oid = %oid, attempt, "SNMP request timed out");
        }

        Err(PollError::Timeout)
    }
}

#[async_trait]
impl Poller for SnmpPoller {
    fn protocol(&self) -> SourceProtocol {
        SourceProtocol::Snmp
    }

    fn timeout(&self) -> Duration {
        self.config.poll_timeout
    }

    async fn poll(&self, device: &Device) -> Result<Vec<Sample>, PollError> {
        let metrics = self.catalogue.for_kind(device.kind);
        if metrics.is_empty() {
            return Err(PollError::Protocol(format!(
                "no metrics configured for {} devices",
                device.kind.as_str()
            )));
        }

        let deadline = self.poll_deadline();
        let socket = UdpSocket::bind(unspecified_for(device.address)).await?;
        socket.connect(SocketAddr::new(device.address, device.port)).await?;

        let mut samples = Vec::with_capacity(metrics.len());
        let mut worst: Option<PollError> = None;

        for (index, metric) in metrics.iter().enumerate() {
            if Instant::now() >= deadline {
                debug!(
                    device_id = %device.id,
                    collected = samples.len(),
                    skipped = metrics.len() - index,
                    "Poll budget spent, returning partial results"
                );
                if worst.is_none() {
                    worst = Some(PollError::Timeout);
                }
                break;
            }
            match self
                .get(&socket, &device.credentials.community, &metric.oid, deadline)
                .await
            {
                Ok(value) => match value.as_f64() {
                    Some(raw) => samples.push(Sample::new(
                        device.id.clone(),
                        metric.name.clone(),
                        raw * metric.scale,
                        Utc::now(),
                        SourceProtocol::Snmp,
                    )),
                    None => trace!(
                        device_id = %device.id,
                        metric = %metric.name,
                        value = ?value,
                        "No numeric value"
                    ),
                },
                // Bad credentials fail every other metric the same way.
                Err(e @ PollError::Auth(_)) => {
                    if samples.is_empty() {
                        return Err(e);
                    }
                    worst = Some(e);
                    break;
                }
                Err(e) => {
                    debug!(
                        device_id = %device.id,
                        metric = %metric.name,
                        error = %e,
                        "Metric query failed"
                    );
                    if worst.as_ref().map_or(true, |w| severity(&e) > severity(w)) {
                        worst = Some(e);
                    }
                }
            }
        }

        if samples.is_empty() {
            // Every metric answered with an exception: the agent is alive
            // but serves none of the catalogue.
            return Err(worst.unwrap_or_else(|| {
                PollError::Protocol("no catalogue metric returned a value".to_string())
            }));
        }
        Ok(samples)
    }
}

fn value_from_response(response: ber::Response, oid: &Oid) -> Result<SnmpValue, PollError> {
    match response.error_status {
        0 => {}
        ERR_AUTHORIZATION | ERR_NO_ACCESS => {
            return Err(PollError::Auth(format!(
                "agent refused access (error status {})",
                response.error_status
            )))
        }
        ERR_NO_SUCH_NAME => return Ok(SnmpValue::NoSuchObject),
        status => {
            return Err(PollError::Protocol(format!(
                "error status {} at index {}",
                status, response.error_index
            )))
        }
    }

    response
        .varbinds
        .into_iter()
        .find(|(returned, _)| returned == oid)
        .map(|(_, value)| value)
        .ok_or_else(|| PollError::Protocol(format!("response is missing {}", oid)))
}

/// Ranking used to pick which per-metric error describes the device
fn severity(error: &PollError) -> u8 {
    match error {
        PollError::Timeout => 0,
        PollError::Unreachable(_) => 1,
        PollError::Protocol(_) => 2,
        PollError::Auth(_) => 3,
    }
}

fn unspecified_for(address: IpAddr) -> SocketAddr {
    match address {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn seed_request_id() -> i32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos & 0x00ff_ffff) as i32
}
