//! NetFlow export receiver
//!
//! Decodes each datagram, keeps v9 templates per (exporter, source id),
//! aggregates every packet into per-exporter samples and republishes the
//! raw records on the flow bus.

use super::Listener;
use crate::error::{BusError, DecodeError};
use crate::flow::{self, TemplateSet};
use crate::models::{DeviceId, FlowRecord, Sample, SourceProtocol};
use crate::observability::StructuredLogger;
use crate::pipeline::{EventBus, SampleSink, FLOW_BUS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone)]
pub struct NetflowConfig {
    pub bind: SocketAddr,
    /// Template sets kept per exporter address, one per v9 source id
    pub max_sources_per_exporter: usize,
    /// Template sets kept across all exporters
    pub max_template_sets: usize,
}

impl Default for NetflowConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 2055)),
            max_sources_per_exporter: 16,
            max_template_sets: 1024,
        }
    }
}

type TemplateKey = (IpAddr, u32);

#[derive(Debug)]
struct TemplateEntry {
    set: TemplateSet,
    /// Packet sequence number of the last use
    last_seen: u64,
}

/// Per-exporter decode state and fan-out
#[derive(Debug)]
pub(crate) struct FlowProcessor {
    templates: HashMap<TemplateKey, TemplateEntry>,
    no_templates: TemplateSet,
    max_per_exporter: usize,
    max_total: usize,
    packets: u64,
    flows: EventBus<FlowRecord>,
    logger: StructuredLogger,
}

impl FlowProcessor {
    pub(crate) fn new(
        config: &NetflowConfig,
        flows: EventBus<FlowRecord>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            templates: HashMap::new(),
            no_templates: TemplateSet::new(),
            max_per_exporter: config.max_sources_per_exporter.max(1),
            max_total: config.max_template_sets.max(1),
            packets: 0,
            flows,
            logger,
        }
    }

    /// Evict least recently used sets until `key` fits under both limits
    fn make_room(&mut self, key: TemplateKey) -> usize {
        let exporter = key.0;
        let mut evicted = 0;
        while self.templates.keys().filter(|(ip, _)| *ip == exporter).count()
            >= self.max_per_exporter
        {
            if !self.evict_oldest(|(ip, _)| *ip == exporter) {
                break;
            }
            evicted += 1;
        }
        while self.templates.len() >= self.max_total {
            if !self.evict_oldest(|_| true) {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn evict_oldest(&mut self, matches: impl Fn(&TemplateKey) -> bool) -> bool {
        let oldest = self
            .templates
            .iter()
            .filter(|(key, _)| matches(key))
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(key, _)| *key);
        match oldest {
            Some(key) => {
                self.templates.remove(&key);
                debug!(exporter = %key.0, source_id = key.1, "Evicted flow templates");
                true
            }
            None => false,
        }
    }

    pub(crate) fn template_sets(&self) -> usize {
        self.templates.len()
    }

    /// Handle one export datagram; returns the number of records decoded
    pub(crate) async fn process(
        &mut self,
        sink: &SampleSink,
        datagram: &[u8],
        exporter: SocketAddr,
        received: DateTime<Utc>,
    ) -> Result<usize, DecodeError> {
        self.packets += 1;
        let seq = self.packets;
        let key = (exporter.ip(), flow::peek_source_id(datagram).unwrap_or(0));
        let known = match self.templates.get_mut(&key) {
            Some(entry) => {
                entry.last_seen = seq;
                &entry.set
            }
            None => &self.no_templates,
        };

        let packet = match flow::decode(datagram, exporter.ip(), known) {
            Ok(packet) => packet,
            Err(e) => {
                sink.stats().record_decode_error();
                self.logger
                    .log_flow_decode_failure(exporter, datagram.len(), &e.to_string());
                return Err(e);
            }
        };

        if !packet.templates.is_empty() {
            debug!(
                exporter = %exporter,
                source_id = key.1,
                templates = packet.templates.len(),
                "Learned flow templates"
            );
            if !self.templates.contains_key(&key) {
                let evicted = self.make_room(key);
                if evicted > 0 {
                    sink.stats().record_template_evictions(evicted);
                }
            }
            self.templates
                .entry(key)
                .or_insert_with(|| TemplateEntry {
                    set: TemplateSet::new(),
                    last_seen: seq,
                })
                .set
                .merge(packet.templates);
        }

        let records = packet.records;
        sink.stats()
            .record_flow_packet(records.len(), packet.skipped_flowsets);
        if records.is_empty() {
            return Ok(0);
        }

        sink.emit(aggregate(&records, exporter.ip(), received)).await;

        let count = records.len();
        for record in records {
            match self.flows.publish(record).await {
                Ok(_) => {}
                Err(BusError::BackpressureDrop { dropped }) => {
                    self.logger.log_backpressure_drop(
                        FLOW_BUS,
                        &exporter.ip().to_string(),
                        dropped,
                    );
                }
                Err(BusError::Closed) => break,
            }
        }

        Ok(count)
    }
}

/// Per-packet totals for one exporter
fn aggregate(records: &[FlowRecord], exporter: IpAddr, at: DateTime<Utc>) -> Vec<Sample> {
    let mut octets = 0u64;
    let mut packets = 0u64;
    let mut by_protocol = [0u64; 4];
    for record in records {
        octets = octets.saturating_add(record.octets);
        packets = packets.saturating_add(record.packets);
        let bucket = match record.protocol {
            PROTO_TCP => 0,
            PROTO_UDP => 1,
            PROTO_ICMP => 2,
            _ => 3,
        };
        by_protocol[bucket] = by_protocol[bucket].saturating_add(record.octets);
    }

    let device = DeviceId::new(exporter.to_string());
    let sample = |metric: &str, value: u64| {
        Sample::new(
            device.clone(),
            metric,
            value as f64,
            at,
            SourceProtocol::Netflow,
        )
    };

    let mut samples = vec![
        sample("netflow.flows", records.len() as u64),
        sample("netflow.octets", octets),
        sample("netflow.packets", packets),
    ];
    for (name, total) in ["tcp", "udp", "icmp", "other"].iter().zip(by_protocol) {
        if total > 0 {
            samples.push(sample(&format!("netflow.octets.{}", name), total));
        }
    }
    samples
}

/// Bound NetFlow socket, ready to run
pub struct NetflowListener {
    socket: UdpSocket,
    processor: FlowProcessor,
}

impl NetflowListener {
    pub async fn bind(
        config: NetflowConfig,
        flows: EventBus<FlowRecord>,
        logger: StructuredLogger,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .with_context(|| format!("Failed to bind NetFlow socket on {}", config.bind))?;
        Ok(Self {
            socket,
            processor: FlowProcessor::new(&config, flows, logger),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[async_trait]
impl Listener for NetflowListener {
    fn protocol(&self) -> SourceProtocol {
        SourceProtocol::Netflow
    }

    async fn run(self: Box<Self>, sink: SampleSink, mut shutdown: broadcast::Receiver<()>) {
        let NetflowListener {
            socket,
            mut processor,
        } = *self;
        info!(addr = ?socket.local_addr().ok(), "Starting NetFlow listener");

        let mut buf = vec![0u8; 65_535];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, exporter)) => {
                        // Decode failures are already counted and logged.
                        let _ = processor.process(&sink, &buf[..len], exporter, Utc::now()).await;
                    }
                    Err(e) => warn!(error = %e, "NetFlow receive failed"),
                },
                _ = shutdown.recv() => {
                    info!(
                        template_sets = processor.template_sets(),
                        "Shutting down NetFlow listener"
                    );
                    break;
                }
            }
        }
    }
}
