//! Agent configuration

use anyhow::{bail, ensure, Context, Result};
use noc_agent_lib::collector::{
    BackoffPolicy, MetricOid, NetflowConfig, OidCatalogue, SchedulerConfig, SnmpConfig,
    SyslogConfig,
};
use noc_agent_lib::pipeline::BusConfig;
use noc_agent_lib::{Device, DeviceKind, ServiceConfig};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "NOC_AGENT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "noc-agent.toml";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in logs and on the status endpoint
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Maximum concurrent device polls
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Used for devices that do not set their own interval
    #[serde(default = "default_poll_interval_secs")]
    pub default_poll_interval_secs: u64,

    /// Upper bound on backed-off poll intervals
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Consecutive failures before a device is unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_snmp_port")]
    pub snmp_port: u16,

    #[serde(default = "default_snmp_timeout_ms")]
    pub snmp_timeout_ms: u64,

    #[serde(default = "default_snmp_retries")]
    pub snmp_retries: u32,

    /// Bound on one whole device poll
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Queue capacity per bus subscriber
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Address the listeners bind to
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Run the syslog listener on both transports
    #[serde(default = "default_enabled")]
    pub syslog_enabled: bool,

    #[serde(default = "default_syslog_udp_port")]
    pub syslog_udp_port: u16,

    #[serde(default = "default_syslog_tcp_port")]
    pub syslog_tcp_port: u16,

    #[serde(default = "default_syslog_max_message_len")]
    pub syslog_max_message_len: usize,

    #[serde(default = "default_enabled")]
    pub netflow_enabled: bool,

    #[serde(default = "default_netflow_port")]
    pub netflow_port: u16,

    /// Template sets remembered per exporter before the oldest is evicted
    #[serde(default = "default_netflow_max_sources_per_exporter")]
    pub netflow_max_sources_per_exporter: usize,

    #[serde(default = "default_netflow_max_template_sets")]
    pub netflow_max_template_sets: usize,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Per-kind OID sets; kinds not listed keep the built-in set
    #[serde(default)]
    pub catalogue: HashMap<DeviceKind, Vec<MetricOid>>,
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub address: IpAddr,
    /// Overrides `snmp_port`
    pub port: Option<u16>,
    pub community: Option<String>,
    #[serde(default = "default_device_kind")]
    pub kind: DeviceKind,
    /// Overrides `default_poll_interval_secs`
    pub interval_secs: Option<u64>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "noc-agent".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_worker_pool_size() -> usize {
    32
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_snmp_port() -> u16 {
    161
}

fn default_snmp_timeout_ms() -> u64 {
    2000
}

fn default_snmp_retries() -> u32 {
    1
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_publish_timeout_ms() -> u64 {
    50
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_enabled() -> bool {
    true
}

fn default_syslog_udp_port() -> u16 {
    514
}

fn default_syslog_tcp_port() -> u16 {
    601
}

fn default_syslog_max_message_len() -> usize {
    8192
}

fn default_netflow_port() -> u16 {
    2055
}

fn default_netflow_max_sources_per_exporter() -> usize {
    16
}

fn default_netflow_max_template_sets() -> usize {
    1024
}

fn default_device_kind() -> DeviceKind {
    DeviceKind::Other
}

impl AgentConfig {
    /// Load from the file named by `NOC_AGENT_CONFIG` (or `noc-agent.toml`)
    /// with `NOC_AGENT_*` environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(Path::new(&path))
    }

    /// Load from `path`; a missing file is not an error
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("NOC_AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let parsed: AgentConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject values the collector cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be positive");
        ensure!(self.worker_pool_size > 0, "worker_pool_size must be non-zero");
        ensure!(
            self.default_poll_interval_secs > 0,
            "default_poll_interval_secs must be positive"
        );
        ensure!(self.max_backoff_secs > 0, "max_backoff_secs must be positive");
        ensure!(self.failure_threshold > 0, "failure_threshold must be non-zero");
        ensure!(self.snmp_timeout_ms > 0, "snmp_timeout_ms must be positive");
        ensure!(self.poll_timeout_secs > 0, "poll_timeout_secs must be positive");
        ensure!(self.bus_capacity > 0, "bus_capacity must be non-zero");
        ensure!(self.publish_timeout_ms > 0, "publish_timeout_ms must be positive");
        ensure!(
            self.netflow_max_sources_per_exporter > 0 && self.netflow_max_template_sets > 0,
            "netflow template limits must be non-zero"
        );

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("device at {} has an empty id", device.address);
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id '{}'", device.id);
            }
            if device.interval_secs == Some(0) {
                bail!("device '{}' has a zero poll interval", device.id);
            }
        }

        for (kind, metrics) in &self.catalogue {
            if metrics.is_empty() {
                bail!("catalogue for '{}' lists no OIDs", kind.as_str());
            }
        }
        Ok(())
    }

    pub fn service_config(&self) -> ServiceConfig {
        let bind = |port: u16| SocketAddr::new(self.listen_address, port);
        let syslog = self.syslog_enabled.then(|| SyslogConfig {
            udp_bind: Some(bind(self.syslog_udp_port)),
            tcp_bind: Some(bind(self.syslog_tcp_port)),
            max_message_len: self.syslog_max_message_len,
        });

        ServiceConfig {
            node_name: self.node_name.clone(),
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_millis(self.tick_interval_ms),
                worker_pool_size: self.worker_pool_size,
            },
            backoff: BackoffPolicy {
                max_interval: Duration::from_secs(self.max_backoff_secs),
                failure_threshold: self.failure_threshold,
            },
            bus: BusConfig {
                capacity: self.bus_capacity,
                publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            },
            snmp: SnmpConfig {
                request_timeout: Duration::from_millis(self.snmp_timeout_ms),
                retries: self.snmp_retries,
                poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            },
            syslog,
            netflow: self
                .netflow_enabled
                .then(|| NetflowConfig {
                    bind: bind(self.netflow_port),
                    max_sources_per_exporter: self.netflow_max_sources_per_exporter,
                    max_template_sets: self.netflow_max_template_sets,
                }),
            ..ServiceConfig::default()
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|entry| {
                let interval = entry
                    .interval_secs
                    .unwrap_or(self.default_poll_interval_secs);
                let device = Device::new(entry.id.as_str(), entry.address, entry.kind)
                    .with_port(entry.port.unwrap_or(self.snmp_port))
                    .with_interval(Duration::from_secs(interval));
                match &entry.community {
                    Some(community) => device.with_community(community.as_str()),
                    None => device,
                }
            })
            .collect()
    }

    /// Built-in catalogue with configured kinds replaced
    pub fn catalogue(&self) -> OidCatalogue {
        let mut catalogue = OidCatalogue::default();
        for (kind, metrics) in &self.catalogue {
            catalogue.set(*kind, metrics.clone());
        }
        catalogue
    }
}
