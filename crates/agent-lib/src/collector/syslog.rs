//! Syslog receiver (RFC 3164 and RFC 5424)
//!
//! UDP carries one message per datagram; TCP carries newline-delimited
//! messages. Every well-formed message becomes one `syslog.<facility>`
//! sample whose value is the severity. Lines that do not parse are counted
//! and dropped.

use super::Listener;
use crate::models::{DeviceId, Sample, SourceProtocol};
use crate::pipeline::SampleSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
    "authpriv", "ftp", "ntp", "security", "console", "solaris-cron", "local0", "local1",
    "local2", "local3", "local4", "local5", "local6", "local7",
];

/// Highest valid PRI value (facility 23, severity 7)
const MAX_PRI: u16 = 191;

#[derive(Debug, Clone)]
pub struct SyslogConfig {
    pub udp_bind: Option<SocketAddr>,
    pub tcp_bind: Option<SocketAddr>,
    /// Longest accepted message in bytes
    pub max_message_len: usize,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            udp_bind: Some(SocketAddr::from(([0, 0, 0, 0], 514))),
            tcp_bind: Some(SocketAddr::from(([0, 0, 0, 0], 601))),
            max_message_len: 8192,
        }
    }
}

/// A parsed syslog message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogMessage {
    pub facility: u8,
    pub severity: u8,
    pub timestamp: Option<DateTime<Utc>>,
    pub hostname: Option<String>,
    pub app_name: Option<String>,
    pub message: String,
}

impl SyslogMessage {
    pub fn facility_name(&self) -> &'static str {
        FACILITIES
            .get(usize::from(self.facility))
            .copied()
            .unwrap_or("unknown")
    }

    /// Convert to a sample. The host field names the device, falling back
    /// to the sender address.
    pub fn to_sample(&self, sender: IpAddr, received: DateTime<Utc>) -> Sample {
        let device = match &self.hostname {
            Some(host) => DeviceId::new(host.clone()),
            None => DeviceId::new(sender.to_string()),
        };
        Sample::new(
            device,
            format!("syslog.{}", self.facility_name()),
            f64::from(self.severity),
            received,
            SourceProtocol::Syslog,
        )
    }
}

/// Parse one syslog line in either RFC 5424 or RFC 3164 format
pub fn parse_syslog(line: &str) -> Option<SyslogMessage> {
    let line = line.trim_end_matches(['\r', '\n', '\0']);
    let rest = line.strip_prefix('<')?;
    let close = rest.find('>')?;
    let pri_digits = &rest[..close];
    if pri_digits.is_empty() || pri_digits.len() > 3 || !pri_digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let pri: u16 = pri_digits.parse().ok()?;
    if pri > MAX_PRI {
        return None;
    }
    let facility = (pri / 8) as u8;
    let severity = (pri % 8) as u8;
    let body = &rest[close + 1..];

    match body.strip_prefix("1 ") {
        Some(structured) => parse_rfc5424(facility, severity, structured),
        None => Some(parse_rfc3164(facility, severity, body)),
    }
}

fn nil(field: &str) -> Option<String> {
    (field != "-").then(|| field.to_string())
}

fn parse_rfc5424(facility: u8, severity: u8, body: &str) -> Option<SyslogMessage> {
    let mut fields = body.splitn(6, ' ');
    let timestamp = fields.next()?;
    let hostname = fields.next()?;
    let app_name = fields.next()?;
    let _proc_id = fields.next()?;
    let _msg_id = fields.next()?;
    let rest = fields.next().unwrap_or("");

    let timestamp = match timestamp {
        "-" => None,
        ts => Some(DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc)),
    };

    Some(SyslogMessage {
        facility,
        severity,
        timestamp,
        hostname: nil(hostname),
        app_name: nil(app_name),
        message: skip_structured_data(rest)?.trim_start_matches('\u{feff}').to_string(),
    })
}

/// Skip the STRUCTURED-DATA element and return the free-form message
fn skip_structured_data(rest: &str) -> Option<&str> {
    if let Some(after) = rest.strip_prefix('-') {
        return Some(after.strip_prefix(' ').unwrap_or(after));
    }
    if !rest.starts_with('[') {
        return None;
    }

    let bytes = rest.as_bytes();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            b'[' if !in_quotes => depth += 1,
            b']' if !in_quotes => {
                depth = depth.checked_sub(1)?;
                if depth == 0 && bytes.get(i + 1) != Some(&b'[') {
                    let after = &rest[i + 1..];
                    return Some(after.strip_prefix(' ').unwrap_or(after));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_rfc3164(facility: u8, severity: u8, body: &str) -> SyslogMessage {
    // "Mmm dd hh:mm:ss" is always 15 bytes; single-digit days are space padded.
    let stamp = body.get(..15).and_then(|raw| {
        let with_year = format!("{} {}", Utc::now().year(), raw);
        NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S").ok()
    });

    let (timestamp, hostname, remainder) = match stamp {
        Some(naive) => {
            let after = body[15..].trim_start();
            let (host, remainder) = after.split_once(' ').unwrap_or((after, ""));
            let hostname = (!host.is_empty()).then(|| host.to_string());
            (Some(naive.and_utc()), hostname, remainder)
        }
        None => (None, None, body),
    };

    let (app_name, message) = match remainder.split_once(": ") {
        Some((tag, msg)) if !tag.is_empty() && !tag.contains(' ') => {
            let name = tag.split('[').next().unwrap_or(tag);
            (Some(name.to_string()), msg)
        }
        _ => (None, remainder),
    };

    SyslogMessage {
        facility,
        severity,
        timestamp,
        hostname,
        app_name,
        message: message.to_string(),
    }
}

/// Bound syslog sockets, ready to run
pub struct SyslogListener {
    udp: Option<UdpSocket>,
    tcp: Option<TcpListener>,
    config: SyslogConfig,
}

impl SyslogListener {
    pub async fn bind(config: SyslogConfig) -> Result<Self> {
        let udp = match config.udp_bind {
            Some(addr) => Some(
                UdpSocket::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind syslog UDP socket on {}", addr))?,
            ),
            None => None,
        };
        let tcp = match config.tcp_bind {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind syslog TCP listener on {}", addr))?,
            ),
            None => None,
        };
        Ok(Self { udp, tcp, config })
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl Listener for SyslogListener {
    fn protocol(&self) -> SourceProtocol {
        SourceProtocol::Syslog
    }

    async fn run(self: Box<Self>, sink: SampleSink, mut shutdown: broadcast::Receiver<()>) {
        info!(
            udp = ?self.udp_addr(),
            tcp = ?self.tcp_addr(),
            "Starting syslog listener"
        );

        let max_len = self.config.max_message_len;
        let mut connections = JoinSet::new();
        let mut buf = vec![0u8; 65_535];

        loop {
            tokio::select! {
                received = recv_datagram(self.udp.as_ref(), &mut buf) => match received {
                    Ok((len, peer)) => {
                        let datagram = &buf[..len];
                        if len > max_len {
                            sink.stats().record_syslog_malformed();
                            debug!(peer = %peer, len, "Oversized syslog datagram");
                            continue;
                        }
                        handle_line(&sink, &String::from_utf8_lossy(datagram), peer.ip()).await;
                    }
                    Err(e) => warn!(error = %e, "Syslog UDP receive failed"),
                },
                accepted = accept(self.tcp.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Syslog TCP connection");
                        connections.spawn(serve_connection(stream, peer, sink.clone(), max_len));
                    }
                    Err(e) => warn!(error = %e, "Syslog TCP accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => {
                    info!(connections = connections.len(), "Shutting down syslog listener");
                    break;
                }
            }
        }

        connections.shutdown().await;
    }
}

async fn recv_datagram(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, sink: SampleSink, max_len: usize) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.len() > max_len {
                    sink.stats().record_syslog_malformed();
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&sink, &line, peer.ip()).await;
            }
            Ok(None) => break,
            Err(e) => {
                // Invalid UTF-8 ends the stream for this reader.
                debug!(peer = %peer, error = %e, "Syslog TCP connection closed");
                sink.stats().record_syslog_malformed();
                break;
            }
        }
    }
}

async fn handle_line(sink: &SampleSink, line: &str, sender: IpAddr) {
    match parse_syslog(line) {
        Some(message) => {
            sink.stats().record_syslog_message();
            sink.emit(vec![message.to_sample(sender, Utc::now())]).await;
        }
        None => {
            sink.stats().record_syslog_malformed();
            debug!(sender = %sender, "Malformed syslog message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{CollectorMetrics, StructuredLogger};
    use crate::pipeline::{BusConfig, Pipeline};
    use chrono::TimeZone;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_rfc5424() {
        let msg = parse_syslog(
            "<165>1 2023-10-11T22:14:15.003Z edge-1 sshd 4321 ID47 [exampleSDID@32473 iut=\"3\" eventSource=\"App\"] login failed",
        )
        .unwrap();
        assert_eq!(msg.facility, 20);
        assert_eq!(msg.severity, 5);
        assert_eq!(msg.facility_name(), "local4");
        assert_eq!(msg.hostname.as_deref(), Some("edge-1"));
        assert_eq!(msg.app_name.as_deref(), Some("sshd"));
        assert_eq!(msg.message, "login failed");
        assert_eq!(
            msg.timestamp,
            Some(Utc.with_ymd_and_hms(2023, 10, 11, 22, 14, 15).unwrap() + chrono::Duration::milliseconds(3))
        );
    }

    #[test]
    fn test_parse_rfc5424_nil_fields() {
        let msg = parse_syslog("<14>1 - - - - - - hello").unwrap();
        assert_eq!(msg.facility_name(), "user");
        assert_eq!(msg.severity, 6);
        assert_eq!(msg.timestamp, None);
        assert_eq!(msg.hostname, None);
        assert_eq!(msg.message, "hello");
    }

    #[test]
    fn test_parse_rfc3164() {
        let msg = parse_syslog("<34>Oct  5 22:14:15 core-sw su[112]: 'su root' failed").unwrap();
        assert_eq!(msg.facility_name(), "auth");
        assert_eq!(msg.severity, 2);
        assert_eq!(msg.hostname.as_deref(), Some("core-sw"));
        assert_eq!(msg.app_name.as_deref(), Some("su"));
        assert_eq!(msg.message, "'su root' failed");
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn test_parse_rfc3164_without_header() {
        let msg = parse_syslog("<13>link down on Gi0/1\n").unwrap();
        assert_eq!(msg.hostname, None);
        assert_eq!(msg.message, "link down on Gi0/1");
    }

    #[test]
    fn test_rejects_malformed() {
        for line in ["no pri", "<>x", "<192>too high", "<1x>bad", "<12", "<165>1 bad-timestamp h a p m - x"] {
            assert!(parse_syslog(line).is_none(), "accepted {:?}", line);
        }
    }

    #[test]
    fn test_sample_uses_host_or_sender() {
        let now = Utc::now();
        let sender = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

        let named = parse_syslog("<165>1 - edge-1 app - - - x").unwrap();
        let sample = named.to_sample(sender, now);
        assert_eq!(sample.device.as_str(), "edge-1");
        assert_eq!(sample.metric, "syslog.local4");
        assert_eq!(sample.value, 5.0);
        assert_eq!(sample.source, SourceProtocol::Syslog);

        let anonymous = parse_syslog("<3>oops").unwrap();
        assert_eq!(anonymous.to_sample(sender, now).device.as_str(), "192.0.2.7");
    }

    fn loopback_config() -> SyslogConfig {
        SyslogConfig {
            udp_bind: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))),
            tcp_bind: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))),
            max_message_len: 1024,
        }
    }

    #[tokio::test]
    async fn test_listener_receives_udp_and_tcp() {
        let pipeline = Pipeline::new(
            BusConfig::default(),
            CollectorMetrics::new(),
            StructuredLogger::new("test-node"),
        );
        let mut subscription = pipeline.subscribe("test");
        let listener = SyslogListener::bind(loopback_config()).await.unwrap();
        let udp_addr = listener.udp_addr().unwrap();
        let tcp_addr = listener.tcp_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Box::new(listener).run(pipeline.sink(), shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"<11>1 - fw-1 kernel - - - drop", udp_addr).await.unwrap();
        client.send_to(b"garbage", udp_addr).await.unwrap();

        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        stream
            .write_all(b"<38>1 - core-1 sshd - - - accepted\n<9999>nope\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let sample = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push((sample.device.to_string(), sample.metric.clone(), sample.value));
        }
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            vec![
                ("core-1".to_string(), "syslog.auth".to_string(), 6.0),
                ("fw-1".to_string(), "syslog.user".to_string(), 3.0),
            ]
        );

        drop(stream);
        // Malformed lines are counted once both have been read.
        for _ in 0..50 {
            if pipeline.counters().syslog_malformed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let counters = pipeline.counters();
        assert_eq!(counters.syslog_messages, 2);
        assert_eq!(counters.syslog_malformed, 2);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
