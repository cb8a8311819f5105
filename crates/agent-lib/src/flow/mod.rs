//! NetFlow export packet decoding
//!
//! A pure transform from one export datagram to structured flow records.
//! Version 5 packets carry fixed 48-byte records. Version 9 packets carry
//! template-described records; templates seen earlier are supplied by the
//! caller as a read-only [`TemplateSet`] and templates found in the packet
//! are handed back in [`FlowPacket::templates`]. Nothing is retained between
//! calls, and any error means no records at all.
//!
//! Sequence numbers are reported but never used for deduplication.

mod reader;
mod v5;
mod v9;

pub use v5::{V5_HEADER_LEN, V5_MAX_RECORDS, V5_RECORD_LEN};
pub use v9::{V9_HEADER_LEN, V9_MIN_TEMPLATE_ID};

#[cfg(test)]
pub(crate) use v5::testutil::build_v5_packet;
#[cfg(test)]
pub(crate) use v9::testutil::V9PacketBuilder;

use crate::error::DecodeError;
use crate::models::FlowRecord;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::net::IpAddr;

/// Decoded export header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowHeader {
    pub version: u16,
    /// Record count as declared by the exporter
    pub count: u16,
    /// Exporter uptime in milliseconds at export time
    pub sys_uptime_ms: u32,
    pub export_time: DateTime<Utc>,
    pub sequence: u32,
    /// v9 source id, or `engine_type << 8 | engine_id` for v5
    pub source_id: u32,
}

/// One field of a v9 template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    pub field_type: u16,
    pub length: u16,
}

/// A v9 data template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: u16,
    pub fields: Vec<TemplateField>,
}

impl Template {
    pub fn record_len(&self) -> usize {
        self.fields.iter().map(|field| usize::from(field.length)).sum()
    }
}

/// Templates known for one (exporter, source id)
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<u16, Template>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u16) -> Option<&Template> {
        self.templates.get(&id)
    }

    /// Add or replace templates; later definitions win
    pub fn merge(&mut self, templates: impl IntoIterator<Item = Template>) {
        for template in templates {
            self.templates.insert(template.id, template);
        }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Result of decoding one export packet
#[derive(Debug, Clone, PartialEq)]
pub struct FlowPacket {
    pub header: FlowHeader,
    pub records: Vec<FlowRecord>,
    /// Templates defined in this packet (v9 only)
    pub templates: Vec<Template>,
    /// Data flowsets skipped because their template is unknown (v9 only)
    pub skipped_flowsets: usize,
}

/// Read the version field without decoding anything else
pub fn peek_version(buf: &[u8]) -> Result<u16, DecodeError> {
    reader::Reader::new(buf).u16()
}

/// Source id of a v9 packet, used to pick the template set before decoding
pub fn peek_source_id(buf: &[u8]) -> Option<u32> {
    let mut reader = reader::Reader::new(buf);
    if reader.u16().ok()? != 9 {
        return None;
    }
    reader.skip(14).ok()?;
    reader.u32().ok()
}

/// Decode a packet of whatever version its header declares
pub fn decode(
    buf: &[u8],
    exporter: IpAddr,
    known: &TemplateSet,
) -> Result<FlowPacket, DecodeError> {
    match peek_version(buf)? {
        5 => v5::decode(buf, exporter),
        9 => v9::decode(buf, exporter, known),
        other => Err(DecodeError::UnsupportedVersion(other)),
    }
}

/// Decode a packet that must be of the given version
pub fn decode_version(
    buf: &[u8],
    version: u16,
    exporter: IpAddr,
    known: &TemplateSet,
) -> Result<FlowPacket, DecodeError> {
    let actual = peek_version(buf)?;
    if actual != version {
        return Err(DecodeError::VersionMismatch {
            expected: version,
            actual,
        });
    }
    decode(buf, exporter, known)
}

fn export_time(secs: u32, nanos: u32) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_opt(i64::from(secs), nanos)
        .single()
        .ok_or_else(|| DecodeError::Malformed(format!("invalid export time {}.{}", secs, nanos)))
}

/// Convert an uptime-relative timestamp into wall-clock time
fn uptime_to_wall(header: &FlowHeader, uptime_ms: u32) -> DateTime<Utc> {
    let age_ms = header.sys_uptime_ms.wrapping_sub(uptime_ms);
    header.export_time - Duration::milliseconds(i64::from(age_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn exporter() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
    }

    #[test]
    fn test_dispatch_by_version() {
        let packet = build_v5_packet(2, 2);
        let decoded = decode(&packet, exporter(), &TemplateSet::new()).unwrap();
        assert_eq!(decoded.header.version, 5);
        assert_eq!(decoded.records.len(), 2);
    }

    #[test]
    fn test_unsupported_version() {
        let mut packet = build_v5_packet(1, 1);
        packet[1] = 7;
        assert_eq!(
            decode(&packet, exporter(), &TemplateSet::new()),
            Err(DecodeError::UnsupportedVersion(7))
        );
    }

    #[test]
    fn test_decode_version_rejects_mismatch() {
        let packet = build_v5_packet(1, 1);
        assert_eq!(
            decode_version(&packet, 9, exporter(), &TemplateSet::new()),
            Err(DecodeError::VersionMismatch {
                expected: 9,
                actual: 5
            })
        );
    }

    #[test]
    fn test_peek_source_id() {
        let v9 = V9PacketBuilder::new().ipv4_template(256).build();
        assert_eq!(peek_source_id(&v9), Some(99));
        assert_eq!(peek_source_id(&build_v5_packet(1, 1)), None);
        assert_eq!(peek_source_id(&v9[..10]), None);
    }

    #[test]
    fn test_empty_buffer_is_truncated() {
        assert!(matches!(
            decode(&[], exporter(), &TemplateSet::new()),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_uptime_conversion_handles_wrap() {
        let header = FlowHeader {
            version: 5,
            count: 0,
            sys_uptime_ms: 500,
            export_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            sequence: 0,
            source_id: 0,
        };
        // Flow started 1000ms before export, across the u32 uptime wrap.
        let start = uptime_to_wall(&header, u32::MAX - 499);
        assert_eq!(
            start,
            Utc.timestamp_opt(1_699_999_999, 0).unwrap()
        );
    }
}
