//! Minimal BER codec for SNMPv2c GetRequest / Response messages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;
const TAG_GET_REQUEST: u8 = 0xa0;
const TAG_RESPONSE: u8 = 0xa2;

/// SNMP version field value for v2c
pub const SNMP_V2C: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnmpCodecError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),

    #[error("expected tag {expected:#04x}, found {found:#04x} at offset {offset}")]
    UnexpectedTag { expected: u8, found: u8, offset: usize },

    #[error("unsupported length encoding at offset {0}")]
    InvalidLength(usize),

    #[error("invalid object identifier: {0}")]
    InvalidOid(String),

    #[error("integer does not fit at offset {0}")]
    IntegerOverflow(usize),

    #[error("unsupported value tag {0:#04x}")]
    UnsupportedValue(u8),
}

/// An SNMP object identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(Vec<u32>);

impl Oid {
    pub fn arcs(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for Oid {
    type Err = SnmpCodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let arcs = s
            .trim_start_matches('.')
            .split('.')
            .map(|arc| arc.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SnmpCodecError::InvalidOid(s.to_string()))?;
        if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
            return Err(SnmpCodecError::InvalidOid(s.to_string()));
        }
        Ok(Self(arcs))
    }
}

impl TryFrom<String> for Oid {
    type Error = SnmpCodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.to_string()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// A varbind value
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    /// Numeric reading of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SnmpValue::Integer(v) => Some(*v as f64),
            SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) | SnmpValue::TimeTicks(v) => {
                Some(f64::from(*v))
            }
            SnmpValue::Counter64(v) => Some(*v as f64),
            SnmpValue::OctetString(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok()),
            _ => None,
        }
    }

    /// True for the v2c "no value here" exceptions
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            SnmpValue::NoSuchObject | SnmpValue::NoSuchInstance | SnmpValue::EndOfMibView
        )
    }
}

/// A decoded Response PDU
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub community: Vec<u8>,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<(Oid, SnmpValue)>,
}

/// Encode a v2c GetRequest for the given OIDs
pub fn encode_get_request(community: &str, request_id: i32, oids: &[Oid]) -> Vec<u8> {
    let mut varbinds = Vec::new();
    for oid in oids {
        let mut varbind = Vec::new();
        write_tlv(TAG_OID, &encode_oid(oid), &mut varbind);
        write_tlv(TAG_NULL, &[], &mut varbind);
        write_tlv(TAG_SEQUENCE, &varbind, &mut varbinds);
    }

    let mut pdu = Vec::new();
    write_tlv(TAG_INTEGER, &encode_integer(i64::from(request_id)), &mut pdu);
    write_tlv(TAG_INTEGER, &encode_integer(0), &mut pdu);
    write_tlv(TAG_INTEGER, &encode_integer(0), &mut pdu);
    write_tlv(TAG_SEQUENCE, &varbinds, &mut pdu);

    let mut message = Vec::new();
    write_tlv(TAG_INTEGER, &encode_integer(SNMP_V2C), &mut message);
    write_tlv(TAG_OCTET_STRING, community.as_bytes(), &mut message);
    write_tlv(TAG_GET_REQUEST, &pdu, &mut message);

    let mut out = Vec::with_capacity(message.len() + 4);
    write_tlv(TAG_SEQUENCE, &message, &mut out);
    out
}

/// Decode a v2c Response message
pub fn decode_response(buf: &[u8]) -> Result<Response, SnmpCodecError> {
    let mut outer = Decoder::new(buf);
    let mut message = outer.expect(TAG_SEQUENCE)?;

    let _version = decode_integer(message.expect(TAG_INTEGER)?.rest(), message.offset())?;
    let community = message.expect(TAG_OCTET_STRING)?.rest().to_vec();
    let mut pdu = message.expect(TAG_RESPONSE)?;

    let request_id = decode_integer(pdu.expect(TAG_INTEGER)?.rest(), pdu.offset())?;
    let request_id =
        i32::try_from(request_id).map_err(|_| SnmpCodecError::IntegerOverflow(pdu.offset()))?;
    let error_status = decode_integer(pdu.expect(TAG_INTEGER)?.rest(), pdu.offset())?;
    let error_index = decode_integer(pdu.expect(TAG_INTEGER)?.rest(), pdu.offset())?;

    let mut list = pdu.expect(TAG_SEQUENCE)?;
    let mut varbinds = Vec::new();
    while !list.is_empty() {
        let mut varbind = list.expect(TAG_SEQUENCE)?;
        let oid_offset = varbind.offset();
        let oid = decode_oid(varbind.expect(TAG_OID)?.rest(), oid_offset)?;
        let value_offset = varbind.offset();
        let (tag, content) = varbind.tlv()?;
        varbinds.push((oid, decode_value(tag, content, value_offset)?));
    }

    Ok(Response {
        community,
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}

fn write_tlv(tag: u8, content: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        out.push(0x80 | (bytes.len() - first) as u8);
        out.extend_from_slice(&bytes[first..]);
    }
    out.extend_from_slice(content);
}

/// Minimal two's complement encoding
fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn encode_oid(oid: &Oid) -> Vec<u8> {
    let arcs = oid.arcs();
    let mut out = Vec::new();
    push_base128(arcs[0] * 40 + arcs[1], &mut out);
    for arc in &arcs[2..] {
        push_base128(*arc, &mut out);
    }
    out
}

fn push_base128(mut value: u32, out: &mut Vec<u8>) {
    let mut chunk = [0u8; 5];
    let mut i = chunk.len();
    loop {
        i -= 1;
        chunk[i] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = chunk.len() - 1;
    for (pos, byte) in chunk.iter().enumerate().skip(i) {
        out.push(if pos == last { *byte } else { byte | 0x80 });
    }
}

fn decode_integer(content: &[u8], offset: usize) -> Result<i64, SnmpCodecError> {
    if content.is_empty() || content.len() > 8 {
        return Err(SnmpCodecError::IntegerOverflow(offset));
    }
    let init: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(init, |acc, byte| (acc << 8) | i64::from(*byte)))
}

fn decode_unsigned(content: &[u8], offset: usize) -> Result<u64, SnmpCodecError> {
    let content = match content {
        [0x00, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if content.is_empty() || content.len() > 8 {
        return Err(SnmpCodecError::IntegerOverflow(offset));
    }
    Ok(content
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
}

fn decode_u32(content: &[u8], offset: usize) -> Result<u32, SnmpCodecError> {
    u32::try_from(decode_unsigned(content, offset)?)
        .map_err(|_| SnmpCodecError::IntegerOverflow(offset))
}

fn decode_oid(content: &[u8], offset: usize) -> Result<Oid, SnmpCodecError> {
    let mut subids = Vec::new();
    let mut current: u32 = 0;
    let mut pending = false;
    for byte in content {
        if current > (u32::MAX >> 7) {
            return Err(SnmpCodecError::IntegerOverflow(offset));
        }
        current = (current << 7) | u32::from(byte & 0x7f);
        pending = byte & 0x80 != 0;
        if !pending {
            subids.push(current);
            current = 0;
        }
    }
    if pending || subids.is_empty() {
        return Err(SnmpCodecError::InvalidOid(format!("bad encoding at offset {}", offset)));
    }

    let first = subids[0];
    let (a, b) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    let mut arcs = vec![a, b];
    arcs.extend_from_slice(&subids[1..]);
    Ok(Oid(arcs))
}

fn decode_value(tag: u8, content: &[u8], offset: usize) -> Result<SnmpValue, SnmpCodecError> {
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer(content, offset)?),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => SnmpValue::ObjectId(decode_oid(content, offset)?),
        TAG_IP_ADDRESS => {
            let octets: [u8; 4] = content
                .try_into()
                .map_err(|_| SnmpCodecError::InvalidLength(offset))?;
            SnmpValue::IpAddress(octets)
        }
        TAG_COUNTER32 => SnmpValue::Counter32(decode_u32(content, offset)?),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_u32(content, offset)?),
        TAG_TIMETICKS => SnmpValue::TimeTicks(decode_u32(content, offset)?),
        TAG_OPAQUE => SnmpValue::Opaque(content.to_vec()),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content, offset)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => return Err(SnmpCodecError::UnsupportedValue(other)),
    })
}

/// Cursor over a run of TLVs
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, base: 0 }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn byte(&mut self) -> Result<u8, SnmpCodecError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(SnmpCodecError::Truncated(self.offset()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn length(&mut self) -> Result<usize, SnmpCodecError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 {
            return Err(SnmpCodecError::InvalidLength(self.offset()));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | usize::from(self.byte()?);
        }
        Ok(len)
    }

    /// Next TLV as (tag, content)
    fn tlv(&mut self) -> Result<(u8, &'a [u8]), SnmpCodecError> {
        let tag = self.byte()?;
        let len = self.length()?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(SnmpCodecError::Truncated(self.base + start))?;
        self.pos = end;
        Ok((tag, &self.buf[start..end]))
    }

    /// Next TLV, which must carry `expected`, as a nested decoder
    fn expect(&mut self, expected: u8) -> Result<Decoder<'a>, SnmpCodecError> {
        let offset = self.offset();
        let (found, content) = self.tlv()?;
        if found != expected {
            return Err(SnmpCodecError::UnexpectedTag {
                expected,
                found,
                offset,
            });
        }
        Ok(Decoder {
            buf: content,
            pos: 0,
            base: self.offset() - content.len(),
        })
    }
}
