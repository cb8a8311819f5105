//! NetFlow v5: fixed header and fixed-size records

use super::reader::Reader;
use super::{export_time, uptime_to_wall, FlowHeader, FlowPacket};
use crate::error::DecodeError;
use crate::models::FlowRecord;
use std::net::IpAddr;

pub const V5_HEADER_LEN: usize = 24;
pub const V5_RECORD_LEN: usize = 48;
/// Largest record count a v5 exporter may declare
pub const V5_MAX_RECORDS: u16 = 30;

pub(super) fn decode(buf: &[u8], exporter: IpAddr) -> Result<FlowPacket, DecodeError> {
    let mut reader = Reader::new(buf);
    let header = decode_header(&mut reader)?;

    if header.count > V5_MAX_RECORDS {
        return Err(DecodeError::Malformed(format!(
            "v5 header declares {} records, maximum is {}",
            header.count, V5_MAX_RECORDS
        )));
    }

    // Check the whole declared length up front so nothing is emitted from a
    // packet that ends early.
    let needed = usize::from(header.count) * V5_RECORD_LEN;
    if reader.remaining() < needed {
        return Err(DecodeError::Truncated {
            offset: reader.position(),
            needed,
            available: reader.remaining(),
        });
    }

    let records = (0..header.count)
        .map(|_| decode_record(&mut reader, &header, exporter))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FlowPacket {
        header,
        records,
        templates: Vec::new(),
        skipped_flowsets: 0,
    })
}

fn decode_header(reader: &mut Reader<'_>) -> Result<FlowHeader, DecodeError> {
    let version = reader.u16()?;
    let count = reader.u16()?;
    let sys_uptime_ms = reader.u32()?;
    let secs = reader.u32()?;
    let nanos = reader.u32()?;
    let sequence = reader.u32()?;
    let engine_type = reader.u8()?;
    let engine_id = reader.u8()?;
    let _sampling_interval = reader.u16()?;

    Ok(FlowHeader {
        version,
        count,
        sys_uptime_ms,
        export_time: export_time(secs, nanos)?,
        sequence,
        source_id: (u32::from(engine_type) << 8) | u32::from(engine_id),
    })
}

fn decode_record(
    reader: &mut Reader<'_>,
    header: &FlowHeader,
    exporter: IpAddr,
) -> Result<FlowRecord, DecodeError> {
    let src_addr = reader.ipv4()?;
    let dst_addr = reader.ipv4()?;
    let _next_hop = reader.ipv4()?;
    let _input_if = reader.u16()?;
    let _output_if = reader.u16()?;
    let packets = reader.u32()?;
    let octets = reader.u32()?;
    let first = reader.u32()?;
    let last = reader.u32()?;
    let src_port = reader.u16()?;
    let dst_port = reader.u16()?;
    reader.skip(1)?;
    let tcp_flags = reader.u8()?;
    let protocol = reader.u8()?;
    let tos = reader.u8()?;
    // src_as, dst_as, src_mask, dst_mask, pad
    reader.skip(8)?;

    Ok(FlowRecord {
        src_addr: IpAddr::V4(src_addr),
        dst_addr: IpAddr::V4(dst_addr),
        src_port,
        dst_port,
        protocol,
        tcp_flags,
        tos,
        octets: u64::from(octets),
        packets: u64::from(packets),
        start: uptime_to_wall(header, first),
        end: uptime_to_wall(header, last),
        exporter,
    })
}
