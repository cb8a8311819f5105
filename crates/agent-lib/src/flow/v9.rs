//! NetFlow v9: flowsets described by templates

use super::reader::Reader;
use super::{
    export_time, uptime_to_wall, FlowHeader, FlowPacket, Template, TemplateField, TemplateSet,
};
use crate::error::DecodeError;
use crate::models::FlowRecord;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

pub const V9_HEADER_LEN: usize = 20;
/// Data flowset ids start here; lower ids are control flowsets
pub const V9_MIN_TEMPLATE_ID: u16 = 256;

const TEMPLATE_FLOWSET: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET: u16 = 1;

// Field type numbers used here
const IN_BYTES: u16 = 1;
const IN_PKTS: u16 = 2;
const PROTOCOL: u16 = 4;
const SRC_TOS: u16 = 5;
const TCP_FLAGS: u16 = 6;
const L4_SRC_PORT: u16 = 7;
const IPV4_SRC_ADDR: u16 = 8;
const L4_DST_PORT: u16 = 11;
const IPV4_DST_ADDR: u16 = 12;
const LAST_SWITCHED: u16 = 21;
const FIRST_SWITCHED: u16 = 22;
const IPV6_SRC_ADDR: u16 = 27;
const IPV6_DST_ADDR: u16 = 28;

pub(super) fn decode(
    buf: &[u8],
    exporter: IpAddr,
    known: &TemplateSet,
) -> Result<FlowPacket, DecodeError> {
    let mut reader = Reader::new(buf);
    let header = decode_header(&mut reader)?;

    let mut local: HashMap<u16, Template> = HashMap::new();
    let mut templates = Vec::new();
    let mut records = Vec::new();
    let mut skipped_flowsets = 0usize;

    // Anything shorter than a flowset header is padding.
    while reader.remaining() >= 4 {
        let flowset_id = reader.u16()?;
        let length = usize::from(reader.u16()?);
        if length < 4 {
            return Err(DecodeError::Malformed(format!(
                "flowset {} at offset {} has length {}",
                flowset_id,
                reader.position() - 4,
                length
            )));
        }
        let mut body = reader.sub(length - 4)?;

        match flowset_id {
            TEMPLATE_FLOWSET => {
                for template in decode_templates(&mut body)? {
                    local.insert(template.id, template.clone());
                    templates.push(template);
                }
            }
            OPTIONS_TEMPLATE_FLOWSET => {}
            id if id < V9_MIN_TEMPLATE_ID => {}
            id => match local.get(&id).or_else(|| known.get(id)) {
                Some(template) => {
                    decode_data(&mut body, template, &header, exporter, &mut records)?;
                }
                None => skipped_flowsets += 1,
            },
        }
    }

    Ok(FlowPacket {
        header,
        records,
        templates,
        skipped_flowsets,
    })
}

fn decode_header(reader: &mut Reader<'_>) -> Result<FlowHeader, DecodeError> {
    let version = reader.u16()?;
    let count = reader.u16()?;
    let sys_uptime_ms = reader.u32()?;
    let secs = reader.u32()?;
    let sequence = reader.u32()?;
    let source_id = reader.u32()?;

    Ok(FlowHeader {
        version,
        count,
        sys_uptime_ms,
        export_time: export_time(secs, 0)?,
        sequence,
        source_id,
    })
}

fn decode_templates(body: &mut Reader<'_>) -> Result<Vec<Template>, DecodeError> {
    let mut templates = Vec::new();
    while body.remaining() >= 4 {
        let id = body.u16()?;
        let field_count = body.u16()?;
        if id < V9_MIN_TEMPLATE_ID {
            return Err(DecodeError::Malformed(format!("template id {} is reserved", id)));
        }

        let fields = (0..field_count)
            .map(|_| -> Result<TemplateField, DecodeError> {
                Ok(TemplateField {
                    field_type: body.u16()?,
                    length: body.u16()?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let template = Template { id, fields };
        if template.record_len() == 0 {
            return Err(DecodeError::Malformed(format!(
                "template {} describes zero-length records",
                id
            )));
        }
        templates.push(template);
    }
    Ok(templates)
}

fn decode_data(
    body: &mut Reader<'_>,
    template: &Template,
    header: &FlowHeader,
    exporter: IpAddr,
    records: &mut Vec<FlowRecord>,
) -> Result<(), DecodeError> {
    let record_len = template.record_len();
    // Trailing bytes shorter than one record are padding.
    while body.remaining() >= record_len {
        let mut record = body.sub(record_len)?;
        records.push(decode_record(&mut record, template, header, exporter)?);
    }
    Ok(())
}

fn decode_record(
    reader: &mut Reader<'_>,
    template: &Template,
    header: &FlowHeader,
    exporter: IpAddr,
) -> Result<FlowRecord, DecodeError> {
    let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let mut record = FlowRecord {
        src_addr: unspecified,
        dst_addr: unspecified,
        src_port: 0,
        dst_port: 0,
        protocol: 0,
        tcp_flags: 0,
        tos: 0,
        octets: 0,
        packets: 0,
        start: header.export_time,
        end: header.export_time,
        exporter,
    };

    for field in &template.fields {
        let len = usize::from(field.length);
        match (field.field_type, len) {
            (IPV4_SRC_ADDR, 4) => record.src_addr = IpAddr::V4(reader.ipv4()?),
            (IPV4_DST_ADDR, 4) => record.dst_addr = IpAddr::V4(reader.ipv4()?),
            (IPV6_SRC_ADDR, 16) => record.src_addr = IpAddr::V6(reader.ipv6()?),
            (IPV6_DST_ADDR, 16) => record.dst_addr = IpAddr::V6(reader.ipv6()?),
            (IN_BYTES, 1..=8) => record.octets = reader.uint(len)?,
            (IN_PKTS, 1..=8) => record.packets = reader.uint(len)?,
            (PROTOCOL, 1) => record.protocol = reader.u8()?,
            (SRC_TOS, 1) => record.tos = reader.u8()?,
            (TCP_FLAGS, 1) => record.tcp_flags = reader.u8()?,
            (L4_SRC_PORT, 2) => record.src_port = reader.u16()?,
            (L4_DST_PORT, 2) => record.dst_port = reader.u16()?,
            (FIRST_SWITCHED, 4) => record.start = uptime_to_wall(header, reader.u32()?),
            (LAST_SWITCHED, 4) => record.end = uptime_to_wall(header, reader.u32()?),
            _ => reader.skip(len)?,
        }
    }

    Ok(record)
}
