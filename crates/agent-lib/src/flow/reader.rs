//! Bounds-checked big-endian field extraction

use crate::error::DecodeError;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Offset of `buf` within the whole packet, for error reporting
    base: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            base: 0,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.base + self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                offset: self.position(),
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Split off the next `n` bytes as their own reader
    pub(crate) fn sub(&mut self, n: usize) -> Result<Reader<'a>, DecodeError> {
        let base = self.position();
        let buf = self.take(n)?;
        Ok(Reader { buf, pos: 0, base })
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Unsigned integer of 1 to 8 bytes
    pub(crate) fn uint(&mut self, len: usize) -> Result<u64, DecodeError> {
        if len == 0 || len > 8 {
            return Err(DecodeError::Malformed(format!(
                "unsupported integer width {} at offset {}",
                len,
                self.position()
            )));
        }
        Ok(self
            .take(len)?
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    pub(crate) fn ipv4(&mut self) -> Result<Ipv4Addr, DecodeError> {
        let bytes = self.take(4)?;
        Ok(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    }

    pub(crate) fn ipv6(&mut self) -> Result<Ipv6Addr, DecodeError> {
        let bytes = self.take(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(bytes);
        Ok(Ipv6Addr::from(octets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian() {
        let mut reader = Reader::new(&[0x00, 0x05, 0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03]);
        assert_eq!(reader.u16().unwrap(), 5);
        assert_eq!(reader.u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.uint(3).unwrap(), 0x010203);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_never_reads_past_end() {
        let mut reader = Reader::new(&[0x00, 0x01, 0x02]);
        reader.u16().unwrap();
        let err = reader.u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 2,
                needed: 4,
                available: 1
            }
        );
        // A failed read consumes nothing.
        assert_eq!(reader.u8().unwrap(), 0x02);
    }

    #[test]
    fn test_sub_reader_reports_absolute_offsets() {
        let mut reader = Reader::new(&[0u8; 10]);
        reader.skip(6).unwrap();
        let mut sub = reader.sub(2).unwrap();
        let err = sub.u32().unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { offset: 6, .. }));
    }
}
