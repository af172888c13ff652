//! ICMP and ICMPv6 messages.

use crate::utils::read_header;
use crate::utils::types::*;

use anyhow::Result;

/// ICMP header length in bytes (type, code, checksum, rest-of-header).
pub const ICMP_HDR_LEN: usize = 8;

/// An ICMP/ICMPv6 message header view.
#[derive(Debug)]
pub struct Icmp {
    header: IcmpHeader,
    offset: usize,
}

impl Icmp {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: IcmpHeader = read_header(frame, offset)?;
        Ok(Icmp { header, offset })
    }

    /// Returns the message type.
    #[inline]
    pub fn msg_type(&self) -> u8 {
        self.header.msg_type
    }

    /// Returns the message code.
    #[inline]
    pub fn code(&self) -> u8 {
        self.header.code
    }

    /// Offset of the message body.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + ICMP_HDR_LEN
    }
}

/// Fixed portion of an ICMP header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IcmpHeader {
    msg_type: u8,
    code: u8,
    checksum: u16be,
    rest: u32be,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_echo_request() {
        let msg = [8, 0, 0xde, 0xad, 0, 1, 0, 1];
        let icmp = Icmp::parse(&msg, 0).unwrap();
        assert_eq!(icmp.msg_type(), 8);
        assert_eq!(icmp.code(), 0);
        assert_eq!(icmp.payload_offset(), ICMP_HDR_LEN);
    }
}
