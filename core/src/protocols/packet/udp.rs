//! UDP datagram.

use crate::utils::read_header;
use crate::utils::types::*;

use anyhow::Result;

/// UDP header length in bytes.
pub const UDP_HDR_LEN: usize = 8;

/// A UDP datagram header view. Also used for UDP-Lite, whose `length` field
/// holds the checksum coverage instead.
#[derive(Debug)]
pub struct Udp {
    header: UdpHeader,
    offset: usize,
}

impl Udp {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: UdpHeader = read_header(frame, offset)?;
        Ok(Udp { header, offset })
    }

    /// Returns the sending port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        self.header.src_port.into()
    }

    /// Returns the receiving port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.header.dst_port.into()
    }

    /// Returns the datagram length, header included.
    #[inline]
    pub fn length(&self) -> u16 {
        self.header.length.into()
    }

    /// Offset of the datagram payload.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + UDP_HDR_LEN
    }
}

/// Fixed portion of a UDP header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct UdpHeader {
    src_port: u16be,
    dst_port: u16be,
    length: u16be,
    checksum: u16be,
}
