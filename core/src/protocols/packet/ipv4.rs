//! IPv4 packet.

use crate::utils::read_header;
use crate::utils::types::*;

use std::net::Ipv4Addr;

use anyhow::Result;

/// Flag: "Don't fragment".
const IPV4_DF: u16 = 0x4000;
/// Flag: "More fragments".
const IPV4_MF: u16 = 0x2000;
/// Fragment offset part.
const IPV4_FRAG_OFFSET: u16 = 0x1fff;

/// Minimal IPv4 header length in bytes.
pub const IPV4_MIN_HDR_LEN: usize = 20;

/// An IPv4 packet header view.
///
/// Options are accounted for in the header length but not parsed.
#[derive(Debug)]
pub struct Ipv4 {
    header: Ipv4Header,
    offset: usize,
}

impl Ipv4 {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: Ipv4Header = read_header(frame, offset)?;
        Ok(Ipv4 { header, offset })
    }

    /// Returns the IP protocol version nibble.
    #[inline]
    pub fn version(&self) -> u8 {
        (self.header.version_ihl & 0xf0) >> 4
    }

    /// Returns the header length in bytes, including options.
    #[inline]
    pub fn header_len(&self) -> usize {
        ((self.header.version_ihl & 0x0f) << 2) as usize
    }

    /// Returns the differentiated services field.
    #[inline]
    pub fn dscp_ecn(&self) -> u8 {
        self.header.dscp_ecn
    }

    /// Returns the total length of the packet in bytes, header included.
    #[inline]
    pub fn total_length(&self) -> u16 {
        self.header.total_length.into()
    }

    /// Returns the identification field.
    #[inline]
    pub fn identification(&self) -> u16 {
        self.header.identification.into()
    }

    /// Returns `true` if the Don't Fragment flag is set.
    #[inline]
    pub fn df(&self) -> bool {
        u16::from(self.header.flags_to_fragment_offset) & IPV4_DF != 0
    }

    /// Returns `true` if the More Fragments flag is set.
    #[inline]
    pub fn mf(&self) -> bool {
        u16::from(self.header.flags_to_fragment_offset) & IPV4_MF != 0
    }

    /// Returns the fragment offset in units of 8 bytes.
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        u16::from(self.header.flags_to_fragment_offset) & IPV4_FRAG_OFFSET
    }

    /// Returns `true` if the packet is a fragment of a larger datagram.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.mf() || self.fragment_offset() != 0
    }

    /// Returns `true` for the first fragment of a fragment train.
    #[inline]
    pub fn is_first_fragment(&self) -> bool {
        self.mf() && self.fragment_offset() == 0
    }

    /// Returns the time to live.
    #[inline]
    pub fn time_to_live(&self) -> u8 {
        self.header.time_to_live
    }

    /// Returns the encapsulated protocol identifier.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.header.protocol
    }

    /// Returns the sender's IPv4 address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.src_addr))
    }

    /// Returns the receiver's IPv4 address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.dst_addr))
    }

    /// Offset of the encapsulated payload.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len()
    }
}

/// Fixed portion of an IPv4 header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Ipv4Header {
    version_ihl: u8,
    dscp_ecn: u8,
    total_length: u16be,
    identification: u16be,
    flags_to_fragment_offset: u16be,
    time_to_live: u8,
    protocol: u8,
    header_checksum: u16be,
    src_addr: u32be,
    dst_addr: u32be,
}
