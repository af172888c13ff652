//! IPv6 packet and extension headers.

use crate::utils::read_header;
use crate::utils::types::*;

use std::net::Ipv6Addr;

use anyhow::Result;

/// IPv6 base header length in bytes.
pub const IPV6_HDR_LEN: usize = 40;
/// IPv6 fragment extension header length in bytes.
pub const IPV6_FRAG_HDR_LEN: usize = 8;

/// Next-header value for the hop-by-hop options extension.
pub const IPV6_EXT_HOP_BY_HOP: u8 = 0;
/// Next-header value for the routing extension.
pub const IPV6_EXT_ROUTING: u8 = 43;
/// Next-header value for the fragment extension.
pub const IPV6_EXT_FRAGMENT: u8 = 44;
/// Next-header value for the destination options extension.
pub const IPV6_EXT_DEST_OPTS: u8 = 60;
/// Next-header value for "no next header".
pub const IPV6_EXT_NO_NEXT: u8 = 59;

/// An IPv6 packet header view.
#[derive(Debug)]
pub struct Ipv6 {
    header: Ipv6Header,
    offset: usize,
}

impl Ipv6 {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: Ipv6Header = read_header(frame, offset)?;
        Ok(Ipv6 { header, offset })
    }

    /// Returns the IP protocol version nibble.
    #[inline]
    pub fn version(&self) -> u8 {
        ((u32::from(self.header.version_to_flow_label) & 0xf000_0000) >> 28) as u8
    }

    /// Returns the 20-bit flow label.
    #[inline]
    pub fn flow_label(&self) -> u32 {
        u32::from(self.header.version_to_flow_label) & 0x000f_ffff
    }

    /// Returns the payload length in bytes (everything after the base header).
    #[inline]
    pub fn payload_length(&self) -> u16 {
        self.header.payload_length.into()
    }

    /// Returns the protocol identifier of the first extension header or of
    /// the transport payload.
    #[inline]
    pub fn next_header(&self) -> u8 {
        self.header.next_header
    }

    /// Returns the hop limit.
    #[inline]
    pub fn hop_limit(&self) -> u8 {
        self.header.hop_limit
    }

    /// Returns the sender's IPv6 address.
    #[inline]
    pub fn src_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.header.src_addr)
    }

    /// Returns the receiver's IPv6 address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.header.dst_addr)
    }

    /// Offset of the first byte after the base header.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + IPV6_HDR_LEN
    }
}

/// Fixed portion of an IPv6 header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Ipv6Header {
    version_to_flow_label: u32be,
    payload_length: u16be,
    next_header: u8,
    hop_limit: u8,
    src_addr: [u8; 16],
    dst_addr: [u8; 16],
}

/// Generic IPv6 extension header prefix (hop-by-hop, routing, destination).
///
/// `ext_len` counts 8-byte units beyond the first eight bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Ipv6ExtHeader {
    next_header: u8,
    ext_len: u8,
}

impl Ipv6ExtHeader {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        read_header(frame, offset)
    }

    #[inline]
    pub fn next_header(&self) -> u8 {
        self.next_header
    }

    /// Extension header length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        (self.ext_len as usize + 1) * 8
    }
}

/// IPv6 fragment extension header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Ipv6FragHeader {
    next_header: u8,
    reserved: u8,
    frag_off_flags: u16be,
    identification: u32be,
}

impl Ipv6FragHeader {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        read_header(frame, offset)
    }

    #[inline]
    pub fn next_header(&self) -> u8 {
        self.next_header
    }

    /// Returns the fragment offset in units of 8 bytes.
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        u16::from(self.frag_off_flags) >> 3
    }

    /// Returns `true` if more fragments follow.
    #[inline]
    pub fn mf(&self) -> bool {
        u16::from(self.frag_off_flags) & 0x1 != 0
    }

    /// Returns the fragment train identification.
    #[inline]
    pub fn identification(&self) -> u32 {
        self.identification.into()
    }
}

/// IPsec authentication header; `ext_len` counts 4-byte units minus two.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct AuthHeader {
    next_header: u8,
    ext_len: u8,
    reserved: u16be,
    spi: u32be,
}

impl AuthHeader {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        read_header(frame, offset)
    }

    #[inline]
    pub fn next_header(&self) -> u8 {
        self.next_header
    }

    /// Header length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        (self.ext_len as usize + 2) * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::packet::TCP_PROTOCOL;

    #[test]
    fn parses_base_header() {
        let mut frame = vec![
            0x60, 0x01, 0x23, 0x45, // version 6, flow label 0x12345? (tc bits span)
            0x00, 0x28, // payload length 40
            6,    // next header tcp
            64,   // hop limit
        ];
        frame.extend_from_slice(&[0; 15]);
        frame.push(1); // src ::1
        frame.extend_from_slice(&[0; 15]);
        frame.push(2); // dst ::2
        let ip6 = Ipv6::parse(&frame, 0).unwrap();
        assert_eq!(ip6.version(), 6);
        assert_eq!(ip6.payload_length(), 40);
        assert_eq!(ip6.next_header(), TCP_PROTOCOL);
        assert_eq!(ip6.payload_offset(), IPV6_HDR_LEN);
        assert_eq!(ip6.src_addr(), Ipv6Addr::from(1u128));
        assert_eq!(ip6.dst_addr(), Ipv6Addr::from(2u128));
    }

    #[test]
    fn fragment_header_fields() {
        // next header udp, offset 185 (1480 bytes), no MF
        let bytes = [17, 0, 0x05, 0xc8, 0xde, 0xad, 0xbe, 0xef];
        let frag = Ipv6FragHeader::parse(&bytes, 0).unwrap();
        assert_eq!(frag.next_header(), 17);
        assert_eq!(frag.fragment_offset(), 185);
        assert!(!frag.mf());
        assert_eq!(frag.identification(), 0xdead_beef);
    }
}
