//! GRE encapsulation header.

use crate::utils::read_header;
use crate::utils::types::*;

use anyhow::Result;

/// Checksum-present flag.
const GRE_CSUM: u16 = 0x8000;
/// Routing-present flag (GRE v0 only).
const GRE_ROUTING: u16 = 0x4000;
/// Key-present flag.
const GRE_KEY: u16 = 0x2000;
/// Sequence-number-present flag.
const GRE_SEQ: u16 = 0x1000;
/// Acknowledgment-present flag (GRE v1, PPTP).
const GRE_ACK: u16 = 0x0080;
/// Version mask.
const GRE_VERSION: u16 = 0x0007;

/// A GRE header view covering versions 0 (RFC 2784/2890) and 1 (PPTP).
#[derive(Debug)]
pub struct Gre {
    header: GreHeader,
    offset: usize,
}

impl Gre {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: GreHeader = read_header(frame, offset)?;
        Ok(Gre { header, offset })
    }

    #[inline]
    fn flags(&self) -> u16 {
        self.header.flags_version.into()
    }

    /// Returns the GRE version.
    #[inline]
    pub fn version(&self) -> u8 {
        (self.flags() & GRE_VERSION) as u8
    }

    /// Returns the EtherType of the encapsulated payload.
    #[inline]
    pub fn protocol(&self) -> u16 {
        self.header.protocol.into()
    }

    /// Returns the header length in bytes, optional fields included.
    pub fn header_len(&self) -> usize {
        let flags = self.flags();
        let mut len = 4;
        if flags & (GRE_CSUM | GRE_ROUTING) != 0 {
            len += 4;
        }
        if flags & GRE_KEY != 0 {
            len += 4;
        }
        if flags & GRE_SEQ != 0 {
            len += 4;
        }
        if flags & GRE_ACK != 0 {
            len += 4;
        }
        len
    }

    /// Offset of the encapsulated payload.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len()
    }
}

/// Fixed portion of a GRE header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct GreHeader {
    flags_version: u16be,
    protocol: u16be,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::packet::ethernet::ETHERTYPE_IPV4;

    #[test]
    fn base_header_is_four_bytes() {
        let hdr = [0x00, 0x00, 0x08, 0x00];
        let gre = Gre::parse(&hdr, 0).unwrap();
        assert_eq!(gre.version(), 0);
        assert_eq!(gre.protocol(), ETHERTYPE_IPV4);
        assert_eq!(gre.header_len(), 4);
    }

    #[test]
    fn optional_fields_extend_header() {
        // checksum + key + sequence present
        let hdr = [0xb0, 0x00, 0x88, 0xbe, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let gre = Gre::parse(&hdr, 0).unwrap();
        assert_eq!(gre.header_len(), 16);
        assert_eq!(gre.payload_offset(), 16);
    }
}
