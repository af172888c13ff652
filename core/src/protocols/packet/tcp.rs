//! TCP segment.

use crate::utils::read_header;
use crate::utils::types::*;

use anyhow::Result;

/// FIN flag.
pub const FIN: u8 = 0b0000_0001;
/// SYN flag.
pub const SYN: u8 = 0b0000_0010;
/// RST flag.
pub const RST: u8 = 0b0000_0100;
/// PSH flag.
pub const PSH: u8 = 0b0000_1000;
/// ACK flag.
pub const ACK: u8 = 0b0001_0000;
/// URG flag.
pub const URG: u8 = 0b0010_0000;

/// Minimal TCP header length in bytes.
pub const TCP_MIN_HDR_LEN: usize = 20;

/// A TCP segment header view.
#[derive(Debug)]
pub struct Tcp {
    header: TcpHeader,
    offset: usize,
}

impl Tcp {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: TcpHeader = read_header(frame, offset)?;
        Ok(Tcp { header, offset })
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

    /// Returns the sequence number.
    #[inline]
    pub fn seq_no(&self) -> u32 {
        self.header.seq_no.into()
    }

    /// Returns the acknowledgment number.
    #[inline]
    pub fn ack_no(&self) -> u32 {
        self.header.ack_no.into()
    }

    /// Returns the header length in bytes, including options.
    #[inline]
    pub fn header_len(&self) -> usize {
        ((self.header.data_offset_to_ns >> 4) << 2) as usize
    }

    /// Returns the 8-bit flags field.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Returns `true` if the segment is a connection-opening SYN (no ACK).
    #[inline]
    pub fn synack(&self) -> bool {
        self.flags() & (SYN | ACK) == (SYN | ACK)
    }

    /// Returns the receive window size.
    #[inline]
    pub fn window(&self) -> u16 {
        self.header.window.into()
    }

    /// Offset of the segment payload.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len()
    }
}

/// Fixed portion of a TCP header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct TcpHeader {
    src_port: u16be,
    dst_port: u16be,
    seq_no: u32be,
    ack_no: u32be,
    data_offset_to_ns: u8,
    flags: u8,
    window: u16be,
    checksum: u16be,
    urgent_pointer: u16be,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(flags: u8) -> Vec<u8> {
        let mut seg = vec![
            0x82, 0x35, // src port 33333
            0x00, 0x50, // dst port 80
            0, 0, 0, 1, // seq
            0, 0, 0, 0, // ack
            0x50, flags, // data offset 5
            0xff, 0xff, // window
            0, 0, 0, 0, // checksum, urg
        ];
        seg.extend_from_slice(&[0; 4]);
        seg
    }

    #[test]
    fn parses_ports_and_flags() {
        let seg = segment(SYN);
        let tcp = Tcp::parse(&seg, 0).unwrap();
        assert_eq!(tcp.src_port(), 33333);
        assert_eq!(tcp.dst_port(), 80);
        assert_eq!(tcp.header_len(), 20);
        assert_eq!(tcp.flags(), SYN);
        assert!(!tcp.synack());
    }

    #[test]
    fn synack_needs_both_bits() {
        let tcp_syn = Tcp::parse(&segment(SYN), 0).unwrap();
        let tcp_sa = Tcp::parse(&segment(SYN | ACK), 0).unwrap();
        assert!(!tcp_syn.synack());
        assert!(tcp_sa.synack());
    }
}
