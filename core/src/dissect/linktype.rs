//! Link-layer dispatch.
//!
//! Selects the first decoder by the capture's data link type. Unsupported
//! link types produce one warning per run and the frame is skipped.

use super::{l2, l3, PacketDescriptor};
use crate::flowtable::flow::FlowStatus;

use std::sync::atomic::{AtomicBool, Ordering};

/// Supported pcap data link types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback: 4-byte AF family, host order.
    Null,
    /// Ethernet (EN10MB).
    Ethernet,
    /// PPP, RFC 1661 framing.
    Ppp,
    /// Symantec Enterprise Firewall, 44-byte preamble then Ethernet.
    Symantec,
    /// Raw IP, no link header.
    Raw,
    /// PPP with HDLC framing (0xff 0x03).
    PppHdlc,
    /// Cisco HDLC.
    CiscoHdlc,
    /// Frame Relay (Q.922).
    FrameRelay,
    /// IEEE 802.11 without a radio preamble.
    Ieee80211,
    /// OpenBSD loopback, AF family in network order.
    Loop,
    /// Linux cooked capture (SLL).
    LinuxSll,
    /// Prism monitor-mode preamble before 802.11.
    Prism,
    /// Radiotap preamble before 802.11.
    Radiotap,
    /// Per-Packet Information preamble before 802.11.
    Ppi,
    /// ISDN LAPD with vISDN pseudo header.
    Lapd,
    /// Juniper-encapsulated Ethernet.
    JuniperEther,
    /// IEEE 802.3br mPacket preamble.
    MPacket,
    /// Anything else; reported and skipped.
    Unsupported(i32),
}

impl LinkType {
    /// Maps a pcap DLT number.
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            9 => LinkType::Ppp,
            50 => LinkType::PppHdlc,
            99 => LinkType::Symantec,
            101 | 12 | 14 => LinkType::Raw,
            104 => LinkType::CiscoHdlc,
            105 => LinkType::Ieee80211,
            107 => LinkType::FrameRelay,
            108 => LinkType::Loop,
            113 => LinkType::LinuxSll,
            119 => LinkType::Prism,
            127 => LinkType::Radiotap,
            177 | 203 => LinkType::Lapd,
            192 => LinkType::Ppi,
            235 => LinkType::JuniperEther,
            274 => LinkType::MPacket,
            other => LinkType::Unsupported(other),
        }
    }
}

static UNSUPPORTED_WARNED: AtomicBool = AtomicBool::new(false);

/// Entry point: dissects the link layer and everything below it.
pub(super) fn dissect_link(pkt: &mut PacketDescriptor, link_type: LinkType) {
    match link_type {
        LinkType::Ethernet => l2::dissect_ethernet(pkt, 0, 0),
        LinkType::Raw => dissect_raw_ip(pkt, 0),
        LinkType::Null => {
            // 4-byte address family in host byte order
            if pkt.remaining(0) < 4 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("null");
            dissect_raw_ip(pkt, 4);
        }
        LinkType::Loop => {
            if pkt.remaining(0) < 4 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("loop");
            dissect_raw_ip(pkt, 4);
        }
        LinkType::LinuxSll => {
            // 16-byte pseudo header, EtherType in the last two bytes
            if pkt.remaining(0) < 16 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("sll");
            let ether_type = u16::from_be_bytes([pkt.frame[14], pkt.frame[15]]);
            pkt.set_status(FlowStatus::L2NoEth);
            l2::dissect_ethertype(pkt, ether_type, 16, 0);
        }
        LinkType::Ppp => {
            pkt.set_status(FlowStatus::L2NoEth);
            l2::dissect_ppp(pkt, 0, 0);
        }
        LinkType::PppHdlc | LinkType::CiscoHdlc => {
            // address/control (0xff03 for PPP, 0x0f00/0x8f00 for cHDLC),
            // then a 2-byte protocol field
            if pkt.remaining(0) < 4 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.set_status(FlowStatus::L2NoEth);
            if link_type == LinkType::CiscoHdlc {
                pkt.add_hdr("chdlc");
                let proto = u16::from_be_bytes([pkt.frame[2], pkt.frame[3]]);
                l2::dissect_ethertype(pkt, proto, 4, 0);
            } else {
                l2::dissect_ppp(pkt, 2, 0);
            }
        }
        LinkType::FrameRelay => {
            // 2-byte Q.922 address, then NLPID
            if pkt.remaining(0) < 3 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("frelay");
            pkt.set_status(FlowStatus::L2NoEth);
            match pkt.frame[2] {
                0xcc => l3::dissect_ipv4(pkt, 3, 0),
                0x8e => l3::dissect_ipv6(pkt, 3, 0),
                _ => pkt.set_status(FlowStatus::StopDissecting),
            }
        }
        LinkType::Ieee80211 => l2::dissect_ieee80211(pkt, 0, 0),
        LinkType::Radiotap => {
            // length field at offset 2, little endian
            if pkt.remaining(0) < 4 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("radiotap");
            let len = u16::from_le_bytes([pkt.frame[2], pkt.frame[3]]) as usize;
            l2::dissect_ieee80211(pkt, len, 0);
        }
        LinkType::Prism => {
            // fixed 144-byte monitoring preamble
            if pkt.remaining(0) < 144 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("prism");
            l2::dissect_ieee80211(pkt, 144, 0);
        }
        LinkType::Ppi => {
            // length field at offset 2, little endian
            if pkt.remaining(0) < 8 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("ppi");
            let len = u16::from_le_bytes([pkt.frame[2], pkt.frame[3]]) as usize;
            l2::dissect_ieee80211(pkt, len, 0);
        }
        LinkType::Lapd => {
            // vISDN: 16-byte pseudo header before the LAPD address
            if pkt.remaining(0) < 18 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("lapd");
            pkt.set_status(FlowStatus::LapdFlow | FlowStatus::L2NoEth | FlowStatus::StopDissecting);
        }
        LinkType::Symantec => {
            if pkt.remaining(0) < 44 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("symantec");
            let ether_type = u16::from_be_bytes([pkt.frame[4], pkt.frame[5]]);
            l2::dissect_ethertype(pkt, ether_type, 44, 0);
        }
        LinkType::JuniperEther => {
            // magic "MGC", flag byte, 2-byte extension length
            if pkt.remaining(0) < 6 || &pkt.frame[0..3] != b"MGC" {
                pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
                return;
            }
            pkt.add_hdr("juniper");
            let mut offset = 4;
            if pkt.frame[3] & 0x80 != 0 {
                let ext = u16::from_be_bytes([pkt.frame[4], pkt.frame[5]]) as usize;
                offset += 2 + ext;
            }
            l2::dissect_ethernet(pkt, offset, 0);
        }
        LinkType::MPacket => {
            // 8-byte preamble/SMD, no FCS handling
            if pkt.remaining(0) < 8 {
                pkt.set_status(FlowStatus::L2SnapLength);
                return;
            }
            pkt.add_hdr("mpacket");
            l2::dissect_ethernet(pkt, 8, 0);
        }
        LinkType::Unsupported(dlt) => {
            if !UNSUPPORTED_WARNED.swap(true, Ordering::Relaxed) {
                log::warn!("unsupported link type {}, frames will be skipped", dlt);
            }
            pkt.set_status(FlowStatus::StopDissecting);
        }
    }
}

/// Raw IP entry: the version nibble selects the decoder.
fn dissect_raw_ip(pkt: &mut PacketDescriptor, offset: usize) {
    pkt.set_status(FlowStatus::L2NoEth);
    if pkt.remaining(offset) < 1 {
        pkt.set_status(FlowStatus::L2SnapLength);
        return;
    }
    match pkt.frame[offset] & 0xf0 {
        0x40 => l3::dissect_ipv4(pkt, offset, 0),
        0x60 => l3::dissect_ipv6(pkt, offset, 0),
        _ => pkt.set_status(FlowStatus::L3Bogus | FlowStatus::StopDissecting),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlt_mapping_covers_common_types() {
        assert_eq!(LinkType::from_dlt(1), LinkType::Ethernet);
        assert_eq!(LinkType::from_dlt(101), LinkType::Raw);
        assert_eq!(LinkType::from_dlt(113), LinkType::LinuxSll);
        assert_eq!(LinkType::from_dlt(127), LinkType::Radiotap);
        assert_eq!(LinkType::from_dlt(4242), LinkType::Unsupported(4242));
    }
}
