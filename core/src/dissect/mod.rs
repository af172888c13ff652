//! Packet dissection.
//!
//! The dissector walks one captured frame from the link layer down to the
//! innermost transport header, filling a transient [`PacketDescriptor`]:
//! typed offsets into the frame, the flow identification tuple, snap-adjusted
//! lengths, tunnel header positions, a header-description trail and a status
//! word. Encapsulations carrying IP recurse with a hard nesting bound; the
//! innermost endpoints win the flow identity while outer layers survive only
//! in the description and the status bits.
//!
//! Anomalies never abort dissection: they set status bits and the walk either
//! continues with what is parseable or stops with `StopDissecting`.

pub mod hdrdesc;
mod l2;
mod l3;
mod l4;
pub mod linktype;

pub use self::hdrdesc::HdrDesc;
pub use self::linktype::LinkType;

use crate::flowtable::flow::{FlowKey, FlowStatus};
use crate::utils::timeval::Timeval;

use pnet::datalink::MacAddr;

/// Nesting bound for recursive tunnel decoding.
pub const MAX_TUNNEL_DEPTH: u8 = 4;

/// Frames at or below this on-wire length are checked for trailer padding.
pub const MIN_RAW_LEN: u32 = 64;

/// One SCTP chunk located within the packet.
#[derive(Debug, Clone, Copy)]
pub struct SctpChunkInfo {
    pub chunk_type: u8,
    /// Stream identifier; meaningful for DATA chunks only.
    pub stream: u16,
    /// Padding bytes to the 4-byte boundary after the chunk.
    pub padding: u16,
    /// Offset of the chunk's user payload.
    pub payload_offset: usize,
    /// Chunk payload length, snap-clamped.
    pub payload_len: u16,
}

/// Transient per-packet state produced by the dissector.
///
/// Borrows the raw frame; all layer positions are offsets into that slice so
/// the descriptor can never outlive the capture buffer.
#[derive(Debug)]
pub struct PacketDescriptor<'a> {
    pub frame: &'a [u8],
    /// Capture timestamp.
    pub ts: Timeval,
    /// Length on the wire.
    pub raw_len: u32,
    /// Captured length (`frame.len()`).
    pub snap_len: u32,

    /// Packet status and warning bits; merged into the flow on attribution.
    pub status: FlowStatus,

    /// Offset of the link-layer header.
    pub l2_offset: usize,
    /// Offset of the innermost network-layer header.
    pub l3_offset: Option<usize>,
    /// Offset of the innermost transport-layer header.
    pub l4_offset: Option<usize>,
    /// Offset of the payload after the innermost transport header.
    pub l7_offset: Option<usize>,

    pub l3_hdr_len: u16,
    pub l4_hdr_len: u16,

    /// Framed packet length derived from the innermost L3 header.
    pub packet_len: u32,
    /// Payload length according to the framing, snap-ignorant.
    pub l7_len: u16,
    /// Captured payload length.
    pub snap_l7_len: u16,
    /// Trailer padding bytes of short frames.
    pub pad_len: i64,

    /// Flow identification accumulated during dissection; the innermost
    /// decoded layers win.
    pub key: FlowKey,
    /// EtherType of the outermost link layer.
    pub outer_ether_type: u16,
    /// Innermost link-layer addresses.
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    /// 4 or 6 once a network layer was decoded.
    pub ip_version: u8,
    pub vlan_count: u8,
    pub mpls_count: u8,

    /// TCP flags of the innermost transport header.
    pub tcp_flags: u8,
    pub tcp_seq: u32,
    pub icmp_type: u8,
    pub icmp_code: u8,

    // Tunnel and extension header positions, innermost occurrence.
    pub gre_offset: Option<usize>,
    pub l2tp_offset: Option<usize>,
    pub gtp_offset: Option<usize>,
    pub teredo_origin_offset: Option<usize>,
    pub teredo_auth_offset: Option<usize>,
    pub ip6_frag_offset: Option<usize>,
    pub ip6_hbh_offset: Option<usize>,
    pub ip6_dst_opt_offset: Option<usize>,
    pub ip6_route_offset: Option<usize>,

    /// IP identification of the (innermost) fragmentable header.
    pub ipid: u32,
    /// Fragment train identification when the packet is a fragment.
    pub frag_id: u32,
    /// Fragment offset in 8-byte units.
    pub frag_offset: u16,
    /// More-fragments flag.
    pub frag_mf: bool,
    pub is_fragment: bool,

    /// SCTP chunks of the packet, in wire order.
    pub sctp_chunks: Vec<SctpChunkInfo>,
    pub sctp_vtag: u32,
    /// Padding bytes of the first DATA chunk.
    pub sctp_pad: u8,

    /// Protocol trail, e.g. `eth:vlan:ipv4:udp:vxlan:eth:ipv4:tcp`.
    pub hdr_desc: HdrDesc,

    /// Flow index carried across a forced-duration rollover.
    pub findex_carry: u64,
    /// Status carried across a forced-duration rollover.
    pub status_carry: FlowStatus,

    /// Detect LAPD carried in UDP by its address-field signature.
    pub lapd_over_udp: bool,
}

impl<'a> PacketDescriptor<'a> {
    pub fn new(frame: &'a [u8], raw_len: u32, ts: Timeval) -> Self {
        PacketDescriptor {
            frame,
            ts,
            raw_len,
            snap_len: frame.len() as u32,
            status: FlowStatus::none(),
            l2_offset: 0,
            l3_offset: None,
            l4_offset: None,
            l7_offset: None,
            l3_hdr_len: 0,
            l4_hdr_len: 0,
            packet_len: 0,
            l7_len: 0,
            snap_l7_len: 0,
            pad_len: 0,
            key: FlowKey::default(),
            outer_ether_type: 0,
            src_mac: MacAddr::zero(),
            dst_mac: MacAddr::zero(),
            ip_version: 0,
            vlan_count: 0,
            mpls_count: 0,
            tcp_flags: 0,
            tcp_seq: 0,
            icmp_type: 0,
            icmp_code: 0,
            gre_offset: None,
            l2tp_offset: None,
            gtp_offset: None,
            teredo_origin_offset: None,
            teredo_auth_offset: None,
            ip6_frag_offset: None,
            ip6_hbh_offset: None,
            ip6_dst_opt_offset: None,
            ip6_route_offset: None,
            ipid: 0,
            frag_id: 0,
            frag_offset: 0,
            frag_mf: false,
            is_fragment: false,
            sctp_chunks: Vec::new(),
            sctp_vtag: 0,
            sctp_pad: 0,
            hdr_desc: HdrDesc::new(),
            findex_carry: 0,
            status_carry: FlowStatus::none(),
            lapd_over_udp: false,
        }
    }

    /// Sets a status bit on the packet.
    #[inline]
    pub fn set_status(&mut self, bits: FlowStatus) {
        self.status |= bits;
    }

    /// Bytes captured at and beyond `offset`.
    #[inline]
    pub fn remaining(&self, offset: usize) -> usize {
        self.frame.len().saturating_sub(offset)
    }

    /// Appends a token to the header description, tagging overruns.
    pub fn add_hdr(&mut self, token: &str) {
        if !self.hdr_desc.push(token) {
            self.set_status(FlowStatus::HdrDescOverrun);
        }
    }

    /// Appends a repeated token to the header description.
    pub fn add_hdr_repeated(&mut self, token: &str, reps: usize) {
        if !self.hdr_desc.push_repeated(token, reps) {
            self.set_status(FlowStatus::HdrDescOverrun);
        }
    }

    /// Returns `true` if dissection hit a condition that forbids deeper
    /// decoding.
    #[inline]
    pub fn stopped(&self) -> bool {
        self.status.contains(FlowStatus::StopDissecting)
    }

    /// Returns `true` once the packet was attributed to a network layer.
    #[inline]
    pub fn has_l3(&self) -> bool {
        self.l3_offset.is_some()
    }

    /// The captured transport payload, if any.
    pub fn l7_payload(&self) -> &'a [u8] {
        match self.l7_offset {
            Some(offset) if offset < self.frame.len() => &self.frame[offset..],
            _ => &[],
        }
    }

    /// Finalizes payload lengths once the innermost L4 header is known.
    pub(crate) fn finalize_l4(&mut self, l4_offset: usize, hdr_len: usize) {
        self.l4_offset = Some(l4_offset);
        self.l4_hdr_len = hdr_len as u16;
        let l7 = l4_offset + hdr_len;
        self.l7_offset = Some(l7);
        self.snap_l7_len = self.remaining(l7) as u16;
        if let Some(l3) = self.l3_offset {
            let framed = self.packet_len as usize;
            let consumed = (l7 - l3).min(framed);
            self.l7_len = (framed - consumed) as u16;
        }
    }
}

/// Dissects one frame according to the capture's link type.
///
/// On return the descriptor carries whatever could be decoded; callers
/// consult `has_l3()`, the key and the status bits to decide attribution.
pub fn dissect(pkt: &mut PacketDescriptor, link_type: LinkType) {
    linktype::dissect_link(pkt, link_type);

    // trailer padding accounting for short frames
    if pkt.raw_len <= MIN_RAW_LEN && pkt.ip_version != 0 {
        if let Some(l3) = pkt.l3_offset {
            let pad = pkt.raw_len as i64 - pkt.packet_len as i64 - l3 as i64;
            if pad > 0 {
                pkt.pad_len = pad;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::testutil::*;
    use crate::flowtable::flow::FlowAddrs;
    use crate::protocols::packet::*;

    use std::net::Ipv4Addr;

    fn dissected(frame: &[u8]) -> PacketDescriptor<'_> {
        let mut pkt = PacketDescriptor::new(frame, frame.len() as u32, Timeval::new(1, 0));
        dissect(&mut pkt, LinkType::Ethernet);
        pkt
    }

    #[test]
    fn plain_udp_datagram() {
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_pkt(
                [10, 0, 0, 1],
                [10, 0, 0, 2],
                UDP_PROTOCOL,
                &udp_dgram(53, 40000, b"kestrel"),
            ),
        );
        let pkt = dissected(&frame);
        assert_eq!(pkt.hdr_desc.as_str(), "eth:ipv4:udp");
        assert_eq!(pkt.key.src_port, 53);
        assert_eq!(pkt.key.dst_port, 40000);
        assert_eq!(pkt.key.proto, UDP_PROTOCOL);
        assert_eq!(pkt.ip_version, 4);
        assert!(pkt.status.contains(FlowStatus::Ipv4Pkt));
        assert_eq!(pkt.l7_payload(), b"kestrel");
        assert_eq!(
            pkt.key.addrs,
            FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
            }
        );
    }

    #[test]
    fn vlan_tag_is_recorded_and_keyed() {
        let inner = ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, &udp_dgram(1, 2, b""));
        let frame = eth_vlan_frame(100, ethernet::ETHERTYPE_IPV4, &inner);
        let pkt = dissected(&frame);
        assert_eq!(pkt.hdr_desc.as_str(), "eth:vlan:ipv4:udp");
        assert_eq!(pkt.key.vlan_id, 100);
        assert!(pkt.status.contains(FlowStatus::L2Vlan));
    }

    #[test]
    fn vlan_priority_tag_sets_bit() {
        let inner = ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, &udp_dgram(1, 2, b""));
        let frame = eth_vlan_frame(0, ethernet::ETHERTYPE_IPV4, &inner);
        let pkt = dissected(&frame);
        assert!(pkt.status.contains(FlowStatus::VlanPriorityTag));
    }

    #[test]
    fn gre_tunnel_keeps_inner_identity() {
        // eth:vlan:mpls:ipv4:gre:ipv4:tcp
        let tcp = tcp_segment(33333, 80, tcp::SYN, b"");
        let inner_ip = ipv4_pkt([192, 168, 1, 10], [192, 168, 1, 20], TCP_PROTOCOL, &tcp);
        let gre = gre_pkt(ethernet::ETHERTYPE_IPV4, &inner_ip);
        let outer_ip = ipv4_pkt([10, 1, 0, 1], [10, 1, 0, 2], GRE_PROTOCOL, &gre);
        let mpls = mpls_pkt(16, &outer_ip);
        let frame = eth_vlan_frame(100, ethernet::ETHERTYPE_MPLS_UCAST, &mpls);

        let pkt = dissected(&frame);
        assert_eq!(pkt.hdr_desc.as_str(), "eth:vlan:mpls:ipv4:gre:ipv4:tcp");
        assert_eq!(
            pkt.key.addrs,
            FlowAddrs::V4 {
                src: Ipv4Addr::new(192, 168, 1, 10),
                dst: Ipv4Addr::new(192, 168, 1, 20),
            }
        );
        assert_eq!(pkt.key.src_port, 33333);
        assert_eq!(pkt.key.dst_port, 80);
        assert!(pkt.status.contains(FlowStatus::L2Gre));
        assert!(pkt.status.contains(FlowStatus::L2Vlan));
        assert!(pkt.status.contains(FlowStatus::L2MplsUnicast));
    }

    #[test]
    fn teredo_inner_ipv6_wins_attribution() {
        let tcp = tcp_segment(1000, 2000, tcp::ACK, b"");
        let inner6 = ipv6_pkt(1, 2, TCP_PROTOCOL, &tcp);
        let udp = udp_dgram(54321, 3544, &inner6);
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, &udp),
        );
        let pkt = dissected(&frame);
        assert!(pkt.status.contains(FlowStatus::L3Teredo));
        assert_eq!(pkt.ip_version, 6);
        assert_eq!(pkt.key.src_port, 1000);
        assert!(pkt.hdr_desc.as_str().contains("teredo:ipv6:tcp"));
    }

    #[test]
    fn vxlan_recurses_into_inner_ethernet() {
        let udp_inner = udp_dgram(5000, 6000, b"payload");
        let inner_ip = ipv4_pkt([172, 16, 0, 1], [172, 16, 0, 2], UDP_PROTOCOL, &udp_inner);
        let inner_eth = eth_frame(ethernet::ETHERTYPE_IPV4, &inner_ip);
        let vxlan = vxlan_pkt(42, &inner_eth);
        let outer_udp = udp_dgram(50000, 4789, &vxlan);
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, &outer_udp),
        );
        let pkt = dissected(&frame);
        assert!(pkt.status.contains(FlowStatus::L3Vxlan));
        assert_eq!(pkt.hdr_desc.as_str(), "eth:ipv4:udp:vxlan:eth:ipv4:udp");
        assert_eq!(pkt.key.src_port, 5000);
        assert_eq!(
            pkt.key.addrs,
            FlowAddrs::V4 {
                src: Ipv4Addr::new(172, 16, 0, 1),
                dst: Ipv4Addr::new(172, 16, 0, 2),
            }
        );
    }

    #[test]
    fn first_fragment_parses_l4() {
        let udp = udp_dgram(53, 9999, b"abcdefgh");
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_frag_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, 0xbeef, 0, true, &udp),
        );
        let pkt = dissected(&frame);
        assert!(pkt.is_fragment);
        assert!(pkt.frag_mf);
        assert_eq!(pkt.frag_offset, 0);
        assert_eq!(pkt.frag_id, 0xbeef);
        assert_eq!(pkt.key.src_port, 53);
    }

    #[test]
    fn later_fragment_stops_dissection() {
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_frag_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, 0xbeef, 185, false, b"rest"),
        );
        let pkt = dissected(&frame);
        assert!(pkt.is_fragment);
        assert!(!pkt.frag_mf);
        assert_eq!(pkt.frag_offset, 185);
        assert!(pkt.stopped());
        // transport identity is unknown for later fragments
        assert_eq!(pkt.key.src_port, 0);
    }

    #[test]
    fn truncated_l4_header_sets_warning() {
        let ip = ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], TCP_PROTOCOL, &[0u8; 20]);
        let frame = eth_frame(ethernet::ETHERTYPE_IPV4, &ip);
        // keep the IPv4 header intact but clip most of the TCP header
        let cut = &frame[..frame.len() - 15];
        let mut pkt = PacketDescriptor::new(cut, frame.len() as u32, Timeval::new(1, 0));
        dissect(&mut pkt, LinkType::Ethernet);
        assert!(pkt.status.contains(FlowStatus::L4HdrShort));
        assert!(pkt.status.contains(FlowStatus::L3SnapLength));
    }

    #[test]
    fn sctp_chunks_are_walked() {
        let chunks = sctp_pkt(7, 8, 0x42, &[(0, 5, b"hello"), (1, 0, b"")]);
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], SCTP_PROTOCOL, &chunks),
        );
        let pkt = dissected(&frame);
        assert_eq!(pkt.sctp_vtag, 0x42);
        assert_eq!(pkt.sctp_chunks.len(), 2);
        assert!(pkt.sctp_chunks[0].chunk_type == 0 && pkt.sctp_chunks[0].stream == 5);
        assert_eq!(pkt.sctp_chunks[1].chunk_type, 1);
        assert!(pkt.status.contains(FlowStatus::L4Sctp));
    }

    #[test]
    fn land_attack_shape_is_parseable() {
        let tcp = tcp_segment(80, 80, tcp::SYN, b"");
        let frame = eth_frame(
            ethernet::ETHERTYPE_IPV4,
            &ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 1], TCP_PROTOCOL, &tcp),
        );
        let pkt = dissected(&frame);
        assert_eq!(pkt.key.addrs.src_ip(), pkt.key.addrs.dst_ip());
        assert_eq!(pkt.key.src_port, pkt.key.dst_port);
    }
}

#[cfg(test)]
pub(crate) mod testutil;
