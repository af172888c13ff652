//! Link-layer and bridging decoders: Ethernet, VLAN and MPLS stacks,
//! LLC/SNAP, PPP and PPPoE, 802.11, ERSPAN.

use super::{l3, PacketDescriptor, MAX_TUNNEL_DEPTH};
use crate::flowtable::flow::FlowStatus;
use crate::protocols::packet::ethernet::*;

/// Bound on stacked VLAN tags per frame.
const MAX_VLAN_TAGS: usize = 4;
/// Bound on MPLS label stack entries per frame.
const MAX_MPLS_LABELS: usize = 8;

/// PPP protocol number for IPv4.
const PPP_IPV4: u16 = 0x0021;
/// PPP protocol number for IPv6.
const PPP_IPV6: u16 = 0x0057;
/// PPP protocol number for MPLS unicast.
const PPP_MPLS: u16 = 0x0281;

pub(super) fn dissect_ethernet(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    let eth = match Ethernet::parse(pkt.frame, offset) {
        Ok(eth) => eth,
        Err(_) => {
            pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.add_hdr("eth");
    pkt.src_mac = eth.src();
    pkt.dst_mac = eth.dst();
    dissect_ethertype(pkt, eth.ether_type(), eth.payload_offset(), depth);
}

/// EtherType dispatch, including the L2.5 shims that precede a network
/// header: VLAN and MPLS stacks, LLC/SNAP, PPPoE and ERSPAN.
pub(super) fn dissect_ethertype(
    pkt: &mut PacketDescriptor,
    ether_type: u16,
    offset: usize,
    depth: u8,
) {
    let mut ether_type = ether_type;
    let mut offset = offset;

    if pkt.outer_ether_type == 0 {
        pkt.outer_ether_type = ether_type;
    }

    // walk any stack of 802.1Q/802.1ad tags, innermost VID wins
    let mut tags = 0;
    while matches!(ether_type, ETHERTYPE_VLAN | ETHERTYPE_QINQ | ETHERTYPE_QINQ_OLD)
        && tags < MAX_VLAN_TAGS
    {
        let tag = match VlanTag::parse(pkt.frame, offset) {
            Ok(tag) => tag,
            Err(_) => {
                pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
                return;
            }
        };
        tags += 1;
        pkt.vlan_count += 1;
        pkt.key.vlan_id = tag.vlan_id();
        if tag.vlan_id() == 0 {
            pkt.set_status(FlowStatus::VlanPriorityTag);
        }
        ether_type = tag.ether_type();
        offset += VLAN_TAG_LEN;
    }
    if tags > 0 {
        pkt.set_status(FlowStatus::L2Vlan);
        pkt.add_hdr_repeated("vlan", tags);
    }

    // MPLS label stack until bottom-of-stack, then guess the content
    if matches!(ether_type, ETHERTYPE_MPLS_UCAST | ETHERTYPE_MPLS_MCAST) {
        pkt.set_status(if ether_type == ETHERTYPE_MPLS_UCAST {
            FlowStatus::L2MplsUnicast
        } else {
            FlowStatus::L2MplsMulticast
        });
        let mut labels = 0;
        loop {
            let label = match MplsLabel::parse(pkt.frame, offset) {
                Ok(label) => label,
                Err(_) => {
                    pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
                    return;
                }
            };
            labels += 1;
            pkt.mpls_count += 1;
            offset += 4;
            if label.bottom_of_stack() || labels >= MAX_MPLS_LABELS {
                break;
            }
        }
        pkt.add_hdr_repeated("mpls", labels);
        // no explicit protocol field below the stack; use the version nibble
        if pkt.remaining(offset) < 1 {
            pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
            return;
        }
        match pkt.frame[offset] & 0xf0 {
            0x40 => l3::dissect_ipv4(pkt, offset, depth),
            0x60 => l3::dissect_ipv6(pkt, offset, depth),
            _ => dissect_ethernet(pkt, offset, depth),
        }
        return;
    }

    // 802.3 length field means LLC, possibly with a SNAP extension
    if ether_type <= LLC_MAX_LEN || ether_type == ETHERTYPE_JUMBO_LLC {
        pkt.add_hdr("llc");
        if pkt.remaining(offset) < 8 {
            pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
            return;
        }
        if pkt.frame[offset] == 0xaa && pkt.frame[offset + 1] == 0xaa {
            // SNAP: 3-byte LLC, 3-byte OUI, then the real EtherType
            ether_type = u16::from_be_bytes([pkt.frame[offset + 6], pkt.frame[offset + 7]]);
            offset += 8;
        } else {
            pkt.key.ether_type = ether_type;
            pkt.set_status(FlowStatus::StopDissecting);
            return;
        }
    }

    pkt.key.ether_type = ether_type;

    match ether_type {
        ETHERTYPE_IPV4 => l3::dissect_ipv4(pkt, offset, depth),
        ETHERTYPE_IPV6 => l3::dissect_ipv6(pkt, offset, depth),
        ETHERTYPE_ARP => {
            pkt.add_hdr("arp");
            pkt.set_status(FlowStatus::L2Arp | FlowStatus::StopDissecting);
        }
        ETHERTYPE_RARP => {
            pkt.add_hdr("rarp");
            pkt.set_status(FlowStatus::L2Rarp | FlowStatus::StopDissecting);
        }
        ETHERTYPE_LLDP => {
            pkt.add_hdr("lldp");
            pkt.set_status(FlowStatus::L2Lldp | FlowStatus::StopDissecting);
        }
        ETHERTYPE_PPPOE_D => {
            pkt.add_hdr("pppoed");
            pkt.set_status(FlowStatus::L2PppoeDiscovery | FlowStatus::StopDissecting);
        }
        ETHERTYPE_PPPOE_S => {
            pkt.add_hdr("pppoes");
            pkt.set_status(FlowStatus::L2PppoeSession);
            // 6-byte PPPoE session header precedes the PPP protocol field
            if pkt.remaining(offset) < 6 {
                pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
                return;
            }
            dissect_ppp_proto(pkt, offset + 6, depth);
        }
        ETHERTYPE_ERSPAN => dissect_erspan(pkt, offset, depth, 8),
        ETHERTYPE_ERSPAN3 => dissect_erspan(pkt, offset, depth, 12),
        _ => {
            // unknown EtherType: the frame stays a layer-2 flow
            pkt.set_status(FlowStatus::StopDissecting);
        }
    }
}

/// PPP with optional HDLC address/control bytes.
pub(super) fn dissect_ppp(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    let mut offset = offset;
    if pkt.remaining(offset) < 2 {
        pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
        return;
    }
    if pkt.frame[offset] == 0xff && pkt.frame[offset + 1] == 0x03 {
        offset += 2;
    }
    dissect_ppp_proto(pkt, offset, depth);
}

/// PPP protocol field, possibly compressed to one byte.
pub(super) fn dissect_ppp_proto(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    pkt.add_hdr("ppp");
    pkt.set_status(FlowStatus::L2Ppp);
    if pkt.remaining(offset) < 2 {
        pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
        return;
    }
    let (proto, hdr_len) = if pkt.frame[offset] & 0x01 == 1 {
        pkt.set_status(FlowStatus::PppHdrUnreadable);
        (pkt.frame[offset] as u16, 1)
    } else {
        (
            u16::from_be_bytes([pkt.frame[offset], pkt.frame[offset + 1]]),
            2,
        )
    };
    let offset = offset + hdr_len;
    match proto {
        PPP_IPV4 => l3::dissect_ipv4(pkt, offset, depth),
        PPP_IPV6 => l3::dissect_ipv6(pkt, offset, depth),
        PPP_MPLS => dissect_ethertype(pkt, ETHERTYPE_MPLS_UCAST, offset, depth),
        _ => pkt.set_status(FlowStatus::StopDissecting),
    }
}

/// 802.11 data frames down to their LLC/SNAP payload.
pub(super) fn dissect_ieee80211(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if pkt.remaining(offset) < 24 {
        pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
        return;
    }
    pkt.add_hdr("802.11");
    pkt.set_status(FlowStatus::L2NoEth);
    let fc0 = pkt.frame[offset];
    let fc1 = pkt.frame[offset + 1];
    let frame_type = (fc0 >> 2) & 0x3;
    if frame_type != 2 {
        // management and control frames carry no payload to dissect
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    let mut hdr_len = 24;
    if fc1 & 0x03 == 0x03 {
        hdr_len += 6; // 4-address format (WDS)
    }
    if fc0 & 0x80 != 0 {
        hdr_len += 2; // QoS control
    }
    let snap = offset + hdr_len;
    if pkt.remaining(snap) < 8 || pkt.frame[snap] != 0xaa {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    let ether_type = u16::from_be_bytes([pkt.frame[snap + 6], pkt.frame[snap + 7]]);
    dissect_ethertype(pkt, ether_type, snap + 8, depth);
}

/// ERSPAN: fixed header, then the mirrored Ethernet frame.
fn dissect_erspan(pkt: &mut PacketDescriptor, offset: usize, depth: u8, hdr_len: usize) {
    if depth >= MAX_TUNNEL_DEPTH {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    if pkt.remaining(offset) < hdr_len {
        pkt.set_status(FlowStatus::L2SnapLength | FlowStatus::StopDissecting);
        return;
    }
    pkt.set_status(FlowStatus::L2Erspan);
    pkt.add_hdr("erspan");
    dissect_ethernet(pkt, offset + hdr_len, depth + 1);
}

