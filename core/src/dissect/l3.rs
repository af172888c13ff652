//! Network-layer decoders: IPv4 and IPv6 with extension headers.

use super::{l4, PacketDescriptor, MAX_TUNNEL_DEPTH};
use crate::flowtable::flow::{FlowAddrs, FlowStatus};
use crate::protocols::packet::ethernet::{ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::protocols::packet::ipv4::{Ipv4, IPV4_MIN_HDR_LEN};
use crate::protocols::packet::ipv6::*;
use crate::protocols::packet::AH_PROTOCOL;

pub(super) fn dissect_ipv4(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if depth > MAX_TUNNEL_DEPTH {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    let ip = match Ipv4::parse(pkt.frame, offset) {
        Ok(ip) => ip,
        Err(_) => {
            pkt.set_status(FlowStatus::L3HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    if ip.version() != 4 {
        pkt.set_status(FlowStatus::L3Bogus | FlowStatus::StopDissecting);
        return;
    }
    pkt.add_hdr("ipv4");
    pkt.set_status(FlowStatus::Ipv4Pkt);
    pkt.ip_version = 4;
    pkt.l3_offset = Some(offset);
    pkt.key.ether_type = ETHERTYPE_IPV4;
    pkt.key.addrs = FlowAddrs::V4 {
        src: ip.src_addr(),
        dst: ip.dst_addr(),
    };
    pkt.ipid = ip.identification() as u32;

    if ip.header_len() < IPV4_MIN_HDR_LEN {
        pkt.set_status(FlowStatus::Ipv4HdrLenShort | FlowStatus::StopDissecting);
        return;
    }
    pkt.l3_hdr_len = ip.header_len() as u16;

    let total = ip.total_length() as u32;
    pkt.packet_len = total;
    // framing disagreement, TSO offloading included
    if pkt.snap_len == pkt.raw_len && offset as u32 + total != pkt.raw_len && pkt.raw_len > super::MIN_RAW_LEN
    {
        pkt.set_status(FlowStatus::IpPayloadLenMismatch);
    }
    if (pkt.snap_len as usize).saturating_sub(offset) < total as usize {
        pkt.set_status(FlowStatus::L3SnapLength);
    }

    pkt.key.proto = ip.protocol();
    if ip.is_fragment() {
        pkt.is_fragment = true;
        pkt.frag_id = ip.identification() as u32;
        pkt.frag_offset = ip.fragment_offset();
        pkt.frag_mf = ip.mf();
        if ip.fragment_offset() != 0 {
            // transport header lives in the first fragment only
            pkt.set_status(FlowStatus::StopDissecting);
            return;
        }
    }

    l4::dissect(pkt, ip.protocol(), ip.payload_offset(), depth);
}

pub(super) fn dissect_ipv6(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if depth > MAX_TUNNEL_DEPTH {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    let ip6 = match Ipv6::parse(pkt.frame, offset) {
        Ok(ip6) => ip6,
        Err(_) => {
            pkt.set_status(FlowStatus::L3HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    if ip6.version() != 6 {
        pkt.set_status(FlowStatus::L3Bogus | FlowStatus::StopDissecting);
        return;
    }
    pkt.add_hdr("ipv6");
    pkt.set_status(FlowStatus::Ipv6Pkt);
    pkt.ip_version = 6;
    pkt.l3_offset = Some(offset);
    pkt.l3_hdr_len = IPV6_HDR_LEN as u16;
    pkt.key.ether_type = ETHERTYPE_IPV6;
    pkt.key.addrs = FlowAddrs::V6 {
        src: ip6.src_addr(),
        dst: ip6.dst_addr(),
    };

    let total = IPV6_HDR_LEN as u32 + ip6.payload_length() as u32;
    pkt.packet_len = total;
    if pkt.snap_len == pkt.raw_len && offset as u32 + total != pkt.raw_len && pkt.raw_len > super::MIN_RAW_LEN
    {
        pkt.set_status(FlowStatus::IpPayloadLenMismatch);
    }
    if (pkt.snap_len as usize).saturating_sub(offset) < total as usize {
        pkt.set_status(FlowStatus::L3SnapLength);
    }

    // walk the extension-header chain down to the transport protocol
    let mut next = ip6.next_header();
    let mut cursor = ip6.payload_offset();
    let mut fragmented_tail = false;
    loop {
        match next {
            IPV6_EXT_HOP_BY_HOP | IPV6_EXT_ROUTING | IPV6_EXT_DEST_OPTS => {
                let ext = match Ipv6ExtHeader::parse(pkt.frame, cursor) {
                    Ok(ext) => ext,
                    Err(_) => {
                        pkt.set_status(FlowStatus::L3HdrShort | FlowStatus::StopDissecting);
                        return;
                    }
                };
                match next {
                    IPV6_EXT_HOP_BY_HOP => pkt.ip6_hbh_offset = Some(cursor),
                    IPV6_EXT_ROUTING => pkt.ip6_route_offset = Some(cursor),
                    _ => pkt.ip6_dst_opt_offset = Some(cursor),
                }
                next = ext.next_header();
                cursor += ext.length();
            }
            IPV6_EXT_FRAGMENT => {
                let frag = match Ipv6FragHeader::parse(pkt.frame, cursor) {
                    Ok(frag) => frag,
                    Err(_) => {
                        pkt.set_status(FlowStatus::L3HdrShort | FlowStatus::StopDissecting);
                        return;
                    }
                };
                pkt.ip6_frag_offset = Some(cursor);
                pkt.is_fragment = true;
                pkt.frag_id = frag.identification();
                pkt.frag_offset = frag.fragment_offset();
                pkt.frag_mf = frag.mf();
                pkt.ipid = frag.identification();
                fragmented_tail = frag.fragment_offset() != 0;
                next = frag.next_header();
                cursor += IPV6_FRAG_HDR_LEN;
            }
            AH_PROTOCOL => {
                let ah = match AuthHeader::parse(pkt.frame, cursor) {
                    Ok(ah) => ah,
                    Err(_) => {
                        pkt.set_status(FlowStatus::L3HdrShort | FlowStatus::StopDissecting);
                        return;
                    }
                };
                pkt.set_status(FlowStatus::L3IpsecAh);
                pkt.add_hdr("ah");
                next = ah.next_header();
                cursor += ah.length();
            }
            IPV6_EXT_NO_NEXT => {
                pkt.set_status(FlowStatus::StopDissecting);
                return;
            }
            _ => break,
        }
    }

    pkt.key.proto = next;
    if fragmented_tail {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    l4::dissect(pkt, next, cursor, depth);
}
