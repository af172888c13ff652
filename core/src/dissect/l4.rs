//! Transport-layer decoders and tunnel identification.
//!
//! Ports and signatures identify encapsulations riding on UDP (VXLAN,
//! GENEVE, Teredo, AYIYA, GTP, L2TPv2, CAPWAP/LWAPP, DTLS); IP protocol
//! numbers identify GRE, IP-in-IP, EtherIP, L2TPv3, ESP and AH. Identified
//! tunnels recurse into the carried frame so the innermost endpoints win the
//! flow identity; a tunnel that fails validation leaves the outer transport
//! attribution in place.

use super::{l2, l3, PacketDescriptor, SctpChunkInfo, MAX_TUNNEL_DEPTH};
use crate::flowtable::flow::FlowStatus;
use crate::protocols::packet::ethernet::*;
use crate::protocols::packet::gre::Gre;
use crate::protocols::packet::icmp::{Icmp, ICMP_HDR_LEN};
use crate::protocols::packet::sctp::*;
use crate::protocols::packet::tcp::Tcp;
use crate::protocols::packet::udp::{Udp, UDP_HDR_LEN};
use crate::protocols::packet::*;

/// UDP port of VXLAN.
const VXLAN_PORT: u16 = 4789;
/// UDP port of GENEVE.
const GENEVE_PORT: u16 = 6081;
/// UDP port of Teredo.
const TEREDO_PORT: u16 = 3544;
/// UDP port of AYIYA.
const AYIYA_PORT: u16 = 5072;
/// UDP port of L2TP.
const L2TP_PORT: u16 = 1701;
/// UDP ports of CAPWAP control and data.
const CAPWAP_PORTS: [u16; 2] = [5246, 5247];
/// UDP ports of LWAPP control and data.
const LWAPP_PORTS: [u16; 2] = [12222, 12223];
/// UDP ports of GTP (GTP-C, GTP-U, GTP').
const GTP_PORTS: [u16; 3] = [2123, 2152, 3386];
/// EtherType for transparent Ethernet bridging (GRE/GENEVE payloads).
const ETHERTYPE_TEB: u16 = 0x6558;

/// Transport dispatch on the IANA protocol number.
pub(super) fn dissect(pkt: &mut PacketDescriptor, proto: u8, offset: usize, depth: u8) {
    pkt.key.proto = proto;
    match proto {
        TCP_PROTOCOL => dissect_tcp(pkt, offset),
        UDP_PROTOCOL => dissect_udp(pkt, offset, depth),
        UDPLITE_PROTOCOL => {
            pkt.add_hdr("udplite");
            match Udp::parse(pkt.frame, offset) {
                Ok(udp) => {
                    pkt.key.src_port = udp.src_port();
                    pkt.key.dst_port = udp.dst_port();
                    pkt.finalize_l4(offset, UDP_HDR_LEN);
                }
                Err(_) => pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting),
            }
        }
        SCTP_PROTOCOL => dissect_sctp(pkt, offset),
        ICMP_PROTOCOL => dissect_icmp(pkt, offset, "icmp"),
        ICMP6_PROTOCOL => dissect_icmp(pkt, offset, "icmp6"),
        IGMP_PROTOCOL => {
            pkt.add_hdr("igmp");
            pkt.finalize_l4(offset, ICMP_HDR_LEN.min(pkt.remaining(offset)));
        }
        OSPF_PROTOCOL => {
            pkt.add_hdr("ospf");
            pkt.finalize_l4(offset, 0);
        }
        PIM_PROTOCOL => {
            pkt.add_hdr("pim");
            pkt.finalize_l4(offset, 0);
        }
        GRE_PROTOCOL => dissect_gre(pkt, offset, depth),
        ESP_PROTOCOL => {
            pkt.add_hdr("esp");
            pkt.set_status(FlowStatus::L3IpsecEsp);
            pkt.finalize_l4(offset, 0);
        }
        AH_PROTOCOL => dissect_ah(pkt, offset, depth),
        IPV4_ENCAP_PROTOCOL => {
            pkt.set_status(FlowStatus::L3IpInIp);
            l3::dissect_ipv4(pkt, offset, depth + 1);
        }
        IPV6_ENCAP_PROTOCOL => {
            pkt.set_status(FlowStatus::L3IpInIp);
            l3::dissect_ipv6(pkt, offset, depth + 1);
        }
        ETHERIP_PROTOCOL => {
            // 2-byte version header, then the bridged frame
            if depth >= MAX_TUNNEL_DEPTH || pkt.remaining(offset) < 2 {
                pkt.set_status(FlowStatus::StopDissecting);
                return;
            }
            pkt.set_status(FlowStatus::L3EtherIp);
            pkt.add_hdr("etherip");
            l2::dissect_ethernet(pkt, offset + 2, depth + 1);
        }
        L2TP_PROTOCOL => {
            // L2TPv3 over IP: session id, then an operator-defined cookie
            pkt.set_status(FlowStatus::L2L2tp);
            pkt.add_hdr("l2tp");
            pkt.l2tp_offset = Some(offset);
            pkt.set_status(FlowStatus::StopDissecting);
            pkt.finalize_l4(offset, 0);
        }
        other => {
            pkt.add_hdr(&other.to_string());
            pkt.finalize_l4(offset, 0);
        }
    }
}

fn dissect_tcp(pkt: &mut PacketDescriptor, offset: usize) {
    let tcp = match Tcp::parse(pkt.frame, offset) {
        Ok(tcp) => tcp,
        Err(_) => {
            pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.add_hdr("tcp");
    pkt.key.src_port = tcp.src_port();
    pkt.key.dst_port = tcp.dst_port();
    pkt.tcp_flags = tcp.flags();
    pkt.tcp_seq = tcp.seq_no();
    pkt.finalize_l4(offset, tcp.header_len());
}

fn dissect_udp(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    let udp = match Udp::parse(pkt.frame, offset) {
        Ok(udp) => udp,
        Err(_) => {
            pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.add_hdr("udp");
    let sport = udp.src_port();
    let dport = udp.dst_port();
    pkt.key.src_port = sport;
    pkt.key.dst_port = dport;
    pkt.finalize_l4(offset, UDP_HDR_LEN);

    if pkt.stopped() || depth >= MAX_TUNNEL_DEPTH {
        return;
    }
    let payload = udp.payload_offset();

    if port_match(sport, dport, VXLAN_PORT) {
        process_vxlan(pkt, payload, depth);
    } else if port_match(sport, dport, GENEVE_PORT) {
        process_geneve(pkt, payload, depth);
    } else if sport == TEREDO_PORT || dport == TEREDO_PORT {
        process_teredo(pkt, payload, depth);
    } else if port_match(sport, dport, AYIYA_PORT) {
        process_ayiya(pkt, payload, depth);
    } else if sport == L2TP_PORT || dport == L2TP_PORT {
        process_l2tp_udp(pkt, payload, depth);
    } else if GTP_PORTS.contains(&sport) || GTP_PORTS.contains(&dport) {
        process_gtp(pkt, payload, depth);
    } else if CAPWAP_PORTS.contains(&sport) || CAPWAP_PORTS.contains(&dport) {
        process_capwap(pkt, payload, depth, "capwap", 0);
    } else if LWAPP_PORTS.contains(&sport) || LWAPP_PORTS.contains(&dport) {
        process_capwap(pkt, payload, depth, "lwapp", 6);
    } else if is_dtls(pkt, payload) {
        pkt.add_hdr("dtls");
        pkt.set_status(FlowStatus::L7Dtls);
    } else if pkt.lapd_over_udp && is_lapd(pkt, payload) {
        pkt.add_hdr("lapd");
        pkt.set_status(FlowStatus::LapdFlow | FlowStatus::StopDissecting);
    }
}

/// LAPD address field: EA1 clear, EA2 set.
fn is_lapd(pkt: &PacketDescriptor, offset: usize) -> bool {
    pkt.remaining(offset) >= 3
        && pkt.frame[offset] & 0x01 == 0
        && pkt.frame[offset + 1] & 0x01 == 1
}

#[inline]
fn port_match(sport: u16, dport: u16, tunnel: u16) -> bool {
    (sport == tunnel && dport > 1024) || (dport == tunnel && sport > 1024)
}

fn dissect_sctp(pkt: &mut PacketDescriptor, offset: usize) {
    let sctp = match Sctp::parse(pkt.frame, offset) {
        Ok(sctp) => sctp,
        Err(_) => {
            pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.add_hdr("sctp");
    pkt.set_status(FlowStatus::L4Sctp);
    pkt.key.src_port = sctp.src_port();
    pkt.key.dst_port = sctp.dst_port();
    pkt.sctp_vtag = sctp.verification_tag();

    // chunk walk; each DATA chunk becomes its own attribution unit
    let mut cursor = sctp.chunk_offset();
    let mut first_payload = None;
    while let Ok(chunk) = SctpChunk::parse(pkt.frame, cursor) {
        let chunk_len = chunk.length() as usize;
        if chunk_len < SCTP_CHUNK_HDR_LEN {
            break;
        }
        let is_data = chunk.is_data();
        let hdr = if is_data { SCTP_DATA_CHUNK_LEN } else { SCTP_CHUNK_HDR_LEN };
        let payload_offset = cursor + hdr;
        let payload_len = chunk_len.saturating_sub(hdr).min(pkt.remaining(payload_offset));
        let stream = if is_data {
            chunk.stream_id(pkt.frame).unwrap_or(0)
        } else {
            0
        };
        let info = SctpChunkInfo {
            chunk_type: chunk.chunk_type(),
            stream,
            padding: chunk.padding(),
            payload_offset,
            payload_len: payload_len as u16,
        };
        if first_payload.is_none() {
            first_payload = Some(payload_offset);
            pkt.sctp_pad = chunk.padding() as u8;
            pkt.key.sctp_stream = stream;
            pkt.key.sctp_vtag = pkt.sctp_vtag;
        }
        pkt.sctp_chunks.push(info);
        let advance = chunk_len + chunk.padding() as usize;
        if pkt.remaining(cursor) <= advance {
            break;
        }
        cursor += advance;
    }

    let hdr = first_payload
        .map(|p| p - offset)
        .unwrap_or(SCTP_HDR_LEN);
    pkt.finalize_l4(offset, hdr);
}

fn dissect_icmp(pkt: &mut PacketDescriptor, offset: usize, token: &str) {
    let icmp = match Icmp::parse(pkt.frame, offset) {
        Ok(icmp) => icmp,
        Err(_) => {
            pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.add_hdr(token);
    pkt.icmp_type = icmp.msg_type();
    pkt.icmp_code = icmp.code();
    pkt.finalize_l4(offset, ICMP_HDR_LEN);
}

fn dissect_ah(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    use crate::protocols::packet::ipv6::AuthHeader;
    let ah = match AuthHeader::parse(pkt.frame, offset) {
        Ok(ah) => ah,
        Err(_) => {
            pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.set_status(FlowStatus::L3IpsecAh);
    pkt.add_hdr("ah");
    dissect(pkt, ah.next_header(), offset + ah.length(), depth);
}

fn dissect_gre(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if depth >= MAX_TUNNEL_DEPTH {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    let gre = match Gre::parse(pkt.frame, offset) {
        Ok(gre) => gre,
        Err(_) => {
            pkt.set_status(FlowStatus::L4HdrShort | FlowStatus::StopDissecting);
            return;
        }
    };
    pkt.set_status(FlowStatus::L2Gre);
    pkt.add_hdr("gre");
    pkt.gre_offset = Some(offset);
    let payload = gre.payload_offset();
    match gre.protocol() {
        ETHERTYPE_IPV4 => l3::dissect_ipv4(pkt, payload, depth + 1),
        ETHERTYPE_IPV6 => l3::dissect_ipv6(pkt, payload, depth + 1),
        ETHERTYPE_TEB => l2::dissect_ethernet(pkt, payload, depth + 1),
        ETHERTYPE_PPP => {
            l2::dissect_ppp(pkt, payload, depth + 1);
        }
        ETHERTYPE_ERSPAN | ETHERTYPE_ERSPAN3 => {
            l2::dissect_ethertype(pkt, gre.protocol(), payload, depth + 1)
        }
        _ => pkt.set_status(FlowStatus::StopDissecting),
    }
}

fn process_vxlan(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    // 8-byte header, I flag set, reserved bits zero
    if pkt.remaining(offset) < 8 || pkt.frame[offset] & 0x08 == 0 {
        return;
    }
    pkt.set_status(FlowStatus::L3Vxlan);
    pkt.add_hdr("vxlan");
    l2::dissect_ethernet(pkt, offset + 8, depth + 1);
}

fn process_geneve(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if pkt.remaining(offset) < 8 {
        return;
    }
    let optlen = (pkt.frame[offset] & 0x3f) as usize * 4;
    let proto = u16::from_be_bytes([pkt.frame[offset + 2], pkt.frame[offset + 3]]);
    if proto != ETHERTYPE_TEB {
        return;
    }
    let inner = offset + 8 + optlen;
    if pkt.remaining(inner) == 0 {
        return;
    }
    pkt.set_status(FlowStatus::L3Geneve);
    pkt.add_hdr("geneve");
    l2::dissect_ethernet(pkt, inner, depth + 1);
}

fn process_teredo(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    let mut cursor = offset;
    if pkt.remaining(cursor) < 2 {
        return;
    }
    // authentication header: marker 0x0001
    if pkt.frame[cursor] == 0x00 && pkt.frame[cursor + 1] == 0x01 {
        if pkt.remaining(cursor) < 13 {
            return;
        }
        let id_len = pkt.frame[cursor + 2] as usize;
        let auth_len = pkt.frame[cursor + 3] as usize;
        pkt.teredo_auth_offset = Some(cursor);
        cursor += 13 + id_len + auth_len;
        if pkt.remaining(cursor) < 2 {
            return;
        }
    }
    // origin indication: marker 0x0000
    if pkt.frame[cursor] == 0x00 && pkt.frame[cursor + 1] == 0x00 {
        pkt.teredo_origin_offset = Some(cursor);
        cursor += 8;
    }
    if pkt.remaining(cursor) < 1 || pkt.frame[cursor] & 0xf0 != 0x60 {
        pkt.teredo_auth_offset = None;
        pkt.teredo_origin_offset = None;
        return;
    }
    pkt.set_status(FlowStatus::L3Teredo);
    pkt.add_hdr("teredo");
    l3::dissect_ipv6(pkt, cursor, depth + 1);
}

fn process_ayiya(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if pkt.remaining(offset) < 8 {
        return;
    }
    let id_len = (pkt.frame[offset] >> 4) as usize;
    let sig_len = (pkt.frame[offset + 1] >> 4) as usize;
    let next_header = pkt.frame[offset + 3];
    let inner = offset + 8 + (1 << id_len) + 4 * sig_len;
    if pkt.remaining(inner) < 1 {
        return;
    }
    match next_header {
        IPV6_ENCAP_PROTOCOL if pkt.frame[inner] & 0xf0 == 0x60 => {
            pkt.set_status(FlowStatus::L3Ayiya);
            pkt.add_hdr("ayiya");
            l3::dissect_ipv6(pkt, inner, depth + 1);
        }
        IPV4_ENCAP_PROTOCOL if pkt.frame[inner] & 0xf0 == 0x40 => {
            pkt.set_status(FlowStatus::L3Ayiya);
            pkt.add_hdr("ayiya");
            l3::dissect_ipv4(pkt, inner, depth + 1);
        }
        _ => {}
    }
}

fn process_l2tp_udp(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if pkt.remaining(offset) < 6 {
        return;
    }
    let flags = pkt.frame[offset];
    let version = pkt.frame[offset + 1] & 0x0f;
    if version != 2 {
        return;
    }
    pkt.set_status(FlowStatus::L2L2tp);
    pkt.add_hdr("l2tp");
    pkt.l2tp_offset = Some(offset);
    if flags & 0x80 != 0 {
        // control message, no carried frame
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    let mut cursor = offset + 2;
    if flags & 0x40 != 0 {
        cursor += 2; // length
    }
    cursor += 4; // tunnel + session id
    if flags & 0x08 != 0 {
        cursor += 4; // Ns/Nr
    }
    if flags & 0x02 != 0 {
        if pkt.remaining(cursor) < 2 {
            pkt.set_status(FlowStatus::StopDissecting);
            return;
        }
        let pad = u16::from_be_bytes([pkt.frame[cursor], pkt.frame[cursor + 1]]) as usize;
        cursor += 2 + pad;
    }
    l2::dissect_ppp(pkt, cursor, depth + 1);
}

fn process_gtp(pkt: &mut PacketDescriptor, offset: usize, depth: u8) {
    if pkt.remaining(offset) < 8 {
        return;
    }
    let b0 = pkt.frame[offset];
    let msg_type = pkt.frame[offset + 1];
    let version = b0 >> 5;
    // only GTPv1 T-PDUs carry user IP traffic
    if version != 1 || msg_type != 0xff {
        return;
    }
    pkt.set_status(FlowStatus::L3Gtp);
    pkt.add_hdr("gtp");
    pkt.gtp_offset = Some(offset);
    let mut inner = offset + 8;
    if b0 & 0x07 != 0 {
        inner += 4; // sequence number, N-PDU number, next extension type
    }
    if pkt.remaining(inner) < 1 {
        pkt.set_status(FlowStatus::StopDissecting);
        return;
    }
    match pkt.frame[inner] & 0xf0 {
        0x40 => l3::dissect_ipv4(pkt, inner, depth + 1),
        0x60 => l3::dissect_ipv6(pkt, inner, depth + 1),
        _ => pkt.set_status(FlowStatus::StopDissecting),
    }
}

fn process_capwap(pkt: &mut PacketDescriptor, offset: usize, depth: u8, token: &str, fixed: usize) {
    if pkt.remaining(offset) < 4 {
        return;
    }
    pkt.set_status(FlowStatus::L3Capwap);
    if fixed != 0 {
        // LWAPP: fixed 6-byte header before the wireless frame
        pkt.add_hdr(token);
        l2::dissect_ethernet(pkt, offset + fixed, depth + 1);
        return;
    }
    let preamble = pkt.frame[offset];
    if preamble & 0x0f == 1 {
        // DTLS-secured channel; tag only
        pkt.add_hdr(token);
        pkt.set_status(FlowStatus::L7Dtls | FlowStatus::StopDissecting);
        return;
    }
    let hlen = ((pkt.frame[offset + 1] >> 3) & 0x1f) as usize * 4;
    pkt.add_hdr(token);
    l2::dissect_ethernet(pkt, offset + hlen, depth + 1);
}

fn is_dtls(pkt: &PacketDescriptor, offset: usize) -> bool {
    pkt.remaining(offset) >= 3
        && (20..=23).contains(&pkt.frame[offset])
        && pkt.frame[offset + 1] == 0xfe
}
