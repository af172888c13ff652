//! Synthetic frame builders for dissector tests.

use crate::protocols::packet::ethernet::{ETHERTYPE_VLAN, ETHERTYPE_MPLS_UCAST};

/// Ethernet II frame with the given EtherType.
pub fn eth_frame(ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xb]); // dst
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xa]); // src
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Single-tagged 802.1Q frame.
pub fn eth_vlan_frame(vid: u16, inner_ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.extend_from_slice(&vid.to_be_bytes());
    inner.extend_from_slice(&inner_ether_type.to_be_bytes());
    inner.extend_from_slice(payload);
    eth_frame(ETHERTYPE_VLAN, &inner)
}

/// One MPLS label stack entry with the bottom-of-stack bit set. The payload
/// must start with an IP header so the decoder can guess the content.
pub fn mpls_pkt(label: u32, payload: &[u8]) -> Vec<u8> {
    let entry: u32 = (label << 12) | 0x100 | 0x40; // BoS, TTL 64
    let mut pkt = entry.to_be_bytes().to_vec();
    pkt.extend_from_slice(payload);
    pkt
}

/// Frame carried under an MPLS unicast EtherType.
#[allow(dead_code)]
pub fn eth_mpls_frame(label: u32, payload: &[u8]) -> Vec<u8> {
    eth_frame(ETHERTYPE_MPLS_UCAST, &mpls_pkt(label, payload))
}

/// IPv4 packet without options.
pub fn ipv4_pkt(src: [u8; 4], dst: [u8; 4], proto: u8, payload: &[u8]) -> Vec<u8> {
    ipv4_frag_pkt(src, dst, proto, 0x1234, 0, false, payload)
}

/// IPv4 packet with explicit fragmentation fields; `frag_off` is in 8-byte
/// units.
pub fn ipv4_frag_pkt(
    src: [u8; 4],
    dst: [u8; 4],
    proto: u8,
    id: u16,
    frag_off: u16,
    mf: bool,
    payload: &[u8],
) -> Vec<u8> {
    let total = 20 + payload.len() as u16;
    let mut flags_off = frag_off & 0x1fff;
    if mf {
        flags_off |= 0x2000;
    }
    let mut pkt = Vec::with_capacity(total as usize);
    pkt.push(0x45);
    pkt.push(0);
    pkt.extend_from_slice(&total.to_be_bytes());
    pkt.extend_from_slice(&id.to_be_bytes());
    pkt.extend_from_slice(&flags_off.to_be_bytes());
    pkt.push(64);
    pkt.push(proto);
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(&src);
    pkt.extend_from_slice(&dst);
    pkt.extend_from_slice(payload);
    pkt
}

/// IPv6 packet with `::src` and `::dst` host parts.
pub fn ipv6_pkt(src: u8, dst: u8, next_header: u8, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(40 + payload.len());
    pkt.extend_from_slice(&[0x60, 0, 0, 0]);
    pkt.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    pkt.push(next_header);
    pkt.push(64);
    let mut addr = [0u8; 16];
    addr[15] = src;
    pkt.extend_from_slice(&addr);
    addr[15] = dst;
    pkt.extend_from_slice(&addr);
    pkt.extend_from_slice(payload);
    pkt
}

/// UDP datagram with a correct length field.
pub fn udp_dgram(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut dgram = Vec::with_capacity(8 + payload.len());
    dgram.extend_from_slice(&sport.to_be_bytes());
    dgram.extend_from_slice(&dport.to_be_bytes());
    dgram.extend_from_slice(&(8 + payload.len() as u16).to_be_bytes());
    dgram.extend_from_slice(&[0, 0]);
    dgram.extend_from_slice(payload);
    dgram
}

/// TCP segment without options.
pub fn tcp_segment(sport: u16, dport: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(20 + payload.len());
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&1u32.to_be_bytes());
    seg.extend_from_slice(&0u32.to_be_bytes());
    seg.push(0x50);
    seg.push(flags);
    seg.extend_from_slice(&0xffffu16.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 0]);
    seg.extend_from_slice(payload);
    seg
}

/// GRE version 0 header without optional fields.
pub fn gre_pkt(proto: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0, 0];
    pkt.extend_from_slice(&proto.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// VXLAN header with the I flag and the given VNI.
pub fn vxlan_pkt(vni: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x08, 0, 0, 0];
    let vni_field = vni << 8;
    pkt.extend_from_slice(&vni_field.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// SCTP packet; `chunks` holds (type, stream, payload) triples. DATA chunks
/// get the 16-byte DATA chunk header, others only the common chunk header.
pub fn sctp_pkt(sport: u16, dport: u16, vtag: u32, chunks: &[(u8, u16, &[u8])]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&sport.to_be_bytes());
    pkt.extend_from_slice(&dport.to_be_bytes());
    pkt.extend_from_slice(&vtag.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 0]);
    for (chunk_type, stream, payload) in chunks {
        let hdr_len = if *chunk_type == 0 { 16 } else { 4 };
        let len = (hdr_len + payload.len()) as u16;
        pkt.push(*chunk_type);
        pkt.push(0);
        pkt.extend_from_slice(&len.to_be_bytes());
        if *chunk_type == 0 {
            pkt.extend_from_slice(&1u32.to_be_bytes()); // tsn
            pkt.extend_from_slice(&stream.to_be_bytes());
            pkt.extend_from_slice(&[0, 0]); // ssn
            pkt.extend_from_slice(&[0, 0, 0, 0]); // ppid
        }
        pkt.extend_from_slice(payload);
        let pad = (4 - len % 4) % 4;
        pkt.extend_from_slice(&vec![0u8; pad as usize]);
    }
    pkt
}
