//! Flow records and flow identification.

use crate::utils::timeval::Timeval;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitmask_enum::bitmask;
use pnet::datalink::MacAddr;

/// Serialized length of a flow key in bytes.
pub const FLOW_KEY_LEN: usize = 48;
/// Serialized length of a fragment-index key in bytes.
pub const FRAG_KEY_LEN: usize = 39;

/// Slot value meaning "no flow".
pub const SLOT_NONE: usize = usize::MAX;

/// Per-packet and per-flow status and warning bits.
///
/// The same vocabulary is used for the transient packet status, the
/// accumulated flow status and the process-wide warning register; a bit set
/// on a packet is merged into its flow and into the global register.
#[bitmask(u64)]
#[bitmask_config(vec_debug)]
pub enum FlowStatus {
    /// Inverted flow, did not initiate the connection.
    L3FlowInvert = 0x0000_0000_0000_0001,
    /// No Ethernet header.
    L2NoEth = 0x0000_0000_0000_0002,
    /// Pure layer-2 flow.
    L2Flow = 0x0000_0000_0000_0004,
    /// PPPoE Discovery stage.
    L2PppoeDiscovery = 0x0000_0000_0000_0008,
    /// PPPoE Session stage.
    L2PppoeSession = 0x0000_0000_0000_0010,
    /// Link Layer Discovery Protocol.
    L2Lldp = 0x0000_0000_0000_0020,
    /// ARP.
    L2Arp = 0x0000_0000_0000_0040,
    /// Reverse ARP.
    L2Rarp = 0x0000_0000_0000_0080,
    /// VLAN tag(s) present.
    L2Vlan = 0x0000_0000_0000_0100,
    /// MPLS unicast label stack.
    L2MplsUnicast = 0x0000_0000_0000_0200,
    /// MPLS multicast label stack.
    L2MplsMulticast = 0x0000_0000_0000_0400,
    /// L2TP v2/v3 encapsulation.
    L2L2tp = 0x0000_0000_0000_0800,
    /// GRE v1/v2 encapsulation.
    L2Gre = 0x0000_0000_0000_1000,
    /// PPP header after L2TP or GRE.
    L2Ppp = 0x0000_0000_0000_2000,
    /// IPv4 flow.
    L2Ipv4 = 0x0000_0000_0000_4000,
    /// IPv6 flow.
    L2Ipv6 = 0x0000_0000_0000_8000,
    /// Bogus IP version nibble.
    L3Bogus = 0x0000_0000_0001_0000,
    /// IPv4/6 encapsulated in IPv4/6.
    L3IpInIp = 0x0000_0000_0002_0000,
    /// Ethernet over IP.
    L3EtherIp = 0x0000_0000_0004_0000,
    /// Teredo tunnel.
    L3Teredo = 0x0000_0000_0008_0000,
    /// Anything-in-Anything tunnel.
    L3Ayiya = 0x0000_0000_0010_0000,
    /// GPRS tunneling protocol.
    L3Gtp = 0x0000_0000_0020_0000,
    /// VXLAN encapsulation.
    L3Vxlan = 0x0000_0000_0040_0000,
    /// CAPWAP or LWAPP encapsulation.
    L3Capwap = 0x0000_0000_0080_0000,
    /// SCTP transport.
    L4Sctp = 0x0000_0000_0100_0000,
    /// ERSPAN mirroring.
    L2Erspan = 0x0000_0000_0400_0000,
    /// GENEVE encapsulation.
    L3Geneve = 0x0000_0000_2000_0000,
    /// IPsec Authentication Header.
    L3IpsecAh = 0x0000_0000_4000_0000,
    /// IPsec Encapsulating Security Payload.
    L3IpsecEsp = 0x0000_0000_8000_0000,
    /// Captured length shorter than the minimal layer-2 datagram.
    L2SnapLength = 0x0000_0001_0000_0000,
    /// Captured length shorter than the length in the layer-3 header.
    L3SnapLength = 0x0000_0002_0000_0000,
    /// Captured length shorter than a minimal layer-3 header.
    L3HdrShort = 0x0000_0004_0000_0000,
    /// Captured length shorter than a minimal layer-4 header.
    L4HdrShort = 0x0000_0008_0000_0000,
    /// IPv4 fragmentation present.
    Ipv4Frag = 0x0000_0010_0000_0000,
    /// IPv4 fragmentation error.
    Ipv4FragError = 0x0000_0020_0000_0000,
    /// First fragment out of sequence or missing.
    Ipv4FragSeqError = 0x0000_0040_0000_0000,
    /// Fragmentation sequence not completed.
    Ipv4FragPending = 0x0000_0080_0000_0000,
    /// Flow timed out instead of being terminated by its protocol.
    FlowTimeout = 0x0000_0100_0000_0000,
    /// Remove this flow instantly (force mode).
    RemoveFlow = 0x0000_0200_0000_0000,
    /// Flow removed to free space in the main hash table (autopilot).
    RemovedHashFull = 0x0000_0400_0000_0000,
    /// Dissection stopped: clipped packet, unhandled protocol or fragment.
    StopDissecting = 0x0000_0800_0000_0000,
    /// Consecutive duplicate IP identification field.
    DuplicateIpId = 0x0000_1000_0000_0000,
    /// PPP header not readable, compressed.
    PppHdrUnreadable = 0x0000_2000_0000_0000,
    /// IPv4 header length below 20 bytes.
    Ipv4HdrLenShort = 0x0000_4000_0000_0000,
    /// IPv4/6 payload length disagrees with the framing length.
    IpPayloadLenMismatch = 0x0000_8000_0000_0000,
    /// Header description overrun.
    HdrDescOverrun = 0x0001_0000_0000_0000,
    /// Source and destination address and port pairs are identical.
    LandAttack = 0x0004_0000_0000_0000,
    /// Timestamp jump, multi-path delay or clock adjustment.
    TimeJump = 0x0008_0000_0000_0000,
    /// Subnet test performed for this flow.
    SubnetTested = 0x0080_0000_0000_0000,
    /// A packet carried a priority tag (VLAN id 0).
    VlanPriorityTag = 0x0200_0000_0000_0000,
    /// IPv4 packet seen.
    Ipv4Pkt = 0x0400_0000_0000_0000,
    /// IPv6 packet seen.
    Ipv6Pkt = 0x0800_0000_0000_0000,
    /// LAPD flow.
    LapdFlow = 0x1000_0000_0000_0000,
    /// DTLS in layer 7.
    L7Dtls = 0x2000_0000_0000_0000,
    /// Forced-duration rollover, same index kept for all sub-flows.
    FdSameIndex = 0x4000_0000_0000_0000,
    /// Captured length exceeded the I/O buffer and was reduced.
    CapLenClipped = 0x8000_0000_0000_0000,
}

impl FlowStatus {
    /// Either MPLS variant.
    pub const MPLS: FlowStatus = FlowStatus::L2MplsUnicast.or(FlowStatus::L2MplsMulticast);
    /// Either snap-length warning.
    pub const SNAP_LENGTH: FlowStatus = FlowStatus::L2SnapLength.or(FlowStatus::L3SnapLength);

    /// The raw 64-bit status word.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.bits
    }
}

impl Default for FlowStatus {
    fn default() -> Self {
        FlowStatus::none()
    }
}

/// Flow endpoint addresses; layer-2-only conversations are identified by
/// their MAC pair instead of IPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowAddrs {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
    Mac { src: MacAddr, dst: MacAddr },
}

impl FlowAddrs {
    fn kind(&self) -> u8 {
        match self {
            FlowAddrs::V4 { .. } => 4,
            FlowAddrs::V6 { .. } => 6,
            FlowAddrs::Mac { .. } => 2,
        }
    }

    fn write(&self, out: &mut [u8]) {
        match self {
            FlowAddrs::V4 { src, dst } => {
                out[0..4].copy_from_slice(&src.octets());
                out[16..20].copy_from_slice(&dst.octets());
            }
            FlowAddrs::V6 { src, dst } => {
                out[0..16].copy_from_slice(&src.octets());
                out[16..32].copy_from_slice(&dst.octets());
            }
            FlowAddrs::Mac { src, dst } => {
                out[0..6].copy_from_slice(&[src.0, src.1, src.2, src.3, src.4, src.5]);
                out[16..22].copy_from_slice(&[dst.0, dst.1, dst.2, dst.3, dst.4, dst.5]);
            }
        }
    }

    pub fn reversed(&self) -> FlowAddrs {
        match *self {
            FlowAddrs::V4 { src, dst } => FlowAddrs::V4 { src: dst, dst: src },
            FlowAddrs::V6 { src, dst } => FlowAddrs::V6 { src: dst, dst: src },
            FlowAddrs::Mac { src, dst } => FlowAddrs::Mac { src: dst, dst: src },
        }
    }

    /// Source address as a displayable IP; MAC endpoints have none.
    pub fn src_ip(&self) -> Option<IpAddr> {
        match *self {
            FlowAddrs::V4 { src, .. } => Some(IpAddr::V4(src)),
            FlowAddrs::V6 { src, .. } => Some(IpAddr::V6(src)),
            FlowAddrs::Mac { .. } => None,
        }
    }

    /// Destination address as a displayable IP; MAC endpoints have none.
    pub fn dst_ip(&self) -> Option<IpAddr> {
        match *self {
            FlowAddrs::V4 { dst, .. } => Some(IpAddr::V4(dst)),
            FlowAddrs::V6 { dst, .. } => Some(IpAddr::V6(dst)),
            FlowAddrs::Mac { .. } => None,
        }
    }
}

impl Default for FlowAddrs {
    fn default() -> Self {
        FlowAddrs::V4 {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// The flow identification tuple. Serializes to a fixed-width opaque key for
/// the main hash table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub addrs: FlowAddrs,
    pub vlan_id: u16,
    pub ether_type: u16,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub sctp_stream: u16,
    pub sctp_vtag: u32,
}

impl FlowKey {
    /// Serializes the tuple into hash-table key bytes.
    pub fn to_bytes(&self) -> [u8; FLOW_KEY_LEN] {
        let mut out = [0u8; FLOW_KEY_LEN];
        out[0] = self.addrs.kind();
        self.addrs.write(&mut out[1..33]);
        out[33..35].copy_from_slice(&self.vlan_id.to_be_bytes());
        out[35..37].copy_from_slice(&self.ether_type.to_be_bytes());
        out[37..39].copy_from_slice(&self.src_port.to_be_bytes());
        out[39..41].copy_from_slice(&self.dst_port.to_be_bytes());
        out[41] = self.proto;
        out[42..44].copy_from_slice(&self.sctp_stream.to_be_bytes());
        out[44..48].copy_from_slice(&self.sctp_vtag.to_be_bytes());
        out
    }

    /// The key of the opposite direction.
    pub fn reversed(&self) -> FlowKey {
        FlowKey {
            addrs: self.addrs.reversed(),
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..*self
        }
    }

    /// The key of the fragment train this packet belongs to.
    pub fn frag_key(&self, frag_id: u32) -> [u8; FRAG_KEY_LEN] {
        let mut out = [0u8; FRAG_KEY_LEN];
        out[0] = self.addrs.kind();
        self.addrs.write(&mut out[1..33]);
        out[33..35].copy_from_slice(&self.vlan_id.to_be_bytes());
        out[35..39].copy_from_slice(&frag_id.to_be_bytes());
        out
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs {
            FlowAddrs::Mac { src, dst } => {
                write!(f, "{} -> {} ethertype {:#06x}", src, dst, self.ether_type)
            }
            _ => write!(
                f,
                "{}:{} -> {}:{} proto {} vlan {}",
                self.addrs.src_ip().unwrap(),
                self.src_port,
                self.addrs.dst_ip().unwrap(),
                self.dst_port,
                self.proto,
                self.vlan_id
            ),
        }
    }
}

/// A tracked flow.
///
/// Flow records live in a pre-allocated arena indexed by the main hash
/// table's chain slots; the LRU list is threaded through them as slot
/// indices. A record is zeroed and re-initialized whenever its slot is
/// reused.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Next (older) flow in the LRU list.
    pub lru_next: usize,
    /// Previous (younger) flow in the LRU list.
    pub lru_prev: usize,

    /// Monotonically assigned flow index; shared with the opposite flow.
    pub findex: u64,
    /// Accumulated status of all packets of this flow.
    pub status: FlowStatus,

    /// Own slot in the flow arena.
    pub slot: usize,
    /// Slot of the opposite-direction flow, if paired.
    pub opposite: Option<usize>,

    /// Timestamp of the last packet seen.
    pub last_seen: Timeval,
    /// Timestamp of the first packet seen.
    pub first_seen: Timeval,
    /// `last_seen - first_seen`; valid only after termination.
    pub duration: Timeval,

    /// Flow identification tuple (the hash key).
    pub key: FlowKey,

    /// Aggregated padding bytes.
    pub pad_len: i64,
    /// Flow timeout in seconds; infinite for LRU sentinels.
    pub timeout: f32,
    /// Last observed IP identification field, for duplicate detection.
    pub last_ipid: u32,
    /// Identification of the pending fragment train, for index cleanup.
    pub last_frag_id: u32,

    /// Subnet-test result for the source address (0 = untested).
    pub subnet_src: u32,
    /// Subnet-test result for the destination address (0 = untested).
    pub subnet_dst: u32,
}

impl Default for Flow {
    fn default() -> Self {
        Flow {
            lru_next: SLOT_NONE,
            lru_prev: SLOT_NONE,
            findex: 0,
            status: FlowStatus::none(),
            slot: SLOT_NONE,
            opposite: None,
            last_seen: Timeval::ZERO,
            first_seen: Timeval::ZERO,
            duration: Timeval::ZERO,
            key: FlowKey::default(),
            pad_len: 0,
            timeout: 0.0,
            last_ipid: 0,
            last_frag_id: 0,
            subnet_src: 0,
            subnet_dst: 0,
        }
    }
}

impl Flow {
    /// Returns `true` if this record is an LRU sentinel, never a data flow.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.timeout.is_infinite()
    }

    /// Returns `true` if the flow has a paired opposite direction.
    #[inline]
    pub fn has_opposite(&self) -> bool {
        self.opposite.is_some()
    }

    /// Returns `true` for the initiator half of a biflow.
    #[inline]
    pub fn is_a(&self) -> bool {
        !self.status.contains(FlowStatus::L3FlowInvert)
    }

    /// Flow direction as a character, `'A'` or `'B'`.
    #[inline]
    pub fn direction(&self) -> char {
        if self.is_a() {
            'A'
        } else {
            'B'
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_key() -> FlowKey {
        FlowKey {
            addrs: FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
            },
            vlan_id: 100,
            ether_type: 0x0800,
            src_port: 53,
            dst_port: 40000,
            proto: 17,
            sctp_stream: 0,
            sctp_vtag: 0,
        }
    }

    #[test]
    fn key_roundtrips_through_reverse() {
        let key = v4_key();
        let rev = key.reversed();
        assert_eq!(rev.src_port, 40000);
        assert_eq!(rev.dst_port, 53);
        assert_eq!(rev.reversed(), key);
        assert_ne!(key.to_bytes(), rev.to_bytes());
    }

    #[test]
    fn key_bytes_are_stable() {
        let key = v4_key();
        assert_eq!(key.to_bytes(), key.to_bytes());
        // vlan participates in the key
        let mut other = key;
        other.vlan_id = 200;
        assert_ne!(key.to_bytes(), other.to_bytes());
    }

    #[test]
    fn frag_key_ignores_ports() {
        let key = v4_key();
        let mut other = key;
        other.src_port = 9999;
        assert_eq!(key.frag_key(7), other.frag_key(7));
        assert_ne!(key.frag_key(7), key.frag_key(8));
    }

    #[test]
    fn sentinel_flag_is_infinite_timeout() {
        let mut flow = Flow::default();
        assert!(!flow.is_sentinel());
        flow.timeout = f32::INFINITY;
        assert!(flow.is_sentinel());
    }
}
