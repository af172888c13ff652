//! Ethernet frame.

use crate::utils::read_header;
use crate::utils::types::*;

use anyhow::Result;
use pnet::datalink::MacAddr;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType for Reverse ARP.
pub const ETHERTYPE_RARP: u16 = 0x8035;
/// EtherType for 802.1Q single-tagged frames.
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// EtherType for 802.1ad provider bridging (QinQ).
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
/// Legacy QinQ EtherType still emitted by some switches.
pub const ETHERTYPE_QINQ_OLD: u16 = 0x9100;
/// EtherType for MPLS unicast.
pub const ETHERTYPE_MPLS_UCAST: u16 = 0x8847;
/// EtherType for MPLS multicast.
pub const ETHERTYPE_MPLS_MCAST: u16 = 0x8848;
/// EtherType for PPPoE Discovery.
pub const ETHERTYPE_PPPOE_D: u16 = 0x8863;
/// EtherType for PPPoE Session.
pub const ETHERTYPE_PPPOE_S: u16 = 0x8864;
/// EtherType for LLDP.
pub const ETHERTYPE_LLDP: u16 = 0x88cc;
/// EtherType for ERSPAN types I and II.
pub const ETHERTYPE_ERSPAN: u16 = 0x88be;
/// EtherType for ERSPAN type III.
pub const ETHERTYPE_ERSPAN3: u16 = 0x22eb;
/// EtherType carried by GRE for PPP payloads (PPTP).
pub const ETHERTYPE_PPP: u16 = 0x880b;
/// Largest value of the 802.3 length field; greater means Ethernet II.
pub const LLC_MAX_LEN: u16 = 0x05dc;
/// Jumbo-frame LLC escape.
pub const ETHERTYPE_JUMBO_LLC: u16 = 0x8870;

/// Size of the src/dst MAC pair plus EtherType.
pub const ETH_HDR_LEN: usize = 14;
/// Size of one 802.1Q/802.1ad tag.
pub const VLAN_TAG_LEN: usize = 4;

/// An Ethernet frame header view.
#[derive(Debug)]
pub struct Ethernet {
    header: EthernetHeader,
    offset: usize,
}

impl Ethernet {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: EthernetHeader = read_header(frame, offset)?;
        Ok(Ethernet { header, offset })
    }

    /// Returns the destination MAC address.
    #[inline]
    pub fn dst(&self) -> MacAddr {
        self.header.dst
    }

    /// Returns the source MAC address.
    #[inline]
    pub fn src(&self) -> MacAddr {
        self.header.src
    }

    /// Returns the EtherType (or 802.3 length field) following the MAC pair.
    #[inline]
    pub fn ether_type(&self) -> u16 {
        self.header.ether_type.into()
    }

    /// Offset of the EtherType payload (first byte after the MAC header).
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + ETH_HDR_LEN
    }
}

/// Fixed portion of an Ethernet header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct EthernetHeader {
    dst: MacAddr,
    src: MacAddr,
    ether_type: u16be,
}

/// 802.1Q tag control information and the EtherType that follows it.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct VlanTag {
    tci: u16be,
    ether_type: u16be,
}

impl VlanTag {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        read_header(frame, offset)
    }

    /// Returns the 12-bit VLAN identifier.
    #[inline]
    pub fn vlan_id(&self) -> u16 {
        u16::from(self.tci) & 0x0fff
    }

    /// Returns the EtherType of the encapsulated protocol.
    #[inline]
    pub fn ether_type(&self) -> u16 {
        self.ether_type.into()
    }
}

/// A 4-byte MPLS label stack entry.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct MplsLabel(u32be);

impl MplsLabel {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        read_header(frame, offset)
    }

    /// Returns the 20-bit label value.
    #[inline]
    pub fn label(&self) -> u32 {
        u32::from(self.0) >> 12
    }

    /// Returns `true` if this entry is the bottom of the label stack.
    #[inline]
    pub fn bottom_of_stack(&self) -> bool {
        u32::from(self.0) & 0x100 != 0
    }
}
