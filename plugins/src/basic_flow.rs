//! Canonical per-flow columns.
//!
//! Tracks per-direction packet and byte tallies plus packet-size extrema for
//! every flow and emits the standard column set on termination: status,
//! timestamps, the identification tuple, counts and rates.

use kestrel_core::flowtable::flow::{Flow, FlowAddrs};
use kestrel_core::plugin::schema::{BinaryValue, ColumnType};
use kestrel_core::{OutputBuffer, PacketDescriptor, Plugin};

/// Per-flow tallies, indexed by the flow's slot.
#[derive(Debug, Default, Clone)]
struct FlowTally {
    hdr_desc: String,
    packets: u64,
    bytes: u64,
    min_len: u32,
    max_len: u32,
}

#[derive(Default)]
pub struct BasicFlow {
    tallies: Vec<FlowTally>,
}

impl BasicFlow {
    pub fn new() -> Self {
        BasicFlow::default()
    }

    fn tally_mut(&mut self, slot: usize) -> &mut FlowTally {
        if slot >= self.tallies.len() {
            self.tallies.resize(slot + 1, FlowTally::default());
        }
        &mut self.tallies[slot]
    }
}

/// Renders either endpoint of the identification tuple.
fn addr_str(addrs: &FlowAddrs, dst: bool) -> String {
    match addrs {
        FlowAddrs::Mac { src, dst: d } => {
            if dst {
                d.to_string()
            } else {
                src.to_string()
            }
        }
        _ => {
            let ip = if dst { addrs.dst_ip() } else { addrs.src_ip() };
            ip.map(|i| i.to_string()).unwrap_or_default()
        }
    }
}

impl Plugin for BasicFlow {
    fn name(&self) -> &'static str {
        "basicFlow"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn number(&self) -> u16 {
        100
    }

    fn pri_hdr(&self) -> Vec<BinaryValue> {
        vec![
            BinaryValue::leaf("flowStat", "Flow status and warnings", ColumnType::Hex64),
            BinaryValue::leaf("timeFirst", "Date time of first packet", ColumnType::Timestamp),
            BinaryValue::leaf("timeLast", "Date time of last packet", ColumnType::Timestamp),
            BinaryValue::leaf("duration", "Flow duration", ColumnType::Duration),
            BinaryValue::leaf("hdrDesc", "Headers description", ColumnType::Str),
            BinaryValue::leaf("ethVlanID", "VLAN identifier", ColumnType::U16),
            BinaryValue::leaf("srcIP", "Source address", ColumnType::Str),
            BinaryValue::leaf("srcPort", "Source port", ColumnType::U16),
            BinaryValue::leaf("dstIP", "Destination address", ColumnType::Str),
            BinaryValue::leaf("dstPort", "Destination port", ColumnType::U16),
            BinaryValue::leaf("l4Proto", "Layer-4 protocol", ColumnType::U8),
            BinaryValue::leaf("numPktsSnt", "Packets sent", ColumnType::U64),
            BinaryValue::leaf("numBytesSnt", "Bytes sent", ColumnType::U64),
            BinaryValue::leaf("minPktSz", "Minimum packet size", ColumnType::U32),
            BinaryValue::leaf("maxPktSz", "Maximum packet size", ColumnType::U32),
            BinaryValue::leaf("avePktSize", "Average packet size", ColumnType::F32),
            BinaryValue::leaf("pktps", "Packets per second", ColumnType::F32),
            BinaryValue::leaf("bytps", "Bytes per second", ColumnType::F32),
            BinaryValue::leaf("padBytes", "Aggregated padding bytes", ColumnType::I64),
        ]
    }

    fn on_flow_gen(&mut self, flow: &Flow, pkt: &PacketDescriptor) {
        let tally = self.tally_mut(flow.slot);
        *tally = FlowTally {
            hdr_desc: pkt.hdr_desc.as_str().to_string(),
            min_len: u32::MAX,
            ..FlowTally::default()
        };
    }

    fn on_layer4(&mut self, pkt: &PacketDescriptor, flow: &mut Flow) {
        let size = if pkt.packet_len > 0 {
            pkt.packet_len
        } else {
            pkt.snap_len
        };
        let tally = self.tally_mut(flow.slot);
        tally.packets += 1;
        tally.bytes += size as u64;
        tally.min_len = tally.min_len.min(size);
        tally.max_len = tally.max_len.max(size);
    }

    fn on_flow_term(&mut self, flow: &Flow, out: &mut OutputBuffer) {
        let tally = self.tally_mut(flow.slot).clone();
        let duration = flow.duration.as_secs_f64();

        out.append_u64(flow.status.raw());
        out.append_time(flow.first_seen.sec as u64, flow.first_seen.usec as u32);
        out.append_time(flow.last_seen.sec as u64, flow.last_seen.usec as u32);
        out.append_time(flow.duration.sec as u64, flow.duration.usec as u32);
        out.append_str(&tally.hdr_desc);
        out.append_u16(flow.key.vlan_id);
        out.append_str(&addr_str(&flow.key.addrs, false));
        out.append_u16(flow.key.src_port);
        out.append_str(&addr_str(&flow.key.addrs, true));
        out.append_u16(flow.key.dst_port);
        out.append_u8(flow.key.proto);
        out.append_u64(tally.packets);
        out.append_u64(tally.bytes);
        out.append_u32(if tally.packets > 0 { tally.min_len } else { 0 });
        out.append_u32(tally.max_len);
        let ave = if tally.packets > 0 {
            tally.bytes as f32 / tally.packets as f32
        } else {
            0.0
        };
        out.append_f32(ave);
        let (pktps, bytps) = if duration > 0.0 {
            (
                tally.packets as f64 / duration,
                tally.bytes as f64 / duration,
            )
        } else {
            (0.0, 0.0)
        };
        out.append_f32(pktps as f32);
        out.append_f32(bytps as f32);
        out.append_i64(flow.pad_len);

        self.tallies[flow.slot] = FlowTally::default();
    }
}
