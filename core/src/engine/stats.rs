//! Global counters, end report and monitoring snapshots.
//!
//! Counters are owned by the capture thread; monitoring reads them without
//! locks and tolerates transient inconsistency between related values within
//! one interval.

use crate::flowtable::flow::FlowStatus;
use crate::utils::timeval::Timeval;

use std::collections::HashMap;
use std::io::{self, Write};

use chrono::{TimeZone, Utc};

/// Names of the layer-4 protocols singled out in monitoring output.
const MONITORED_PROTOCOLS: [(u8, &str); 5] = [
    (6, "tcp"),
    (17, "udp"),
    (1, "icmp"),
    (58, "icmp6"),
    (132, "sctp"),
];

/// Aggregated run counters.
#[derive(Debug, Clone)]
pub struct Stats {
    pub num_packets: u64,
    pub raw_bytes_on_wire: u64,
    pub bytes_processed: u64,
    pub pad_bytes_on_wire: u64,

    pub num_a_packets: u64,
    pub num_b_packets: u64,
    pub num_a_bytes: u64,
    pub num_b_bytes: u64,

    pub num_v4_packets: u64,
    pub num_v6_packets: u64,
    pub num_vx_packets: u64,
    pub num_frag_v4_packets: u64,
    pub num_frag_v6_packets: u64,

    /// Packets and bytes per outermost EtherType.
    pub l2_packets: HashMap<u16, (u64, u64)>,
    /// Packets and bytes per layer-4 protocol number.
    pub l3_packets: Vec<(u64, u64)>,

    /// Monotonic flow index counter.
    pub findex: u64,
    pub a_flows: u64,
    pub b_flows: u64,
    pub ipv4_flows: u64,
    pub ipv6_flows: u64,
    pub l2_flows: u64,
    pub cur_flows: u64,
    pub peak_flows: u64,
    /// Flows evicted by the hash autopilot.
    pub autopilot_removed: u64,
    /// B flows terminated without ever meeting their opposite.
    pub corr_repl_flows: u64,

    /// Union of every status bit seen this run.
    pub global_warn: FlowStatus,

    /// Timestamp of the first processed packet.
    pub start_tstamp: Timeval,
    /// Monitoring anchor for diff reports.
    pub start_tstamp0: Timeval,
    /// Snapshot of the previous monitoring interval (diff mode).
    prev: Option<Box<Stats>>,
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            num_packets: 0,
            raw_bytes_on_wire: 0,
            bytes_processed: 0,
            pad_bytes_on_wire: 0,
            num_a_packets: 0,
            num_b_packets: 0,
            num_a_bytes: 0,
            num_b_bytes: 0,
            num_v4_packets: 0,
            num_v6_packets: 0,
            num_vx_packets: 0,
            num_frag_v4_packets: 0,
            num_frag_v6_packets: 0,
            l2_packets: HashMap::new(),
            l3_packets: vec![(0, 0); 256],
            findex: 0,
            a_flows: 0,
            b_flows: 0,
            ipv4_flows: 0,
            ipv6_flows: 0,
            l2_flows: 0,
            cur_flows: 0,
            peak_flows: 0,
            autopilot_removed: 0,
            corr_repl_flows: 0,
            global_warn: FlowStatus::none(),
            start_tstamp: Timeval::ZERO,
            start_tstamp0: Timeval::ZERO,
            prev: None,
        }
    }

    /// Allocates the next flow index.
    #[inline]
    pub fn next_findex(&mut self) -> u64 {
        self.findex += 1;
        self.findex
    }

    /// Merges status bits into the process-wide warning register.
    #[inline]
    pub fn warn(&mut self, bits: FlowStatus) {
        self.global_warn |= bits;
    }

    /// Records one tracked flow more, updating the peak.
    pub fn flow_added(&mut self) {
        self.cur_flows += 1;
        if self.cur_flows > self.peak_flows {
            self.peak_flows = self.cur_flows;
        }
    }

    pub fn flow_removed(&mut self) {
        self.cur_flows = self.cur_flows.saturating_sub(1);
    }

    /// Counts a packet against the per-protocol tables.
    pub fn count_protocols(&mut self, ether_type: u16, l4_proto: u8, snap_len: u32) {
        let entry = self.l2_packets.entry(ether_type).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += snap_len as u64;
        let entry = &mut self.l3_packets[l4_proto as usize];
        entry.0 += 1;
        entry.1 += snap_len as u64;
    }

    /// Writes the end-of-run or monitoring report.
    pub fn print_report(
        &self,
        out: &mut dyn Write,
        now: Timeval,
        sensor_id: u32,
        monitoring: bool,
    ) -> io::Result<()> {
        let anchor = if monitoring {
            &self.start_tstamp0
        } else {
            &self.start_tstamp
        };
        let duration = now - *anchor;

        writeln!(out, "{:=<72}", "")?;
        writeln!(
            out,
            "Sensor {}: report at {} ({} capture time)",
            sensor_id,
            Utc.timestamp_opt(now.sec, (now.usec * 1000) as u32)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string())
                .unwrap_or_else(|| now.to_string()),
            duration,
        )?;
        writeln!(
            out,
            "Packets: {} processed, {} bytes on the wire, {} bytes dissected, {} padding",
            self.num_packets, self.raw_bytes_on_wire, self.bytes_processed, self.pad_bytes_on_wire
        )?;
        writeln!(
            out,
            "IP: {} v4, {} v6, {} other; fragments: {} v4, {} v6",
            self.num_v4_packets,
            self.num_v6_packets,
            self.num_vx_packets,
            self.num_frag_v4_packets,
            self.num_frag_v6_packets
        )?;
        writeln!(
            out,
            "Flows: {} total ({} A, {} B), {} v4, {} v6, {} layer-2; peak {} concurrent",
            self.a_flows + self.b_flows,
            self.a_flows,
            self.b_flows,
            self.ipv4_flows,
            self.ipv6_flows,
            self.l2_flows,
            self.peak_flows
        )?;
        writeln!(
            out,
            "Direction: A {} packets / {} bytes, B {} packets / {} bytes",
            self.num_a_packets, self.num_a_bytes, self.num_b_packets, self.num_b_bytes
        )?;
        if self.autopilot_removed > 0 {
            writeln!(
                out,
                "Autopilot: {} flow(s) evicted to keep the main table afloat",
                self.autopilot_removed
            )?;
        }

        let mut protos: Vec<(&u16, &(u64, u64))> = self.l2_packets.iter().collect();
        protos.sort_by_key(|(ethertype, _)| **ethertype);
        for (ethertype, (pkts, bytes)) in protos {
            writeln!(out, "  ethertype 0x{ethertype:04x}: {pkts} packets, {bytes} bytes")?;
        }
        for (proto, name) in MONITORED_PROTOCOLS {
            let (pkts, bytes) = self.l3_packets[proto as usize];
            if pkts > 0 {
                writeln!(out, "  {name}: {pkts} packets, {bytes} bytes")?;
            }
        }

        if self.global_warn != FlowStatus::none() {
            writeln!(out, "Aggregated status: 0x{:016x}", self.global_warn.raw())?;
            for (bit, label) in WARN_LABELS {
                if self.global_warn.contains(*bit) {
                    writeln!(out, "  {label}")?;
                }
            }
        }
        writeln!(out, "{:=<72}", "")?;
        Ok(())
    }

    /// One-line machine-parseable snapshot.
    pub fn machine_report(&self, out: &mut dyn Write, now: Timeval) -> io::Result<()> {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t0x{:016x}",
            now,
            self.findex,
            self.a_flows + self.b_flows,
            self.a_flows,
            self.b_flows,
            self.num_packets,
            self.num_a_packets,
            self.num_b_packets,
            self.num_v4_packets,
            self.num_v6_packets,
            self.bytes_processed,
            self.autopilot_removed,
            self.global_warn.raw()
        )
    }

    /// Remembers the current values as the diff anchor for the next
    /// monitoring interval.
    pub fn update_anchor(&mut self, now: Timeval) {
        self.start_tstamp0 = now;
        let mut snapshot = self.clone();
        snapshot.prev = None;
        self.prev = Some(Box::new(snapshot));
    }

    /// Values accumulated since the last anchor.
    pub fn diff(&self) -> Stats {
        let prev = match &self.prev {
            Some(prev) => prev,
            None => return self.clone(),
        };
        let mut d = self.clone();
        d.prev = None;
        d.num_packets -= prev.num_packets;
        d.raw_bytes_on_wire -= prev.raw_bytes_on_wire;
        d.bytes_processed -= prev.bytes_processed;
        d.num_a_packets -= prev.num_a_packets;
        d.num_b_packets -= prev.num_b_packets;
        d.num_a_bytes -= prev.num_a_bytes;
        d.num_b_bytes -= prev.num_b_bytes;
        d.num_v4_packets -= prev.num_v4_packets;
        d.num_v6_packets -= prev.num_v6_packets;
        d.a_flows -= prev.a_flows;
        d.b_flows -= prev.b_flows;
        d
    }

    /// Serializes the restorable counters for the session checkpoint.
    pub fn save_state(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "findex\t{}", self.findex)?;
        writeln!(out, "packets\t{}", self.num_packets)?;
        writeln!(out, "bytes\t{}", self.bytes_processed)?;
        writeln!(out, "aflows\t{}", self.a_flows)?;
        writeln!(out, "bflows\t{}", self.b_flows)?;
        writeln!(out, "warn\t0x{:016x}", self.global_warn.raw())?;
        Ok(())
    }

    /// Restores counters written by [`save_state`](Self::save_state).
    pub fn restore_state(&mut self, state: &str) {
        for line in state.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "findex" => self.findex = value.parse().unwrap_or(self.findex),
                "packets" => self.num_packets = value.parse().unwrap_or(self.num_packets),
                "bytes" => self.bytes_processed = value.parse().unwrap_or(self.bytes_processed),
                "aflows" => self.a_flows = value.parse().unwrap_or(self.a_flows),
                "bflows" => self.b_flows = value.parse().unwrap_or(self.b_flows),
                "warn" => {
                    if let Some(hex) = value.strip_prefix("0x") {
                        if let Ok(bits) = u64::from_str_radix(hex, 16) {
                            self.global_warn |= FlowStatus::from(bits);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Human labels of the warning bits surfaced in the end report.
const WARN_LABELS: &[(FlowStatus, &str)] = &[
    (FlowStatus::SNAP_LENGTH, "snaplen truncation encountered"),
    (FlowStatus::TimeJump, "timestamp jump, multi-path delay or clock adjustment"),
    (FlowStatus::LandAttack, "land attack: identical endpoint pairs"),
    (FlowStatus::Ipv4FragError, "fragmentation errors"),
    (FlowStatus::Ipv4FragSeqError, "fragment trains missing their first fragment"),
    (FlowStatus::DuplicateIpId, "consecutive duplicate IP identification"),
    (FlowStatus::L2Gre, "GRE tunnels"),
    (FlowStatus::L3Teredo, "Teredo tunnels"),
    (FlowStatus::L3Ayiya, "AYIYA tunnels"),
    (FlowStatus::L3Vxlan, "VXLAN encapsulation"),
    (FlowStatus::L3Geneve, "GENEVE encapsulation"),
    (FlowStatus::L3Capwap, "CAPWAP/LWAPP encapsulation"),
    (FlowStatus::L2Erspan, "ERSPAN mirroring"),
    (FlowStatus::IpPayloadLenMismatch, "IP payload length disagrees with framing"),
    (FlowStatus::HdrDescOverrun, "header description overrun"),
    (FlowStatus::RemovedHashFull, "autopilot evictions"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findex_is_monotonic() {
        let mut stats = Stats::new();
        assert_eq!(stats.next_findex(), 1);
        assert_eq!(stats.next_findex(), 2);
        assert_eq!(stats.findex, 2);
    }

    #[test]
    fn peak_tracks_concurrent_flows() {
        let mut stats = Stats::new();
        stats.flow_added();
        stats.flow_added();
        stats.flow_removed();
        stats.flow_added();
        assert_eq!(stats.cur_flows, 2);
        assert_eq!(stats.peak_flows, 2);
    }

    #[test]
    fn state_round_trips() {
        let mut stats = Stats::new();
        stats.findex = 42;
        stats.num_packets = 1000;
        stats.a_flows = 10;
        stats.global_warn |= FlowStatus::L2Gre;

        let mut buf = Vec::new();
        stats.save_state(&mut buf).unwrap();

        let mut restored = Stats::new();
        restored.restore_state(std::str::from_utf8(&buf).unwrap());
        assert_eq!(restored.findex, 42);
        assert_eq!(restored.num_packets, 1000);
        assert_eq!(restored.a_flows, 10);
        assert!(restored.global_warn.contains(FlowStatus::L2Gre));
    }

    #[test]
    fn diff_subtracts_anchor() {
        let mut stats = Stats::new();
        stats.num_packets = 100;
        stats.update_anchor(Timeval::new(10, 0));
        stats.num_packets = 175;
        assert_eq!(stats.diff().num_packets, 75);
    }
}
