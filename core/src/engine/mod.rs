//! The flow engine.
//!
//! One engine owns the flow table, the global counters and the shared output
//! buffer, and drives the per-packet pipeline: advance the clock, cycle the
//! LRU through the timeout manager, dissect the frame, attribute it to a
//! flow (creating and pairing flows as needed) and fan it out to the
//! plugins. Terminated flows are printed through the plugin chain, the A
//! side always before its B side, and their slots return to the free list.
//!
//! The engine never blocks and never unwinds across packets: recoverable
//! conditions become status bits and log lines, only unrecoverable state
//! (exhausted tables without autopilot) propagates as an error.

pub mod stats;

use self::stats::Stats;
use crate::config::RuntimeConfig;
use crate::dissect::{self, LinkType, PacketDescriptor};
use crate::fileman::{self, FileId};
use crate::flowtable::flow::{Flow, FlowAddrs, FlowKey, FlowStatus};
use crate::flowtable::{FlowTable, FLOWS_EVICTED_WHEN_FULL};
use crate::plugin::schema::BinaryValue;
use crate::plugin::{OutputBuffer, PluginRegistry};
use crate::protocols::packet::tcp::{ACK, SYN};
use crate::protocols::packet::{SCTP_PROTOCOL, TCP_PROTOCOL};
use crate::utils::timeval::Timeval;

use anyhow::{anyhow, bail, Result};
use pnet::datalink::MacAddr;

/// Well-known proxy ports that mark their sender as the responder.
const PROXY_PORTS: [u16; 2] = [8080, 8081];

pub struct Engine {
    pub table: FlowTable,
    pub stats: Stats,
    pub outbuf: OutputBuffer,
    /// Full record schema: engine columns followed by plugin columns.
    pub schema: Vec<BinaryValue>,
    /// Wall-clock reference, advanced by every packet.
    pub now: Timeval,

    link_type: LinkType,
    forced_duration: Option<u64>,
    forced_same_findex: bool,
    accept_crafted_fragments: bool,
    lapd_over_udp: bool,
    /// Forensic per-packet record file, when enabled.
    pkt_file: Option<FileId>,
    separator: String,

    /// Flows a plugin asked to remove, processed at the next cycle.
    pending_remove: Vec<usize>,
    seen_first_packet: bool,
}

impl Engine {
    pub fn new(config: &RuntimeConfig, schema: Vec<BinaryValue>) -> Self {
        Engine {
            table: FlowTable::new(&config.flowtable),
            stats: Stats::new(),
            outbuf: OutputBuffer::new(),
            schema,
            now: Timeval::ZERO,
            link_type: LinkType::Ethernet,
            forced_duration: config.flowtable.forced_duration,
            forced_same_findex: config.flowtable.forced_duration_same_findex,
            accept_crafted_fragments: config.flowtable.accept_crafted_fragments,
            lapd_over_udp: config.flowtable.lapd_over_udp,
            pkt_file: None,
            separator: config.output.separator.clone(),
            pending_remove: Vec::new(),
            seen_first_packet: false,
        }
    }

    /// Sets the link type of the current capture source.
    pub fn set_link_type(&mut self, link_type: LinkType) {
        self.link_type = link_type;
    }

    /// Enables per-packet forensic records into `file`.
    pub fn set_packet_file(&mut self, file: FileId) {
        self.pkt_file = Some(file);
    }

    /// Processes one captured frame. This is the per-packet pipeline.
    pub fn process_packet(
        &mut self,
        frame: &[u8],
        raw_len: u32,
        ts: Timeval,
        plugins: &mut PluginRegistry,
    ) -> Result<()> {
        let time_jumped = self.seen_first_packet && ts < self.now;
        self.now = ts;
        if !self.seen_first_packet {
            self.seen_first_packet = true;
            self.stats.start_tstamp = ts;
            self.stats.start_tstamp0 = ts;
        }

        self.cycle_lru(plugins);

        self.stats.num_packets += 1;
        self.stats.raw_bytes_on_wire += raw_len as u64;
        if frame.is_empty() {
            log::debug!("no data available for packet {}", self.stats.num_packets);
            return Ok(());
        }
        self.stats.bytes_processed += frame.len() as u64;

        let mut pkt = PacketDescriptor::new(frame, raw_len, ts);
        pkt.lapd_over_udp = self.lapd_over_udp;
        dissect::dissect(&mut pkt, self.link_type);
        if time_jumped {
            pkt.set_status(FlowStatus::TimeJump);
        }
        self.stats.warn(pkt.status);
        self.stats.pad_bytes_on_wire += pkt.pad_len.max(0) as u64;

        match pkt.ip_version {
            4 => self.stats.num_v4_packets += 1,
            6 => self.stats.num_v6_packets += 1,
            _ => {
                if pkt.status.contains(FlowStatus::L3Bogus) {
                    self.stats.num_vx_packets += 1;
                }
            }
        }
        self.stats
            .count_protocols(pkt.outer_ether_type, pkt.key.proto, pkt.snap_len);

        if pkt.has_l3() {
            self.dispatch_l3(&mut pkt, plugins)
        } else if pkt.src_mac != MacAddr::zero() {
            self.dispatch_l2(&mut pkt, plugins)
        } else {
            // nothing attributable, global counters only
            for p in plugins.iter_mut() {
                p.on_layer2(&pkt, None);
            }
            Ok(())
        }
    }

    /// Attribution of frames without a network layer: pure layer-2 flows
    /// keyed on the MAC pair, EtherType and VLAN.
    fn dispatch_l2(&mut self, pkt: &mut PacketDescriptor, plugins: &mut PluginRegistry) -> Result<()> {
        pkt.set_status(FlowStatus::L2Flow);
        let key = FlowKey {
            addrs: FlowAddrs::Mac {
                src: pkt.src_mac,
                dst: pkt.dst_mac,
            },
            vlan_id: pkt.key.vlan_id,
            ether_type: pkt.key.ether_type,
            ..Default::default()
        };
        let slot = match self.table.lookup(&key) {
            Some(slot) => {
                self.table.touch(slot);
                slot
            }
            None => self.create_flow(pkt, key, plugins)?,
        };
        self.finish_packet(pkt, slot, plugins, true);
        Ok(())
    }

    /// Attribution of IP packets, fragments and SCTP chunk trains included.
    fn dispatch_l3(&mut self, pkt: &mut PacketDescriptor, plugins: &mut PluginRegistry) -> Result<()> {
        for p in plugins.iter_mut() {
            p.on_layer2(pkt, None);
        }

        // fragments without a transport header attribute via the fragment
        // index only
        if pkt.is_fragment && pkt.frag_offset != 0 {
            return self.dispatch_late_fragment(pkt, plugins);
        }

        if pkt.key.proto == SCTP_PROTOCOL && !pkt.sctp_chunks.is_empty() {
            // each DATA chunk forms its own flow, non-DATA chunks share the
            // vtag-only control flow
            let chunks = pkt.sctp_chunks.clone();
            for chunk in &chunks {
                let mut key = pkt.key;
                key.sctp_stream = if chunk.chunk_type == 0 { chunk.stream } else { 0 };
                key.sctp_vtag = pkt.sctp_vtag;
                let slot = self.acquire_or_create(pkt, key, plugins)?;
                self.table.flows[slot].pad_len += chunk.padding as i64;
                self.finish_packet(pkt, slot, plugins, false);
            }
            return Ok(());
        }

        let key = pkt.key;
        let slot = self.acquire_or_create(pkt, key, plugins)?;
        self.handle_fragment_train(pkt, slot)?;
        self.finish_packet(pkt, slot, plugins, false);
        Ok(())
    }

    /// A non-first fragment: find the train's owner, or accept the crafted
    /// train by opening a flow for it.
    fn dispatch_late_fragment(
        &mut self,
        pkt: &mut PacketDescriptor,
        plugins: &mut PluginRegistry,
    ) -> Result<()> {
        match pkt.ip_version {
            4 => self.stats.num_frag_v4_packets += 1,
            _ => self.stats.num_frag_v6_packets += 1,
        }
        let frag_key = pkt.key.frag_key(pkt.frag_id);
        let slot = match self.table.frag.lookup(&frag_key) {
            Some(slot) if self.table.is_live(slot) => {
                self.table.touch(slot);
                if !pkt.frag_mf {
                    // last fragment of the train
                    self.table.frag.remove(&frag_key);
                    self.table.flows[slot].status &= !FlowStatus::Ipv4FragPending;
                }
                slot
            }
            _ => {
                // first fragment missed or reordered
                pkt.set_status(FlowStatus::Ipv4FragSeqError);
                self.stats.warn(FlowStatus::Ipv4FragSeqError);
                if !self.accept_crafted_fragments {
                    log::debug!("dropping headless fragment (id 0x{:x})", pkt.frag_id);
                    return Ok(());
                }
                let key = pkt.key;
                let slot = match self.table.lookup(&key) {
                    Some(slot) => {
                        self.table.touch(slot);
                        slot
                    }
                    None => self.create_flow(pkt, key, plugins)?,
                };
                // a stale entry may point at an evicted slot
                self.table.frag.remove(&frag_key);
                if pkt.frag_mf && !self.table.frag.insert(&frag_key, slot) {
                    bail!("fragment index full");
                }
                if pkt.frag_mf {
                    self.table.flows[slot].last_frag_id = pkt.frag_id;
                    self.table.flows[slot].status |= FlowStatus::Ipv4FragPending;
                }
                slot
            }
        };
        pkt.set_status(FlowStatus::Ipv4Frag);
        self.finish_packet(pkt, slot, plugins, false);
        Ok(())
    }

    /// Fragment-train bookkeeping for attributed packets: first fragments
    /// open a train, unfinished trains left behind are flagged.
    fn handle_fragment_train(&mut self, pkt: &mut PacketDescriptor, slot: usize) -> Result<()> {
        let pending = self.table.flows[slot]
            .status
            .contains(FlowStatus::Ipv4FragPending);
        if !pkt.is_fragment {
            if pending {
                self.table.flows[slot].status |= FlowStatus::Ipv4FragError;
                self.stats.warn(FlowStatus::Ipv4FragError);
            }
            return Ok(());
        }

        // first fragment: offset 0, more to come
        match pkt.ip_version {
            4 => self.stats.num_frag_v4_packets += 1,
            _ => self.stats.num_frag_v6_packets += 1,
        }
        pkt.set_status(FlowStatus::Ipv4Frag);
        self.table.flows[slot].status |= FlowStatus::Ipv4Frag;
        self.stats.warn(FlowStatus::Ipv4Frag);

        let frag_key = pkt.key.frag_key(pkt.frag_id);
        if pending {
            // previous train never completed
            let old_key = pkt.key.frag_key(self.table.flows[slot].last_frag_id);
            if !self.table.frag.remove(&old_key)
                || self.table.flows[slot].last_frag_id != pkt.frag_id
            {
                self.table.flows[slot].status |= FlowStatus::Ipv4FragError;
                self.stats.warn(FlowStatus::Ipv4FragError);
            }
            if !self.table.frag.insert(&frag_key, slot) {
                bail!("fragment index full");
            }
        } else if let Some(owner) = self.table.frag.lookup(&frag_key) {
            // identification collision between two flows; the newcomer wins
            log::debug!("fragment id 0x{:x} collided across flows", pkt.frag_id);
            if owner != slot && self.table.is_live(owner) {
                self.table.flows[owner].status &= !FlowStatus::Ipv4FragPending;
            }
            self.table.frag.reassign(&frag_key, slot);
        } else if !self.table.frag.insert(&frag_key, slot) {
            bail!(
                "fragment index full (flow {}, id 0x{:x})",
                self.table.flows[slot].findex,
                pkt.frag_id
            );
        }
        self.table.flows[slot].last_frag_id = pkt.frag_id;
        self.table.flows[slot].status |= FlowStatus::Ipv4FragPending;
        Ok(())
    }

    /// Looks the key up, handles forced-duration rollover, or creates the
    /// flow.
    fn acquire_or_create(
        &mut self,
        pkt: &mut PacketDescriptor,
        key: FlowKey,
        plugins: &mut PluginRegistry,
    ) -> Result<usize> {
        if let Some(slot) = self.table.lookup(&key) {
            if let Some(limit) = self.forced_duration {
                let age = (pkt.ts.sec - self.table.flows[slot].first_seen.sec).max(0) as u64;
                if age >= limit {
                    // wrap the conversation into a fresh flow
                    let flow = &self.table.flows[slot];
                    pkt.status_carry |= flow.status & FlowStatus::L3FlowInvert;
                    if self.forced_same_findex {
                        pkt.status_carry |= FlowStatus::FdSameIndex;
                        pkt.findex_carry = flow.findex;
                    }
                    self.table.flows[slot].status |= FlowStatus::RemoveFlow;
                    self.stats.warn(FlowStatus::RemoveFlow);
                    self.print_flow(slot, plugins);
                    self.remove_flow(slot);
                    return self.create_flow(pkt, key, plugins);
                }
            }
            self.table.touch(slot);
            // consecutive duplicate IP identification
            if pkt.ip_version == 4 && pkt.ipid != 0 {
                if pkt.ipid == self.table.flows[slot].last_ipid {
                    pkt.set_status(FlowStatus::DuplicateIpId);
                    self.table.flows[slot].status |= FlowStatus::DuplicateIpId;
                    self.stats.warn(FlowStatus::DuplicateIpId);
                }
                self.table.flows[slot].last_ipid = pkt.ipid;
            }
            return Ok(slot);
        }
        self.create_flow(pkt, key, plugins)
    }

    /// Creates a flow, pairing it with its reverse direction when present
    /// and deciding the A/B side otherwise.
    fn create_flow(
        &mut self,
        pkt: &PacketDescriptor,
        key: FlowKey,
        plugins: &mut PluginRegistry,
    ) -> Result<usize> {
        if self.table.is_full() {
            if !self.table.autopilot {
                bail!("main hash table full; rerun with a larger hash scale factor");
            }
            if !self.stats.global_warn.contains(FlowStatus::RemovedHashFull) {
                log::warn!(
                    "main hash table full: evicting the {} oldest flow(s); \
                     consider a larger hash scale factor",
                    FLOWS_EVICTED_WHEN_FULL
                );
            }
            for slot in self.table.oldest_slots(FLOWS_EVICTED_WHEN_FULL) {
                self.stats.autopilot_removed += 1;
                self.terminate_flow(slot, FlowStatus::RemovedHashFull, plugins);
            }
        }

        let slot = self
            .table
            .insert_key(&key)
            .ok_or_else(|| anyhow!("failed to insert flow into the main table"))?;
        self.table.init_flow(slot, key, pkt.ts);
        self.stats.flow_added();

        {
            let flow = &mut self.table.flows[slot];
            flow.subnet_src = 0;
            flow.subnet_dst = 0;
            match key.addrs {
                FlowAddrs::Mac { .. } => flow.status |= FlowStatus::L2Flow,
                FlowAddrs::V4 { .. } => flow.status |= FlowStatus::L2Ipv4,
                FlowAddrs::V6 { .. } => flow.status |= FlowStatus::L2Ipv6,
            }
        }
        match key.addrs {
            FlowAddrs::Mac { .. } => self.stats.l2_flows += 1,
            FlowAddrs::V4 { .. } => self.stats.ipv4_flows += 1,
            FlowAddrs::V6 { .. } => self.stats.ipv6_flows += 1,
        }

        let rev_key = key.reversed();
        match self.table.lookup(&rev_key) {
            Some(rev) if rev == slot => {
                // the reverse key is the flow itself
                if key.proto == TCP_PROTOCOL {
                    self.table.flows[slot].status |= FlowStatus::LandAttack;
                    self.stats.warn(FlowStatus::LandAttack);
                }
                self.table.flows[slot].findex = self.stats.next_findex();
                self.stats.a_flows += 1;
            }
            Some(rev) => {
                // pair with the opposite direction and inherit its index
                let rev_findex = self.table.flows[rev].findex;
                let rev_is_a = self.table.flows[rev].is_a();
                let rev_fd_bits = self.table.flows[rev].status & FlowStatus::FdSameIndex;
                self.table.flows[rev].opposite = Some(slot);
                let flow = &mut self.table.flows[slot];
                flow.opposite = Some(rev);
                flow.findex = rev_findex;
                if rev_is_a {
                    flow.status |= FlowStatus::L3FlowInvert;
                }
                if self.forced_same_findex {
                    flow.status |= rev_fd_bits;
                }
                self.stats.b_flows += 1;
            }
            None => {
                if key.proto == SCTP_PROTOCOL && (key.sctp_stream != 0 || key.sctp_vtag != 0) {
                    // streams of one association share the index of its
                    // vtag-only control flow
                    let mut ctrl = key;
                    ctrl.sctp_stream = 0;
                    self.table.flows[slot].findex = match self.table.lookup(&ctrl) {
                        Some(ctrl_slot) if ctrl_slot != slot => self.table.flows[ctrl_slot].findex,
                        _ => self.stats.next_findex(),
                    };
                } else if pkt.status_carry.contains(FlowStatus::FdSameIndex) {
                    let flow = &mut self.table.flows[slot];
                    flow.status |= FlowStatus::FdSameIndex;
                    flow.findex = pkt.findex_carry;
                } else {
                    self.table.flows[slot].findex = self.stats.next_findex();
                }
                self.stats.a_flows += 1;

                // direction heuristic: low or proxy source ports and pure
                // SYN|ACK responses mark the sender as the responder
                let sp = key.src_port;
                let dp = key.dst_port;
                let synack = key.proto == TCP_PROTOCOL && pkt.tcp_flags & (SYN | ACK) == (SYN | ACK);
                let flow = &mut self.table.flows[slot];
                if (sp < 1024 && sp < dp) || PROXY_PORTS.contains(&sp) || synack {
                    flow.status |= FlowStatus::L3FlowInvert;
                } else {
                    flow.status |= pkt.status_carry;
                }
            }
        }

        self.stats.warn(self.table.flows[slot].status);
        let flow = &self.table.flows[slot];
        for p in plugins.iter_mut() {
            p.on_flow_gen(flow, pkt);
        }
        Ok(slot)
    }

    /// Common tail of packet attribution: status merge, timestamps, plugin
    /// layer hooks, direction counters and the forensic record.
    fn finish_packet(
        &mut self,
        pkt: &PacketDescriptor,
        slot: usize,
        plugins: &mut PluginRegistry,
        l2_flow: bool,
    ) {
        {
            let flow = &mut self.table.flows[slot];
            flow.status |= pkt.status;
            flow.last_seen = pkt.ts;
            flow.pad_len += pkt.pad_len;
        }
        self.stats.warn(pkt.status);

        if l2_flow {
            let flow = &self.table.flows[slot];
            for p in plugins.iter_mut() {
                p.on_layer2(pkt, Some(flow));
            }
        }
        {
            let flow = &mut self.table.flows[slot];
            for p in plugins.iter_mut() {
                p.on_layer4(pkt, flow);
            }
            if flow.status.contains(FlowStatus::RemoveFlow) {
                // a plugin asked for instant removal; honored at the next
                // cycle so the current packet completes its fan-out
                self.pending_remove.push(slot);
            }
        }

        let flow = &self.table.flows[slot];
        if flow.is_a() {
            self.stats.num_a_packets += 1;
            self.stats.num_a_bytes += pkt.snap_len as u64;
        } else {
            self.stats.num_b_packets += 1;
            self.stats.num_b_bytes += pkt.snap_len as u64;
        }

        if self.pkt_file.is_some() {
            self.write_packet_record(pkt, slot, plugins);
        }
    }

    /// One line per dispatched packet in forensic mode.
    fn write_packet_record(&mut self, pkt: &PacketDescriptor, slot: usize, plugins: &mut PluginRegistry) {
        let Some(file) = self.pkt_file else { return };
        let sep = self.separator.clone();
        let flow = &self.table.flows[slot];
        let mut line = format!(
            "{}{sep}{}{sep}0x{:016x}{sep}{}",
            self.stats.num_packets,
            flow.findex,
            pkt.status.raw(),
            pkt.hdr_desc
        );
        for p in plugins.iter_mut() {
            p.packet_record(pkt, flow, &mut line);
        }
        line.push_str(&sep);
        for &byte in pkt.l7_payload() {
            line.push(if (0x20..0x7f).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        line.push('\n');
        if let Err(e) = fileman::global().lock().unwrap().write_str(file, &line) {
            log::warn!("packet record dropped: {e}");
        }
    }

    /// Terminates any flow whose time has come, plus plugin-requested
    /// removals from the previous packet.
    fn cycle_lru(&mut self, plugins: &mut PluginRegistry) {
        let pending = std::mem::take(&mut self.pending_remove);
        for slot in pending {
            if self.table.is_live(slot)
                && self.table.flows[slot].status.contains(FlowStatus::RemoveFlow)
            {
                self.print_flow(slot, plugins);
                self.remove_flow(slot);
            }
        }

        let now = self.now;
        for slot in self.table.collect_expired(&now) {
            if self.table.is_live(slot) {
                self.terminate_flow(slot, FlowStatus::FlowTimeout, plugins);
            }
        }
    }

    /// Terminates the flow in `slot` (and its opposite) with `extra` status
    /// bits, printing both through the plugin chain.
    pub fn terminate_flow(&mut self, slot: usize, extra: FlowStatus, plugins: &mut PluginRegistry) {
        if !self.table.is_live(slot) {
            return;
        }
        self.stats.warn(extra);
        self.table.flows[slot].status |= extra;
        if let Some(opp) = self.table.flows[slot].opposite {
            self.table.flows[opp].status |= extra;
        }
        self.print_flow(slot, plugins);
        self.remove_flow(slot);
    }

    /// Prints the A side first, then the B side.
    fn print_flow(&mut self, slot: usize, plugins: &mut PluginRegistry) {
        let flow = &self.table.flows[slot];
        match flow.opposite {
            None => {
                if !flow.is_a() {
                    // a responder whose initiator never showed up
                    self.stats.corr_repl_flows += 1;
                }
                self.emit_flow(slot, 0, plugins);
            }
            Some(opp) => {
                if self.table.flows[slot].is_a() {
                    self.emit_flow(slot, 0, plugins);
                    self.emit_flow(opp, 1, plugins);
                } else {
                    self.emit_flow(opp, 0, plugins);
                    self.emit_flow(slot, 1, plugins);
                }
            }
        }
    }

    /// Emits one direction of a flow through `on_flow_term` and the sinks.
    fn emit_flow(&mut self, slot: usize, dir: u8, plugins: &mut PluginRegistry) {
        {
            let flow = &mut self.table.flows[slot];
            flow.duration = flow.last_seen - flow.first_seen;
        }
        self.outbuf.append_u8(dir);
        self.outbuf.append_u64(self.table.flows[slot].findex);

        let flow = &self.table.flows[slot];
        let outbuf = &mut self.outbuf;
        for p in plugins.iter_mut() {
            p.on_flow_term(flow, outbuf);
        }
        for p in plugins.iter_mut() {
            if let Err(e) = p.buf_to_sink(&self.outbuf, &self.schema) {
                log::warn!("sink {} dropped a record: {e}", p.name());
            }
        }
        self.outbuf.reset();
    }

    fn remove_flow(&mut self, slot: usize) {
        let before = self.table.len();
        self.table.remove(slot);
        for _ in self.table.len()..before {
            self.stats.flow_removed();
        }
    }

    /// Terminates every remaining flow, oldest first. Called at end of
    /// input and on interrupt-driven shutdown.
    pub fn drain(&mut self, plugins: &mut PluginRegistry) {
        for slot in self.table.drain_order() {
            if self.table.is_live(slot) {
                self.terminate_flow(slot, FlowStatus::none(), plugins);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::testutil::*;
    use crate::plugin::Plugin;
    use crate::protocols::packet::{tcp, UDP_PROTOCOL};

    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Trace {
        gens: Vec<u64>,
        terms: Vec<(u64, char)>,
        l4_packets: u64,
    }

    struct Probe {
        trace: Rc<RefCell<Trace>>,
    }

    impl Plugin for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }
        fn number(&self) -> u16 {
            1
        }
        fn on_flow_gen(&mut self, flow: &Flow, _pkt: &PacketDescriptor) {
            self.trace.borrow_mut().gens.push(flow.findex);
        }
        fn on_layer4(&mut self, _pkt: &PacketDescriptor, _flow: &mut Flow) {
            self.trace.borrow_mut().l4_packets += 1;
        }
        fn on_flow_term(&mut self, flow: &Flow, _out: &mut OutputBuffer) {
            self.trace
                .borrow_mut()
                .terms
                .push((flow.findex, flow.direction()));
        }
    }

    fn tiny_engine() -> (Engine, PluginRegistry, Rc<RefCell<Trace>>) {
        let mut config = RuntimeConfig::offline("unused.pcap");
        config.flowtable.scale_factor = 0.0001;
        let trace = Rc::new(RefCell::new(Trace::default()));
        let plugins = PluginRegistry::build(vec![Box::new(Probe {
            trace: trace.clone(),
        })])
        .unwrap();
        let schema = plugins.build_headers();
        (Engine::new(&config, schema), plugins, trace)
    }

    fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        eth_frame(
            0x0800,
            &ipv4_pkt(src, dst, UDP_PROTOCOL, &udp_dgram(sport, dport, payload)),
        )
    }

    #[test]
    fn reply_pairs_with_request_and_shares_findex() {
        let (mut engine, mut plugins, trace) = tiny_engine();

        // dns-style exchange: low source port marks the first packet as B
        let query = udp_frame([10, 0, 0, 1], 53, [10, 0, 0, 2], 40000, &[0; 52]);
        let reply = udp_frame([10, 0, 0, 2], 40000, [10, 0, 0, 1], 53, &[0; 92]);
        engine
            .process_packet(&query, query.len() as u32, Timeval::new(100, 0), &mut plugins)
            .unwrap();
        engine
            .process_packet(&reply, reply.len() as u32, Timeval::new(100, 500), &mut plugins)
            .unwrap();

        assert_eq!(engine.table.len(), 2);
        let b = engine.table.lookup(&engine.table.flows[0].key).unwrap();
        let flows = &engine.table.flows;
        let first = &flows[b];
        let second = &flows[first.opposite.expect("paired")];
        assert_eq!(first.findex, second.findex);
        // the responder (port 53) sent first, so it is the B side
        let (a, b) = if first.is_a() { (first, second) } else { (second, first) };
        assert_eq!(a.key.src_port, 40000);
        assert_eq!(b.key.src_port, 53);
        assert_eq!(trace.borrow().gens.len(), 2);
        assert_eq!(trace.borrow().l4_packets, 2);

        engine.drain(&mut plugins);
        // A emitted before B, exactly once each
        assert_eq!(trace.borrow().terms, vec![(1, 'A'), (1, 'B')]);
    }

    #[test]
    fn lone_syn_is_an_a_flow() {
        let (mut engine, mut plugins, _trace) = tiny_engine();
        let syn = eth_frame(
            0x0800,
            &ipv4_pkt(
                [192, 168, 1, 10],
                [192, 168, 1, 20],
                6,
                &tcp_segment(33333, 80, tcp::SYN, b""),
            ),
        );
        engine
            .process_packet(&syn, syn.len() as u32, Timeval::new(1, 0), &mut plugins)
            .unwrap();
        let slot = engine.table.drain_order()[0];
        assert!(engine.table.flows[slot].is_a());
    }

    #[test]
    fn lone_synack_is_a_b_flow() {
        let (mut engine, mut plugins, _trace) = tiny_engine();
        let synack = eth_frame(
            0x0800,
            &ipv4_pkt(
                [192, 168, 1, 20],
                [192, 168, 1, 10],
                6,
                &tcp_segment(4000, 33333, tcp::SYN | tcp::ACK, b""),
            ),
        );
        engine
            .process_packet(&synack, synack.len() as u32, Timeval::new(1, 0), &mut plugins)
            .unwrap();
        let slot = engine.table.drain_order()[0];
        assert!(!engine.table.flows[slot].is_a());
    }

    #[test]
    fn land_attack_sets_the_bit() {
        let (mut engine, mut plugins, _trace) = tiny_engine();
        let frame = eth_frame(
            0x0800,
            &ipv4_pkt(
                [10, 0, 0, 1],
                [10, 0, 0, 1],
                6,
                &tcp_segment(80, 80, tcp::SYN, b""),
            ),
        );
        engine
            .process_packet(&frame, frame.len() as u32, Timeval::new(1, 0), &mut plugins)
            .unwrap();
        let slot = engine.table.drain_order()[0];
        assert!(engine.table.flows[slot].status.contains(FlowStatus::LandAttack));
    }

    #[test]
    fn fragment_train_attributes_and_completes() {
        let (mut engine, mut plugins, trace) = tiny_engine();

        let first = eth_frame(
            0x0800,
            &ipv4_frag_pkt(
                [10, 0, 0, 1],
                [10, 0, 0, 2],
                UDP_PROTOCOL,
                0xbeef,
                0,
                true,
                &udp_dgram(1111, 2222, &[0; 64]),
            ),
        );
        let last = eth_frame(
            0x0800,
            &ipv4_frag_pkt([10, 0, 0, 1], [10, 0, 0, 2], UDP_PROTOCOL, 0xbeef, 185, false, &[0; 64]),
        );

        engine
            .process_packet(&first, first.len() as u32, Timeval::new(10, 0), &mut plugins)
            .unwrap();
        let slot = engine.table.drain_order()[0];
        assert!(engine.table.flows[slot].status.contains(FlowStatus::Ipv4FragPending));
        assert_eq!(engine.table.frag.len(), 1);

        engine
            .process_packet(&last, last.len() as u32, Timeval::new(10, 1000), &mut plugins)
            .unwrap();
        // both fragments landed on one flow, the train is complete
        assert_eq!(engine.table.len(), 1);
        assert!(!engine.table.flows[slot].status.contains(FlowStatus::Ipv4FragPending));
        assert!(engine.table.flows[slot].status.contains(FlowStatus::Ipv4Frag));
        assert!(engine.table.frag.is_empty());
        assert_eq!(trace.borrow().l4_packets, 2);
    }

    #[test]
    fn inactive_flows_time_out_through_the_pipeline() {
        let (mut engine, mut plugins, trace) = tiny_engine();
        let early = udp_frame([10, 0, 0, 1], 9000, [10, 0, 0, 2], 9001, b"x");
        engine
            .process_packet(&early, early.len() as u32, Timeval::new(100, 0), &mut plugins)
            .unwrap();

        // a packet far in the future expires the idle flow on arrival
        let late = udp_frame([10, 9, 9, 9], 9000, [10, 0, 0, 2], 9001, b"y");
        engine
            .process_packet(&late, late.len() as u32, Timeval::new(500, 0), &mut plugins)
            .unwrap();

        let terms = trace.borrow().terms.clone();
        assert_eq!(terms.len(), 1);
        assert_eq!(engine.table.len(), 1);
        assert!(engine
            .stats
            .global_warn
            .contains(FlowStatus::FlowTimeout));
    }

    #[test]
    fn forced_duration_rolls_flows_and_keeps_findex() {
        let (mut engine, mut plugins, trace) = tiny_engine();
        engine.forced_duration = Some(60);
        engine.forced_same_findex = true;

        let frame = udp_frame([10, 0, 0, 1], 5555, [10, 0, 0, 2], 6666, b"x");
        for t in [0i64, 30, 70] {
            engine
                .process_packet(&frame, frame.len() as u32, Timeval::new(1000 + t, 0), &mut plugins)
                .unwrap();
        }

        // the 70s packet rolled the flow: one termination, one successor
        let terms = trace.borrow().terms.clone();
        assert_eq!(terms.len(), 1);
        assert_eq!(engine.table.len(), 1);
        let slot = engine.table.drain_order()[0];
        let successor = &engine.table.flows[slot];
        assert_eq!(successor.findex, terms[0].0);
        assert!(successor.status.contains(FlowStatus::FdSameIndex));
        assert_eq!(successor.first_seen, Timeval::new(1070, 0));
    }

    #[test]
    fn autopilot_evicts_the_oldest_when_full() {
        let (mut engine, mut plugins, trace) = tiny_engine();
        let capacity = engine.table.capacity();

        for i in 0..capacity {
            let frame = udp_frame(
                [10, (i >> 8) as u8, i as u8, 1],
                7000,
                [10, 200, 200, 2],
                7001,
                b"",
            );
            engine
                .process_packet(&frame, frame.len() as u32, Timeval::new(10 + i as i64, 0), &mut plugins)
                .unwrap();
        }
        assert!(engine.table.is_full());

        let one_more = udp_frame([172, 16, 0, 1], 7000, [172, 16, 0, 2], 7001, b"");
        engine
            .process_packet(
                &one_more,
                one_more.len() as u32,
                Timeval::new(10 + capacity as i64, 0),
                &mut plugins,
            )
            .unwrap();

        assert_eq!(engine.stats.autopilot_removed, 1);
        assert!(engine.stats.global_warn.contains(FlowStatus::RemovedHashFull));
        // the very first flow was the oldest and had to go
        assert_eq!(trace.borrow().terms.len(), 1);
        assert_eq!(trace.borrow().terms[0].0, 1);
    }

    #[test]
    fn sctp_streams_split_into_flows_sharing_findex() {
        let (mut engine, mut plugins, _trace) = tiny_engine();
        let chunks = sctp_pkt(7000, 8000, 0x99, &[(1, 0, b""), (0, 3, b"abc"), (0, 4, b"def")]);
        let frame = eth_frame(
            0x0800,
            &ipv4_pkt([10, 0, 0, 1], [10, 0, 0, 2], 132, &chunks),
        );
        engine
            .process_packet(&frame, frame.len() as u32, Timeval::new(5, 0), &mut plugins)
            .unwrap();

        // control flow + two stream flows
        assert_eq!(engine.table.len(), 3);
        let findexes: Vec<u64> = engine
            .table
            .drain_order()
            .iter()
            .map(|&s| engine.table.flows[s].findex)
            .collect();
        assert!(findexes.iter().all(|&f| f == findexes[0]));
    }
}
