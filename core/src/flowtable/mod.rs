//! Flow state management.
//!
//! The flow table couples three structures sharing one index space: the main
//! hash table whose chain slots number the flow arena, the arena of flow
//! records itself, and an LRU doubly-linked list threaded through the records
//! as slot indices. Timeout classes partition the LRU with sentinel records
//! so that expiry scans touch only flows that can actually have timed out.

pub mod flow;
pub mod fragments;
pub mod hashtable;

use self::flow::{Flow, FlowKey, FlowStatus, FLOW_KEY_LEN, SLOT_NONE};
use self::fragments::FragmentIndex;
use self::hashtable::HashTable;
use crate::config::FlowTableConfig;
use crate::utils::timeval::Timeval;

/// Number of flows flushed when the main table runs full (autopilot).
pub const FLOWS_EVICTED_WHEN_FULL: usize = 1;

struct TimeoutClass {
    /// Timeout value in seconds.
    timeout: f32,
    /// Arena slot of this class's LRU sentinel.
    sentinel: usize,
}

/// Flow arena, main hash table, fragment index and LRU in one structure.
///
/// Slots `0..capacity()` hold data flows; higher slots hold the LRU head and
/// tail and one sentinel per registered timeout class.
pub struct FlowTable {
    table: HashTable,
    pub frag: FragmentIndex,
    pub flows: Vec<Flow>,
    live: Vec<bool>,
    capacity: usize,
    lru_head: usize,
    lru_tail: usize,
    timeouts: Vec<TimeoutClass>,
    /// Timeout in seconds assigned to newly created flows.
    pub default_timeout: f32,
    /// Evict the oldest flows instead of failing when the table is full.
    pub autopilot: bool,
}

impl FlowTable {
    pub fn new(config: &FlowTableConfig) -> Self {
        let table = HashTable::new(config.scale_factor, FLOW_KEY_LEN, "main");
        let capacity = table.pool_len();
        let frag = FragmentIndex::new(config.scale_factor);

        let mut flows = vec![Flow::default(); capacity + 2];
        let lru_head = capacity;
        let lru_tail = capacity + 1;
        flows[lru_head].timeout = f32::INFINITY;
        flows[lru_tail].timeout = f32::INFINITY;
        flows[lru_head].lru_next = lru_tail;
        flows[lru_tail].lru_prev = lru_head;

        let mut this = FlowTable {
            table,
            frag,
            flows,
            live: vec![false; capacity],
            capacity,
            lru_head,
            lru_tail,
            timeouts: Vec::new(),
            default_timeout: config.flow_timeout,
            autopilot: config.autopilot,
        };
        this.register_timeout(config.flow_timeout);
        this
    }

    /// Number of data-flow slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tracked flows.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if no slot remains for a new flow.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.table.is_full()
    }

    /// Free slots remaining in the chain pool.
    #[inline]
    pub fn free_len(&self) -> usize {
        self.table.free_len()
    }

    /// Returns `true` if `slot` currently holds a data flow.
    #[inline]
    pub fn is_live(&self, slot: usize) -> bool {
        slot < self.capacity && self.live[slot]
    }

    /// Looks up the slot tracking `key`.
    pub fn lookup(&self, key: &FlowKey) -> Option<usize> {
        self.table.lookup(&key.to_bytes())
    }

    /// Inserts `key` into the main table, yielding the slot for its flow.
    ///
    /// Fails only when the pool is exhausted; the engine runs autopilot
    /// eviction before retrying or aborts.
    pub fn insert_key(&mut self, key: &FlowKey) -> Option<usize> {
        self.table.insert(&key.to_bytes())
    }

    /// Initializes the record in `slot` for a new flow and links it at the
    /// head of the LRU.
    pub fn init_flow(&mut self, slot: usize, key: FlowKey, ts: Timeval) {
        let timeout = self.default_timeout;
        let flow = &mut self.flows[slot];
        *flow = Flow {
            slot,
            key,
            first_seen: ts,
            last_seen: ts,
            timeout,
            last_ipid: u32::MAX,
            ..Flow::default()
        };
        self.live[slot] = true;
        self.lru_unlink(slot);
        self.lru_to_head(slot);
    }

    /// Moves `slot` to the head of the LRU list.
    pub fn touch(&mut self, slot: usize) {
        if self.flows[self.lru_head].lru_next != slot {
            self.lru_unlink(slot);
            self.lru_to_head(slot);
        }
    }

    fn lru_unlink(&mut self, slot: usize) {
        let prev = self.flows[slot].lru_prev;
        let next = self.flows[slot].lru_next;
        if prev != SLOT_NONE {
            self.flows[prev].lru_next = next;
        }
        if next != SLOT_NONE {
            self.flows[next].lru_prev = prev;
        }
        self.flows[slot].lru_prev = SLOT_NONE;
        self.flows[slot].lru_next = SLOT_NONE;
    }

    fn lru_to_head(&mut self, slot: usize) {
        let first = self.flows[self.lru_head].lru_next;
        self.flows[slot].lru_next = first;
        self.flows[slot].lru_prev = self.lru_head;
        self.flows[first].lru_prev = slot;
        self.flows[self.lru_head].lru_next = slot;
    }

    /// Inserts `slot` between `after` and its current successor.
    fn lru_insert_after(&mut self, slot: usize, after: usize) {
        let next = self.flows[after].lru_next;
        self.flows[slot].lru_prev = after;
        self.flows[slot].lru_next = next;
        self.flows[next].lru_prev = slot;
        self.flows[after].lru_next = slot;
    }

    /// Registers a timeout class for `timeout` seconds.
    ///
    /// Classes are created lazily the first time a flow requests the value;
    /// each owns a sentinel placed in front of the LRU tail, and the class
    /// list stays ordered by descending timeout.
    pub fn register_timeout(&mut self, timeout: f32) {
        if self.timeouts.iter().any(|t| t.timeout == timeout) {
            return;
        }

        let sentinel = self.flows.len();
        self.flows.push(Flow {
            timeout: f32::INFINITY,
            slot: sentinel,
            ..Flow::default()
        });
        let tail_prev = self.flows[self.lru_tail].lru_prev;
        self.lru_insert_after(sentinel, tail_prev);

        let pos = self
            .timeouts
            .iter()
            .position(|t| timeout > t.timeout)
            .unwrap_or(self.timeouts.len());
        self.timeouts.insert(pos, TimeoutClass { timeout, sentinel });
    }

    /// Updates the timeout of a live flow, registering its class on first use.
    pub fn set_flow_timeout(&mut self, slot: usize, timeout: f32) {
        self.register_timeout(timeout);
        self.flows[slot].timeout = timeout;
    }

    /// Scans every timeout class and returns the slots whose time has come,
    /// oldest first, migrating each class sentinel behind the last inspected
    /// flow so subsequent scans are amortized.
    ///
    /// A flow is expired only when it exceeded its own timeout and its
    /// opposite, if any, did too. Returned slots are still live; the caller
    /// terminates them (which also removes their opposites, so later entries
    /// may already be gone by then).
    pub fn collect_expired(&mut self, now: &Timeval) -> Vec<usize> {
        let mut expired = Vec::new();
        for ci in 0..self.timeouts.len() {
            let class_timeout = self.timeouts[ci].timeout as f64;
            let sentinel = self.timeouts[ci].sentinel;
            let start = self.flows[sentinel].lru_prev;
            let mut cursor = start;

            while cursor != self.lru_head {
                if self.flows[cursor].is_sentinel() {
                    cursor = self.flows[cursor].lru_prev;
                    continue;
                }
                let age = now.elapsed_since(&self.flows[cursor].last_seen);
                if age < class_timeout {
                    break;
                }
                let prev = self.flows[cursor].lru_prev;
                if age >= self.flows[cursor].timeout as f64 {
                    let opposite_expired = match self.flows[cursor].opposite {
                        None => true,
                        Some(opp) => {
                            now.elapsed_since(&self.flows[opp].last_seen)
                                >= self.flows[opp].timeout as f64
                        }
                    };
                    if opposite_expired {
                        expired.push(cursor);
                    }
                }
                cursor = prev;
            }

            if cursor != start {
                self.lru_unlink(sentinel);
                self.lru_insert_after(sentinel, cursor);
            }
        }
        expired
    }

    /// Returns up to `n` of the oldest data flows, oldest first.
    pub fn oldest_slots(&self, n: usize) -> Vec<usize> {
        let mut slots = Vec::with_capacity(n.min(self.len()));
        let mut cursor = self.flows[self.lru_tail].lru_prev;
        while cursor != self.lru_head && slots.len() < n {
            if !self.flows[cursor].is_sentinel() {
                slots.push(cursor);
            }
            cursor = self.flows[cursor].lru_prev;
        }
        slots
    }

    /// Returns every live flow, oldest first, for end-of-run draining.
    pub fn drain_order(&self) -> Vec<usize> {
        self.oldest_slots(usize::MAX)
    }

    /// Removes the flow in `slot` and its opposite from the main table, the
    /// fragment index and the LRU, freeing both slots.
    pub fn remove(&mut self, slot: usize) {
        let targets = [Some(slot), self.flows[slot].opposite];
        for s in targets.into_iter().flatten() {
            if !self.is_live(s) {
                continue;
            }
            let key_bytes = self.flows[s].key.to_bytes();
            if !self.table.remove(&key_bytes) {
                // Should not happen; leave the record linked so the
                // inconsistency stays visible.
                log::warn!(
                    "failed to remove flow {} ({}) from the main table",
                    self.flows[s].findex,
                    self.flows[s].key
                );
                continue;
            }
            if self.flows[s].status.contains(FlowStatus::Ipv4FragPending) {
                let frag_key = self.flows[s].key.frag_key(self.flows[s].last_frag_id);
                if !self.frag.remove(&frag_key) {
                    log::warn!("pending fragment train of flow {} not indexed", self.flows[s].findex);
                }
            }
            self.lru_unlink(s);
            self.live[s] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowtable::flow::FlowAddrs;

    use std::net::Ipv4Addr;

    fn config() -> FlowTableConfig {
        FlowTableConfig {
            scale_factor: 0.0001,
            flow_timeout: 182.0,
            autopilot: true,
            ..Default::default()
        }
    }

    fn key(n: u8) -> FlowKey {
        FlowKey {
            addrs: FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, n),
                dst: Ipv4Addr::new(10, 0, 1, n),
            },
            src_port: 1000 + n as u16,
            dst_port: 80,
            proto: 6,
            ether_type: 0x0800,
            ..Default::default()
        }
    }

    fn create(table: &mut FlowTable, key: FlowKey, ts: Timeval) -> usize {
        let slot = table.insert_key(&key).unwrap();
        table.init_flow(slot, key, ts);
        slot
    }

    #[test]
    fn created_flow_is_found_until_removed() {
        let mut table = FlowTable::new(&config());
        let slot = create(&mut table, key(1), Timeval::new(100, 0));
        assert_eq!(table.lookup(&key(1)), Some(slot));
        assert!(table.is_live(slot));

        table.remove(slot);
        assert_eq!(table.lookup(&key(1)), None);
        assert!(!table.is_live(slot));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn expiry_respects_timeout_and_order() {
        let mut table = FlowTable::new(&config());
        let old = create(&mut table, key(1), Timeval::new(100, 0));
        let young = create(&mut table, key(2), Timeval::new(260, 0));

        // at t=300 the old flow (age 200 > 182) expires, the young does not
        let expired = table.collect_expired(&Timeval::new(300, 0));
        assert_eq!(expired, vec![old]);
        assert!(!expired.contains(&young));
    }

    #[test]
    fn touched_flow_does_not_expire() {
        let mut table = FlowTable::new(&config());
        let slot = create(&mut table, key(1), Timeval::new(100, 0));
        table.flows[slot].last_seen = Timeval::new(280, 0);
        table.touch(slot);
        assert!(table.collect_expired(&Timeval::new(300, 0)).is_empty());
    }

    #[test]
    fn paired_flow_waits_for_its_opposite() {
        let mut table = FlowTable::new(&config());
        let a = create(&mut table, key(1), Timeval::new(100, 0));
        let b = create(&mut table, key(1).reversed(), Timeval::new(100, 0));
        table.flows[a].opposite = Some(b);
        table.flows[b].opposite = Some(a);

        // only B was refreshed; A must not expire alone
        table.flows[b].last_seen = Timeval::new(290, 0);
        table.touch(b);
        assert!(table.collect_expired(&Timeval::new(300, 0)).is_empty());

        // once B is old too the scan yields it, and removal takes A along
        let expired = table.collect_expired(&Timeval::new(600, 0));
        assert_eq!(expired, vec![b]);
        table.remove(b);
        assert_eq!(table.len(), 0);
        assert!(!table.is_live(a));
    }

    #[test]
    fn removal_purges_pending_fragment_state() {
        let mut table = FlowTable::new(&config());
        let slot = create(&mut table, key(3), Timeval::new(100, 0));
        let frag_key = key(3).frag_key(0xbeef);
        assert!(table.frag.insert(&frag_key, slot));
        table.flows[slot].status |= FlowStatus::Ipv4FragPending;
        table.flows[slot].last_frag_id = 0xbeef;

        table.remove(slot);
        assert!(table.frag.is_empty());
    }

    #[test]
    fn oldest_slots_skips_sentinels_and_orders_by_age() {
        let mut table = FlowTable::new(&config());
        let first = create(&mut table, key(1), Timeval::new(100, 0));
        let second = create(&mut table, key(2), Timeval::new(200, 0));
        let third = create(&mut table, key(3), Timeval::new(300, 0));

        assert_eq!(table.oldest_slots(2), vec![first, second]);
        assert_eq!(table.drain_order(), vec![first, second, third]);
    }

    #[test]
    fn timeout_classes_stay_sorted_descending() {
        let mut table = FlowTable::new(&config());
        table.register_timeout(10.0);
        table.register_timeout(600.0);
        table.register_timeout(10.0); // duplicate ignored
        let values: Vec<f32> = table.timeouts.iter().map(|t| t.timeout).collect();
        assert_eq!(values, vec![600.0, 182.0, 10.0]);
    }

    #[test]
    fn sentinel_migration_amortizes_scans() {
        let mut table = FlowTable::new(&config());
        create(&mut table, key(1), Timeval::new(100, 0));
        let young = create(&mut table, key(2), Timeval::new(290, 0));

        let _ = table.collect_expired(&Timeval::new(300, 0));
        // the default class sentinel now sits right behind the young flow
        let sentinel = table.timeouts[0].sentinel;
        assert_eq!(table.flows[young].lru_next, sentinel);
    }
}
