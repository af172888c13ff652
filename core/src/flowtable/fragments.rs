//! Fragment-train index.
//!
//! Maps (endpoints, VLAN, fragment id) to the flow slot that owns the
//! fragment train, so non-first fragments, which carry no transport header,
//! can be attributed to the right flow. Entries are created by the first
//! fragment, updated on id collisions and removed by the last fragment or
//! when the owning flow is evicted.

use super::flow::FRAG_KEY_LEN;
use super::hashtable::HashTable;

/// Chain-pool scale of the fragment table relative to the main table.
const FRAG_SCALE_FACTOR: f64 = 0.25;

pub struct FragmentIndex {
    table: HashTable,
    /// Owning flow slot per fragment-table slot.
    owner: Vec<usize>,
}

impl FragmentIndex {
    pub fn new(scale: f64) -> Self {
        let table = HashTable::new(scale * FRAG_SCALE_FACTOR, FRAG_KEY_LEN, "frag");
        let owner = vec![usize::MAX; table.pool_len()];
        FragmentIndex { table, owner }
    }

    /// Looks up the flow owning the fragment train keyed by `key`.
    pub fn lookup(&self, key: &[u8; FRAG_KEY_LEN]) -> Option<usize> {
        self.table.lookup(key).map(|slot| self.owner[slot])
    }

    /// Registers `flow_slot` as the owner of the train keyed by `key`.
    ///
    /// Returns `false` when the fragment table itself is full; that table
    /// has no autopilot, so the caller treats it as fatal.
    pub fn insert(&mut self, key: &[u8; FRAG_KEY_LEN], flow_slot: usize) -> bool {
        match self.table.insert(key) {
            Some(slot) => {
                self.owner[slot] = flow_slot;
                true
            }
            None => false,
        }
    }

    /// Redirects an existing train to another flow (id collision between
    /// two flows).
    pub fn reassign(&mut self, key: &[u8; FRAG_KEY_LEN], flow_slot: usize) -> bool {
        match self.table.lookup(key) {
            Some(slot) => {
                self.owner[slot] = flow_slot;
                true
            }
            None => false,
        }
    }

    /// Removes the train keyed by `key`; a miss is reported, not fatal.
    pub fn remove(&mut self, key: &[u8; FRAG_KEY_LEN]) -> bool {
        self.table.remove(key)
    }

    /// Number of live fragment trains.
    pub fn len(&self) -> usize {
        self.table.occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowtable::flow::{FlowAddrs, FlowKey};

    use std::net::Ipv4Addr;

    fn key(frag_id: u32) -> [u8; FRAG_KEY_LEN] {
        let fkey = FlowKey {
            addrs: FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
            },
            proto: 17,
            ..Default::default()
        };
        fkey.frag_key(frag_id)
    }

    #[test]
    fn train_lifecycle() {
        let mut index = FragmentIndex::new(0.0004);
        assert!(index.insert(&key(1), 7));
        assert_eq!(index.lookup(&key(1)), Some(7));
        assert_eq!(index.lookup(&key(2)), None);

        assert!(index.reassign(&key(1), 9));
        assert_eq!(index.lookup(&key(1)), Some(9));

        assert!(index.remove(&key(1)));
        assert!(index.is_empty());
        assert!(!index.remove(&key(1)));
    }
}
