//! Chained hash table over opaque fixed-width keys.
//!
//! The table is closed: hashing a key yields a bucket holding a singly-linked
//! chain of entries drawn from a pre-allocated pool. Each pool entry carries a
//! table-wide unique slot number in `0..pool_len()` which callers use to index
//! their own arrays (the flow table indexes its flow arena this way). Free
//! slots are kept on an intrusive free list.
//!
//! The mapping of keys onto slot numbers is not stable across re-insertion:
//! removing a key and inserting it again will, with high probability, yield a
//! different slot.

use ahash::RandomState;

use std::hash::{BuildHasher, Hash, Hasher};

/// Base number of chain-pool entries, scaled by the configured hash factor.
pub const CHAIN_POOL_BASE_SIZE: usize = 262_144;
/// Buckets per chain-pool entry.
pub const BUCKET_FACTOR: usize = 2;

/// Chain link; `next` threads both bucket chains and the free list.
#[derive(Clone, Copy)]
struct ChainEntry {
    next: Option<usize>,
}

/// A hash table mapping fixed-width byte keys to stable slot numbers.
pub struct HashTable {
    name: &'static str,
    key_len: usize,
    buckets: Vec<Option<usize>>,
    chains: Vec<ChainEntry>,
    /// Key bytes of every pool entry, `key_len` bytes per slot.
    keys: Vec<u8>,
    free_head: Option<usize>,
    free_len: usize,
    hasher: RandomState,
}

impl HashTable {
    /// Creates a table with `ceil(CHAIN_POOL_BASE_SIZE * scale)` slots.
    ///
    /// `name` labels the table in diagnostics. The hash seed is fixed at
    /// construction so identical keys hash identically for the lifetime of
    /// the table.
    pub fn new(scale: f64, key_len: usize, name: &'static str) -> Self {
        if scale < f64::EPSILON {
            panic!("hash table scale factor must be positive");
        }
        let pool_len = (CHAIN_POOL_BASE_SIZE as f64 * scale).ceil() as usize;
        let bucket_len = pool_len * BUCKET_FACTOR;

        let mut chains = vec![ChainEntry { next: None }; pool_len];
        for (i, entry) in chains.iter_mut().enumerate().take(pool_len - 1) {
            entry.next = Some(i + 1);
        }

        HashTable {
            name,
            key_len,
            buckets: vec![None; bucket_len],
            chains,
            keys: vec![0u8; pool_len * key_len],
            free_head: Some(0),
            free_len: pool_len,
            hasher: RandomState::with_seeds(
                0x9e37_79b9_7f4a_7c15,
                0xf39c_c060_5ced_c834,
                0x1082_276b_f3a2_7251,
                0xb492_b66f_be98_f273,
            ),
        }
    }

    /// Total number of slots in the chain pool.
    #[inline]
    pub fn pool_len(&self) -> usize {
        self.chains.len()
    }

    /// Number of free slots.
    #[inline]
    pub fn free_len(&self) -> usize {
        self.free_len
    }

    /// Number of occupied slots.
    #[inline]
    pub fn occupied(&self) -> usize {
        self.pool_len() - self.free_len
    }

    /// Returns `true` if no free slot remains.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_len == 0
    }

    #[inline]
    fn bucket_of(&self, key: &[u8]) -> usize {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        (h.finish() as usize) % self.buckets.len()
    }

    #[inline]
    fn key_at(&self, slot: usize) -> &[u8] {
        &self.keys[slot * self.key_len..(slot + 1) * self.key_len]
    }

    /// Searches for `key`; returns its slot or `None`.
    pub fn lookup(&self, key: &[u8]) -> Option<usize> {
        debug_assert_eq!(key.len(), self.key_len);
        let mut cursor = self.buckets[self.bucket_of(key)];
        while let Some(slot) = cursor {
            if self.key_at(slot) == key {
                return Some(slot);
            }
            cursor = self.chains[slot].next;
        }
        None
    }

    /// Inserts `key`, returning its new slot, or `None` when the pool is
    /// exhausted.
    ///
    /// Duplicate keys are not detected; callers that need uniqueness must
    /// look the key up first.
    pub fn insert(&mut self, key: &[u8]) -> Option<usize> {
        debug_assert_eq!(key.len(), self.key_len);
        let slot = match self.free_head {
            Some(slot) => slot,
            None => {
                log::debug!("{}: chain pool exhausted", self.name);
                return None;
            }
        };
        self.free_head = self.chains[slot].next;
        self.free_len -= 1;

        let bucket = self.bucket_of(key);
        self.chains[slot].next = self.buckets[bucket];
        self.buckets[bucket] = Some(slot);
        self.keys[slot * self.key_len..(slot + 1) * self.key_len].copy_from_slice(key);
        Some(slot)
    }

    /// Removes `key`, reinserting its slot into the free list.
    ///
    /// A missing key is a non-fatal miss reported as `false`.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        debug_assert_eq!(key.len(), self.key_len);
        let bucket = self.bucket_of(key);
        let mut prev: Option<usize> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(slot) = cursor {
            if self.key_at(slot) == key {
                match prev {
                    None => self.buckets[bucket] = self.chains[slot].next,
                    Some(p) => self.chains[p].next = self.chains[slot].next,
                }
                self.chains[slot].next = self.free_head;
                self.free_head = Some(slot);
                self.free_len += 1;
                return true;
            }
            prev = cursor;
            cursor = self.chains[slot].next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> HashTable {
        // 27 slots
        HashTable::new(0.0001, 8, "test")
    }

    #[test]
    fn insert_lookup_remove() {
        let mut table = small_table();
        let pool = table.pool_len();
        let key = *b"abcdefgh";

        let slot = table.insert(&key).unwrap();
        assert_eq!(table.lookup(&key), Some(slot));
        assert_eq!(table.free_len() + table.occupied(), pool);

        assert!(table.remove(&key));
        assert_eq!(table.lookup(&key), None);
        assert_eq!(table.free_len(), pool);
    }

    #[test]
    fn missing_key_is_a_miss() {
        let mut table = small_table();
        assert_eq!(table.lookup(b"nothere!"), None);
        assert!(!table.remove(b"nothere!"));
    }

    #[test]
    fn slot_is_stable_until_removed() {
        let mut table = small_table();
        let mut keys = vec![];
        for i in 0..10u64 {
            let key = i.to_be_bytes();
            let slot = table.insert(&key).unwrap();
            keys.push((key, slot));
        }
        for (key, slot) in &keys {
            assert_eq!(table.lookup(key), Some(*slot));
        }
    }

    #[test]
    fn exhausting_the_pool_fails_insert() {
        let mut table = small_table();
        let pool = table.pool_len();
        for i in 0..pool as u64 {
            assert!(table.insert(&i.to_be_bytes()).is_some());
        }
        assert!(table.is_full());
        assert_eq!(table.insert(&u64::MAX.to_be_bytes()), None);

        // freeing one slot makes insertion possible again
        assert!(table.remove(&0u64.to_be_bytes()));
        assert!(table.insert(&u64::MAX.to_be_bytes()).is_some());
    }

    #[test]
    fn chain_accounting_holds_under_churn() {
        let mut table = small_table();
        let pool = table.pool_len();
        for round in 0..3u64 {
            for i in 0..15u64 {
                table.insert(&(round * 100 + i).to_be_bytes());
            }
            for i in 0..15u64 {
                assert!(table.remove(&(round * 100 + i).to_be_bytes()));
            }
            assert_eq!(table.free_len() + table.occupied(), pool);
            assert_eq!(table.occupied(), 0);
        }
    }

    #[test]
    fn duplicate_insert_is_not_deduplicated() {
        let mut table = small_table();
        let key = *b"dupdupdu";
        let first = table.insert(&key).unwrap();
        let second = table.insert(&key).unwrap();
        assert_ne!(first, second);
        assert_eq!(table.occupied(), 2);
        // both removals succeed, one entry at a time
        assert!(table.remove(&key));
        assert!(table.remove(&key));
        assert!(!table.remove(&key));
    }
}
