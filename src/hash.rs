//! Value-keyed hash table.
//!
//! Closed addressing with chained buckets. The same table backs map objects,
//! class method tables and the VM globals. Key hashing and equality need the
//! heap (string content lives there), so every mutating entry point takes a
//! `&GcHeap`. Entries cache their full 32-bit hash so growth never rehashes
//! key content.

use crate::core::value::{value_equals, value_hash, Value};
use crate::gc::GcHeap;

const DEFAULT_SIZE: usize = 32;
/// Grow when count/size crosses this ratio.
const LOAD_FACTOR: f64 = 0.75;
/// Hard cap on stored entries.
const MAX_ENTRIES: usize = 1 << 30;

#[derive(Debug, Clone, Copy)]
struct HashEntry {
    hash: u32,
    key: Value,
    value: Value,
}

#[derive(Debug)]
pub struct HashTable {
    buckets: Vec<Vec<HashEntry>>,
    count: usize,
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIZE)
    }

    pub fn with_capacity(n: usize) -> Self {
        let size = n.next_power_of_two().max(8);
        HashTable {
            buckets: (0..size).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Insert or replace. Never stores two entries with equal keys.
    /// Returns true when an existing entry was replaced.
    pub fn insert(&mut self, heap: &GcHeap, key: Value, value: Value) -> bool {
        let hash = value_hash(heap, key);
        let idx = (hash as usize) & (self.buckets.len() - 1);
        for e in self.buckets[idx].iter_mut() {
            if e.hash == hash && value_equals(heap, e.key, key) {
                e.value = value;
                return true;
            }
        }
        if self.count >= MAX_ENTRIES {
            return false;
        }
        self.buckets[idx].push(HashEntry { hash, key, value });
        self.count += 1;
        if (self.count as f64) >= (self.buckets.len() as f64) * LOAD_FACTOR {
            self.grow();
        }
        false
    }

    pub fn lookup(&self, heap: &GcHeap, key: Value) -> Option<Value> {
        let hash = value_hash(heap, key);
        let idx = (hash as usize) & (self.buckets.len() - 1);
        self.buckets[idx]
            .iter()
            .find(|e| e.hash == hash && value_equals(heap, e.key, key))
            .map(|e| e.value)
    }

    pub fn contains(&self, heap: &GcHeap, key: Value) -> bool {
        self.lookup(heap, key).is_some()
    }

    pub fn remove(&mut self, heap: &GcHeap, key: Value) -> Option<Value> {
        let hash = value_hash(heap, key);
        let idx = (hash as usize) & (self.buckets.len() - 1);
        let pos = self.buckets[idx]
            .iter()
            .position(|e| e.hash == hash && value_equals(heap, e.key, key))?;
        let e = self.buckets[idx].swap_remove(pos);
        self.count -= 1;
        Some(e.value)
    }

    /// Bucket-then-chain iteration. The order is an implementation detail
    /// and never observable from user programs.
    pub fn entries(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.buckets.iter().flatten().map(|e| (e.key, e.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.buckets.iter().flatten().map(|e| e.key)
    }

    /// Copy every entry of `other` into self (SETLIST cpool path).
    pub fn append(&mut self, heap: &GcHeap, other: &HashTable) {
        for (k, v) in other.entries() {
            self.insert(heap, k, v);
        }
    }

    fn grow(&mut self) {
        let new_size = self.buckets.len() * 2;
        let mut buckets: Vec<Vec<HashEntry>> = (0..new_size).map(|_| Vec::new()).collect();
        for e in self.buckets.drain(..).flatten() {
            buckets[(e.hash as usize) & (new_size - 1)].push(e);
        }
        self.buckets = buckets;
    }

    /// Approximate owned memory, for GC accounting.
    pub fn mem_size(&self) -> u64 {
        let entries: usize = self.buckets.iter().map(|b| b.capacity()).sum();
        (self.buckets.capacity() * std::mem::size_of::<Vec<HashEntry>>()
            + entries * std::mem::size_of::<HashEntry>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let heap = GcHeap::new();
        let mut t = HashTable::new();
        assert!(!t.insert(&heap, Value::Int(1), Value::Int(10)));
        assert!(!t.insert(&heap, Value::Int(2), Value::Int(20)));
        assert_eq!(t.lookup(&heap, Value::Int(1)), Some(Value::Int(10)));
        assert_eq!(t.lookup(&heap, Value::Int(3)), None);

        // replacing does not duplicate
        assert!(t.insert(&heap, Value::Int(1), Value::Int(11)));
        assert_eq!(t.len(), 2);
        assert_eq!(t.lookup(&heap, Value::Int(1)), Some(Value::Int(11)));

        assert_eq!(t.remove(&heap, Value::Int(2)), Some(Value::Int(20)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn growth_preserves_entries() {
        let heap = GcHeap::new();
        let mut t = HashTable::with_capacity(8);
        for i in 0..1000 {
            t.insert(&heap, Value::Int(i), Value::Int(i * 2));
        }
        assert_eq!(t.len(), 1000);
        for i in 0..1000 {
            assert_eq!(t.lookup(&heap, Value::Int(i)), Some(Value::Int(i * 2)));
        }
    }

    #[test]
    fn int_and_float_keys_are_distinct_buckets_but_equal_values_collapse() {
        let heap = GcHeap::new();
        let mut t = HashTable::new();
        t.insert(&heap, Value::Bool(true), Value::Int(1));
        t.insert(&heap, Value::Int(1), Value::Int(2));
        // Bool(true) hashes like Int(1) and compares unequal to it, so both live
        assert_eq!(t.len(), 2);
    }
}
