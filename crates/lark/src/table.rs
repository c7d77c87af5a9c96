//! Open-addressed hash table keyed by interned-string identity.
//!
//! Capacity is always a power of two, probing is linear, and deletions
//! leave tombstones so probe chains stay intact. Keys compare by
//! [`ObjRef`] identity alone; interning guarantees that identical byte
//! sequences share one ref. Each entry carries the key's hash so the
//! table can grow without consulting the heap.

use crate::object::ObjRef;
use crate::value::Value;

/// Grow when count (live + tombstones) would exceed 3/4 of capacity.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
pub(crate) struct Entry {
    pub key: Option<ObjRef>,
    pub hash: u32,
    pub value: Value,
}

impl Entry {
    /// Never-used bucket.
    pub const EMPTY: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::Nil,
    };

    /// Deleted bucket; keeps probe chains alive.
    pub const TOMBSTONE: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::Bool(false),
    };
}

#[derive(Clone, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    pub(crate) count: usize,
    pub(crate) entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find(key, hash)];
        if entry.key.is_some() {
            Some(entry.value)
        } else {
            None
        }
    }

    /// Insert or overwrite. Returns true when `key` was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let index = self.find(key, hash);
        let entry = self.entries[index];
        let is_new = entry.key.is_none();
        // a reused tombstone was already counted
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        self.entries[index] = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Replace the entry with a tombstone. Returns false when the key was
    /// not present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find(key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry::TOMBSTONE;
        true
    }

    /// Live `(key, value)` pairs in bucket order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Index of the bucket holding `key`, or of the bucket an insert
    /// should use (the first tombstone on the probe chain if any).
    fn find(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        let mask = capacity - 1;
        for entry in old {
            if entry.key.is_none() {
                continue; // tombstones are dropped on rehash
            }
            let mut index = entry.hash as usize & mask;
            while self.entries[index].key.is_some() {
                index = (index + 1) & mask;
            }
            self.entries[index] = entry;
            self.count += 1;
        }
    }
}
