//! Open-addressed hash table keyed by interned strings.
//!
//! The same structure backs the intern set, the globals, class method
//! tables, and instance field tables. Keys are interned string references,
//! so key comparison is identity comparison. Each entry also caches the
//! key's hash: resizing and probing never have to consult the heap.
//!
//! Slot states:
//! - empty: no key, `nil` value
//! - tombstone: no key, `true` sentinel value
//! - live: key present
//!
//! Probing is linear with wrap-around over a power-of-two capacity. The
//! first tombstone seen on a probe is remembered as the insertion slot;
//! a later match still short-circuits.

use crate::heap::Heap;
use crate::object::ObjRef;
use crate::value::Value;

/// Load factor ceiling: grow when count would exceed 3/4 of capacity.
const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy, Debug)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::Nil,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_nil()
    }
}

/// Open-addressed table from interned string to value.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Approximate footprint of the slot array, for GC accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Finds the slot for `key`: a match, or the slot an insert would use
    /// (the first tombstone on the probe path, else the trailing empty).
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        // Truly empty
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

    /// Looks up `key`, whose stored hash is `hash`.
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(key, hash)];
        match entry.key {
            Some(_) => Some(entry.value),
            None => None,
        }
    }

    /// Inserts or updates `key`. Returns true if the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }

        let index = self.find_slot(key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // Reusing a tombstone does not change the count: the tombstone was
        // still counted.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_slot(key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.hash = 0;
        entry.value = Value::Bool(true);
        true
    }

    /// Iterates live entries as `(key, hash, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
    }

    /// Copies every live entry of `other` into this table.
    pub fn add_all(&mut self, other: &Table) {
        for (key, hash, value) in other.entries() {
            self.set(key, hash, value);
        }
    }

    /// Probes for a string with the given content, used by the interner
    /// before committing a new allocation. Unlike [`Table::get`], this
    /// compares content rather than identity.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;

        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return None;
                    }
                    // Tombstone: keep probing
                }
                Some(key) => {
                    if entry.hash == hash && heap.string(key).chars.as_ref() == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Tombstones every entry whose key the predicate reports unmarked.
    /// Called by the collector on the intern table before sweeping.
    pub fn remove_unmarked<F: Fn(ObjRef) -> bool>(&mut self, is_marked: F) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    entry.key = None;
                    entry.hash = 0;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    /// Doubles the slot array and rehashes live entries. Tombstones are not
    /// carried over.
    fn grow(&mut self) {
        let new_capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);

        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = self.find_slot(key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}
