//! Open-addressed hash table keyed by interned strings
//!
//! Linear probing over a power-of-two capacity, growing at a 3/4 load factor.
//! Deletions leave tombstones `(no key, value = true)` so probe chains stay
//! intact; tombstones are reused on insert but do not stop a lookup probe.
//! The entry count includes tombstones for growth triggering and is
//! recomputed on resize.
//!
//! Because keys are interned, key equality is handle identity; each entry
//! carries its key's hash so resizing never has to consult the heap. The two
//! content-based operations the intern set needs (`find_string`,
//! `remove_unmarked_keys`) take closures instead of a heap reference.

use crate::heap::ObjRef;
use crate::value::Value;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Nil,
};

#[derive(Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates; returns true iff the key was not present before.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.count + 1 > (self.entries.len() * 3) / 4 {
            self.grow();
        }
        let index = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && entry.value == Value::Nil {
            // A genuinely empty slot, not a recycled tombstone.
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Replaces the entry with a tombstone; returns true iff it existed.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        true
    }

    /// Content-based probe for the intern set: follows the same probe
    /// sequence as `get`, calling `matches` on keys whose hash agrees.
    pub fn find_string(&self, hash: u32, matches: impl Fn(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value == Value::Nil {
                        return None;
                    }
                    // Tombstone: keep probing.
                }
                Some(key) => {
                    if entry.hash == hash && matches(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Weak-reference pass: tombstones every entry whose key the collector
    /// did not mark. Used on the intern set before sweeping.
    pub fn remove_unmarked_keys(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key
                && !is_marked(key)
            {
                *entry = Entry {
                    key: None,
                    hash: 0,
                    value: Value::Bool(true),
                };
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
    }

    /// Backing-store bytes, for GC accounting.
    pub fn footprint(&self) -> usize {
        self.entries.len() * size_of::<Entry>()
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);
        // Tombstones are dropped here, so the count is rebuilt from scratch.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = find_entry(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

/// Linear probe for `key`, wrapping modulo capacity. Returns the entry slot:
/// the key's own slot if present, otherwise the first tombstone seen (for
/// reuse on insert), otherwise the terminating empty slot.
fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
    let mask = entries.len() - 1;
    let mut index = hash as usize & mask;
    let mut tombstone: Option<usize> = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            None => {
                if entry.value == Value::Nil {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(k) => {
                if k == key {
                    return index;
                }
            }
        }
        index = (index + 1) & mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn keys(n: usize) -> (Heap, Vec<ObjRef>) {
        let mut heap = Heap::new();
        let refs = (0..n).map(|i| heap.copy_string(&format!("k{i}"))).collect();
        (heap, refs)
    }

    #[test]
    fn test_set_get_update() {
        let (_heap, k) = keys(1);
        let mut table = Table::new();
        assert!(table.set(k[0], 7, Value::Number(1.0)));
        assert_eq!(table.get(k[0], 7), Some(Value::Number(1.0)));
        assert!(!table.set(k[0], 7, Value::Number(2.0)));
        assert_eq!(table.get(k[0], 7), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_missing_key() {
        let (_heap, k) = keys(2);
        let mut table = Table::new();
        assert_eq!(table.get(k[0], 3), None);
        table.set(k[0], 3, Value::Nil);
        assert_eq!(table.get(k[1], 3), None);
    }

    #[test]
    fn test_tombstone_preserves_probe_chain() {
        let (_heap, k) = keys(3);
        let mut table = Table::new();
        // Same hash forces all three into one probe chain.
        table.set(k[0], 5, Value::Number(0.0));
        table.set(k[1], 5, Value::Number(1.0));
        table.set(k[2], 5, Value::Number(2.0));
        assert!(table.delete(k[1], 5));
        // The entry past the tombstone must still be reachable.
        assert_eq!(table.get(k[2], 5), Some(Value::Number(2.0)));
        assert_eq!(table.get(k[1], 5), None);
        assert!(!table.delete(k[1], 5));
    }

    #[test]
    fn test_tombstone_slot_is_reused() {
        let (_heap, k) = keys(3);
        let mut table = Table::new();
        table.set(k[0], 9, Value::Number(0.0));
        table.set(k[1], 9, Value::Number(1.0));
        table.delete(k[0], 9);
        // Reinserting lands in the tombstone without growing the count.
        assert!(table.set(k[2], 9, Value::Number(2.0)));
        assert_eq!(table.get(k[1], 9), Some(Value::Number(1.0)));
        assert_eq!(table.get(k[2], 9), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_growth_keeps_all_entries() {
        let (mut heap, _) = keys(0);
        let mut table = Table::new();
        let entries: Vec<(ObjRef, u32)> = (0..64)
            .map(|i| {
                let key = heap.copy_string(&format!("key{i}"));
                (key, crate::object::hash_string(&format!("key{i}")))
            })
            .collect();
        for (i, &(key, hash)) in entries.iter().enumerate() {
            table.set(key, hash, Value::Number(i as f64));
        }
        for (i, &(key, hash)) in entries.iter().enumerate() {
            assert_eq!(table.get(key, hash), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn test_find_string_by_content() {
        let (mut heap, _) = keys(0);
        let hash = crate::object::hash_string("needle");
        let needle = heap.copy_string("needle");
        let mut table = Table::new();
        table.set(needle, hash, Value::Nil);
        let found = table.find_string(hash, |r| heap.string_text(r) == "needle");
        assert_eq!(found, Some(needle));
        let missing = table.find_string(hash, |r| heap.string_text(r) == "other");
        assert_eq!(missing, None);
    }

    #[test]
    fn test_remove_unmarked_keys() {
        let (_heap, k) = keys(2);
        let mut table = Table::new();
        table.set(k[0], 1, Value::Nil);
        table.set(k[1], 2, Value::Nil);
        table.remove_unmarked_keys(|r| r == k[0]);
        assert_eq!(table.get(k[0], 1), Some(Value::Nil));
        assert_eq!(table.get(k[1], 2), None);
    }
}
