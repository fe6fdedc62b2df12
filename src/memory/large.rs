//! Bookkeeping for objects too large for any partition.
//!
//! Each direct allocation is its own anonymous mapping, always at least one
//! max-object-size in length. Because mappings are disjoint and that long,
//! shifting an address right by log2(max object size) yields a table index
//! no two live allocations share. The table itself is only ever touched
//! under the heap's spin lock.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LargeEntry {
    /// Start of the mapping.
    pub(crate) base: usize,
    /// Size the caller asked for (the mapping may be longer).
    pub(crate) size: usize,
}

pub(crate) struct LargeObjectTable {
    shift: u32,
    entries: HashMap<usize, LargeEntry>,
}

impl LargeObjectTable {
    pub(crate) fn new(max_object_size: usize) -> Self {
        debug_assert!(max_object_size.is_power_of_two());
        Self {
            shift: max_object_size.trailing_zeros(),
            entries: HashMap::new(),
        }
    }

    #[inline]
    fn index_of(&self, addr: usize) -> usize {
        addr >> self.shift
    }

    pub(crate) fn insert(&mut self, base: usize, size: usize) {
        let previous = self.entries.insert(self.index_of(base), LargeEntry { base, size });
        debug_assert!(
            previous.is_none(),
            "index collision: two live mappings share a table slot"
        );
    }

    /// Entry covering `addr`, if the address is the exact base of a live
    /// allocation. Interior pointers do not resolve; the direct path has no
    /// slot geometry to round with.
    pub(crate) fn lookup(&self, addr: usize) -> Option<LargeEntry> {
        self.entries
            .get(&self.index_of(addr))
            .copied()
            .filter(|entry| entry.base == addr)
    }

    /// Remove and return the entry whose base is exactly `addr`.
    pub(crate) fn remove(&mut self, addr: usize) -> Option<LargeEntry> {
        let index = self.index_of(addr);
        match self.entries.get(&index) {
            Some(entry) if entry.base == addr => self.entries.remove(&index),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry, returning them for teardown.
    pub(crate) fn drain(&mut self) -> Vec<LargeEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const MAX_OBJ: usize = 16 * 1024;

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = LargeObjectTable::new(MAX_OBJ);
        table.insert(0x10_0000, 40_000);

        assert_eq!(
            table.lookup(0x10_0000),
            Some(LargeEntry {
                base: 0x10_0000,
                size: 40_000
            })
        );
        assert_eq!(table.len(), 1);

        let removed = table.remove(0x10_0000).expect("entry present");
        assert_eq!(removed.size, 40_000);
        assert_eq!(table.len(), 0);
        assert_eq!(table.lookup(0x10_0000), None);
    }

    #[test]
    fn test_interior_pointer_does_not_resolve() {
        let mut table = LargeObjectTable::new(MAX_OBJ);
        table.insert(0x10_0000, 40_000);

        // Same coarse index, wrong base.
        assert_eq!(table.lookup(0x10_0008), None);
        assert_eq!(table.remove(0x10_0008), None);
        assert_eq!(table.len(), 1, "mismatched remove must not evict");
    }

    #[test]
    fn test_unknown_address() {
        let mut table = LargeObjectTable::new(MAX_OBJ);
        assert_eq!(table.lookup(0x20_0000), None);
        assert_eq!(table.remove(0x20_0000), None);
    }

    #[test]
    fn test_disjoint_mappings_coexist() {
        let mut table = LargeObjectTable::new(MAX_OBJ);
        // Two bases at least MAX_OBJ apart occupy distinct indices.
        table.insert(0x10_0000, 20_000);
        table.insert(0x10_0000 + MAX_OBJ, 30_000);

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(0x10_0000).unwrap().size, 20_000);
        assert_eq!(table.lookup(0x10_0000 + MAX_OBJ).unwrap().size, 30_000);

        table.remove(0x10_0000);
        assert_eq!(table.lookup(0x10_0000 + MAX_OBJ).unwrap().size, 30_000);
    }
}
