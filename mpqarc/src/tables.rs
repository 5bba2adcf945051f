//! In-memory hash and block tables.
//!
//! The hash table is a fixed-size open-addressed index with +1 probing and
//! tombstones. The block table doubles as a first-fit free-space allocator:
//! free regions are ordinary entries (allocated space, no file, no flags) and
//! adjacent free regions are always coalesced before further allocation.

use thiserror::Error;

use crate::crypto::{hash, HashPurpose};
use crate::format::{BlockEntry, BlockRef, HashEntry, TABLE_ENTRIES};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    /// A name whose full hash triple already matches a live entry was
    /// inserted. Writer operations always remove before adding, so this is a
    /// contract violation rather than a recoverable state.
    #[error("a file with the same name hash is already present")]
    DuplicateName,
    #[error("no free hash table slot (table holds {TABLE_ENTRIES} entries)")]
    HashTableFull,
    #[error("no free block table slot (table holds {TABLE_ENTRIES} entries)")]
    BlockTableFull,
    /// The free list describes space beyond the end of the archive. The
    /// in-memory tables can no longer be trusted.
    #[error("free list is inconsistent with the archive size")]
    FreeListCorrupt,
    /// Growing the archive at its logical end would overflow the format's
    /// 32-bit size fields.
    #[error("archive would exceed the format's 32-bit size limit")]
    ArchiveFull,
    #[error("table length {0} is not a power of two")]
    BadTableLength(usize),
    #[error("hash entry points at block {0}, which is out of range")]
    BadBlockIndex(u32),
}

/// The (table index, verification A, verification B) triple a filename maps
/// to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HashTriple {
    pub index: u32,
    pub hash_a: u32,
    pub hash_b: u32,
}

impl HashTriple {
    pub fn of(name: &str) -> Self {
        HashTriple {
            index: hash(name, HashPurpose::TableOffset),
            hash_a: hash(name, HashPurpose::NameA),
            hash_b: hash(name, HashPurpose::NameB),
        }
    }
}

/// Open-addressed filename index.
#[derive(Clone, Debug)]
pub struct HashTable {
    entries: Vec<HashEntry>,
}

impl HashTable {
    /// An empty table of the fixed profile size.
    pub fn new() -> Self {
        HashTable {
            entries: vec![HashEntry::EMPTY; TABLE_ENTRIES],
        }
    }

    /// Builds a table from decrypted wire words. The entry count must be a
    /// power of two for masked probing to work.
    pub fn from_words(words: &[u32]) -> Result<Self, TableError> {
        let len = words.len() / 4;
        if len == 0 || !len.is_power_of_two() {
            return Err(TableError::BadTableLength(len));
        }
        let entries = words
            .chunks_exact(4)
            .map(|w| HashEntry::from_words([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(HashTable { entries })
    }

    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.entries.len() * 4);
        for entry in &self.entries {
            words.extend_from_slice(&entry.to_words());
        }
        words
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| *e == HashEntry::EMPTY)
    }

    fn mask(&self) -> usize {
        self.entries.len() - 1
    }

    /// Finds the slot holding a live entry for `name`. Probing stops at the
    /// first never-used slot or after one full pass; tombstones keep the chain
    /// going. A slot with mismatched verification words is an unrelated
    /// collision and is skipped, not an error.
    pub fn find(&self, name: &str) -> Option<usize> {
        let triple = HashTriple::of(name);
        let mask = self.mask();
        let mut idx = triple.index as usize & mask;

        for _ in 0..self.entries.len() {
            let entry = &self.entries[idx];
            match entry.block {
                BlockRef::Empty => return None,
                BlockRef::Tombstone => {}
                BlockRef::Block(_) => {
                    if entry.hash_a == triple.hash_a && entry.hash_b == triple.hash_b {
                        return Some(idx);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }

        None
    }

    /// Block table index of the live entry for `name`, if any.
    pub fn block_of(&self, name: &str) -> Option<u32> {
        self.find(name).and_then(|idx| match self.entries[idx].block {
            BlockRef::Block(block) => Some(block),
            _ => None,
        })
    }

    /// Inserts a live entry for `name` pointing at `block`, reusing the first
    /// empty or tombstoned slot on the probe path. Returns the slot index.
    pub fn insert(&mut self, name: &str, block: u32) -> Result<usize, TableError> {
        if self.find(name).is_some() {
            return Err(TableError::DuplicateName);
        }

        let triple = HashTriple::of(name);
        let mask = self.mask();
        let mut idx = triple.index as usize & mask;

        for _ in 0..self.entries.len() {
            match self.entries[idx].block {
                BlockRef::Empty | BlockRef::Tombstone => {
                    self.entries[idx] = HashEntry {
                        hash_a: triple.hash_a,
                        hash_b: triple.hash_b,
                        locale: 0,
                        platform: 0,
                        block: BlockRef::Block(block),
                    };
                    return Ok(idx);
                }
                BlockRef::Block(_) => idx = (idx + 1) & mask,
            }
        }

        Err(TableError::HashTableFull)
    }

    /// Tombstones the live entry for `name`, returning its block index. The
    /// slot is never returned to the empty state: entries inserted later at
    /// higher probe distances still need to be reachable.
    pub fn remove(&mut self, name: &str) -> Option<u32> {
        let idx = self.find(name)?;
        let block = match self.entries[idx].block {
            BlockRef::Block(block) => block,
            _ => return None,
        };
        self.entries[idx].block = BlockRef::Tombstone;
        Some(block)
    }

    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Block allocation table and free-space allocator.
#[derive(Clone, Debug)]
pub struct BlockTable {
    entries: Vec<BlockEntry>,
}

impl BlockTable {
    pub fn new() -> Self {
        BlockTable {
            entries: vec![BlockEntry::VACANT; TABLE_ENTRIES],
        }
    }

    pub fn from_words(words: &[u32]) -> Self {
        let entries = words
            .chunks_exact(4)
            .map(|w| BlockEntry::from_words([w[0], w[1], w[2], w[3]]))
            .collect();
        BlockTable { entries }
    }

    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.entries.len() * 4);
        for entry in &self.entries {
            words.extend_from_slice(&entry.to_words());
        }
        words
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(BlockEntry::is_vacant)
    }

    pub fn get(&self, index: u32) -> Option<&BlockEntry> {
        self.entries.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut BlockEntry> {
        self.entries.get_mut(index as usize)
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Claims the first vacant slot for a new block, returning its index. The
    /// slot itself is left vacant until the caller fills it.
    pub fn new_block(&mut self) -> Result<u32, TableError> {
        self.entries
            .iter()
            .position(BlockEntry::is_vacant)
            .map(|idx| idx as u32)
            .ok_or(TableError::BlockTableFull)
    }

    /// First-fit allocation of `size` bytes. A matching free region is split
    /// (and cleared entirely once exhausted); with no match the archive grows
    /// at its logical end. A free region whose span overflows the 32-bit
    /// address space marks the table corrupt.
    pub fn find_free(&mut self, size: u32, logical_size: &mut u32) -> Result<u32, TableError> {
        for entry in &mut self.entries {
            if !entry.is_free() || entry.packed_size < size {
                continue;
            }
            entry
                .offset
                .checked_add(entry.packed_size)
                .ok_or(TableError::FreeListCorrupt)?;

            let offset = entry.offset;
            entry.offset += size;
            entry.packed_size -= size;
            if entry.packed_size == 0 {
                *entry = BlockEntry::VACANT;
            }
            return Ok(offset);
        }

        let offset = *logical_size;
        *logical_size = logical_size
            .checked_add(size)
            .ok_or(TableError::ArchiveFull)?;
        Ok(offset)
    }

    /// Returns the span `[offset, offset + size)` to the free list, merging
    /// with byte-adjacent free regions until none remain. A merged region
    /// ending at the logical end of the archive shrinks the archive instead
    /// of being recorded. Once anything has merged, recording cannot fail:
    /// the merged region is written into a slot the merge itself vacated.
    pub fn release(
        &mut self,
        mut offset: u32,
        mut size: u32,
        logical_size: &mut u32,
    ) -> Result<(), TableError> {
        let mut vacated: Option<usize> = None;
        loop {
            let end = offset
                .checked_add(size)
                .ok_or(TableError::FreeListCorrupt)?;
            let mut merged = false;
            for (index, entry) in self.entries.iter_mut().enumerate() {
                if !entry.is_free() {
                    continue;
                }
                let entry_end = entry
                    .offset
                    .checked_add(entry.packed_size)
                    .ok_or(TableError::FreeListCorrupt)?;
                if entry_end == offset {
                    offset = entry.offset;
                    size += entry.packed_size;
                } else if end == entry.offset {
                    size += entry.packed_size;
                } else {
                    continue;
                }
                *entry = BlockEntry::VACANT;
                vacated = Some(index);
                merged = true;
                break;
            }
            if !merged {
                break;
            }
        }

        let end = offset
            .checked_add(size)
            .ok_or(TableError::FreeListCorrupt)?;
        if end > *logical_size {
            return Err(TableError::FreeListCorrupt);
        }
        if end == *logical_size {
            *logical_size = offset;
            return Ok(());
        }

        let index = match vacated {
            Some(index) => index,
            None => self.new_block()? as usize,
        };
        self.entries[index] = BlockEntry {
            offset,
            packed_size: size,
            unpacked_size: 0,
            flags: crate::format::BlockFlags::empty(),
        };
        Ok(())
    }

    /// All free regions, for invariant checks.
    pub fn free_regions(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries
            .iter()
            .filter(|e| e.is_free())
            .map(|e| (e.offset, e.packed_size))
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::EMPTY_ARCHIVE_SIZE;
    use assert_ok::assert_ok;

    /// Finds `n` filenames that all probe from the same starting slot, so
    /// tombstone/chain behavior can be exercised deterministically.
    fn colliding_names(n: usize) -> Vec<String> {
        let mask = TABLE_ENTRIES as u32 - 1;
        let want = HashTriple::of("seed.dat").index & mask;
        let mut found = Vec::new();
        for i in 0.. {
            let name = format!("file{i}.dat");
            if HashTriple::of(&name).index & mask == want {
                found.push(name);
                if found.len() == n {
                    break;
                }
            }
        }
        found
    }

    #[test]
    fn insert_then_find() {
        let mut table = HashTable::new();
        assert_ok!(table.insert(r"save\hero.sv", 5));
        assert_eq!(table.block_of(r"save\hero.sv"), Some(5));
        assert_eq!(table.block_of(r"save\other.sv"), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut table = HashTable::new();
        assert_ok!(table.insert("a.txt", 0));
        assert_eq!(table.insert("a.txt", 1), Err(TableError::DuplicateName));
        // Case-insensitive names share a hash triple.
        assert_eq!(table.insert("A.TXT", 1), Err(TableError::DuplicateName));
    }

    #[test]
    fn tombstone_preserves_probe_chain() {
        let names = colliding_names(3);
        let mut table = HashTable::new();
        let first = assert_ok!(table.insert(&names[0], 0));
        let second = assert_ok!(table.insert(&names[1], 1));
        let third = assert_ok!(table.insert(&names[2], 2));
        assert_eq!(second, first + 1);
        assert_eq!(third, first + 2);

        // Removing the head of the chain must not cut off the entries behind
        // it.
        assert_eq!(table.remove(&names[0]), Some(0));
        assert_eq!(table.block_of(&names[1]), Some(1));
        assert_eq!(table.block_of(&names[2]), Some(2));
        assert_eq!(table.block_of(&names[0]), None);
    }

    #[test]
    fn insert_reuses_tombstoned_slot() {
        let names = colliding_names(2);
        let mut table = HashTable::new();
        let first = assert_ok!(table.insert(&names[0], 0));
        assert_ok!(table.insert(&names[1], 1));

        assert_eq!(table.remove(&names[0]), Some(0));
        let reused = assert_ok!(table.insert(&names[0], 7));
        assert_eq!(reused, first);
        assert_eq!(table.block_of(&names[0]), Some(7));
    }

    #[test]
    fn full_table_reports_exhaustion() {
        let mut table = HashTable::new();
        for i in 0..TABLE_ENTRIES {
            assert_ok!(table.insert(&format!("fill{i}.bin"), i as u32));
        }
        assert_eq!(
            table.insert("straw.bin", 0),
            Err(TableError::HashTableFull)
        );
    }

    #[test]
    fn words_round_trip() {
        let mut table = HashTable::new();
        assert_ok!(table.insert("a.txt", 3));
        let words = table.to_words();
        assert_eq!(words.len(), TABLE_ENTRIES * 4);
        let restored = assert_ok!(HashTable::from_words(&words));
        assert_eq!(restored.block_of("a.txt"), Some(3));
    }

    #[test]
    fn rejects_non_power_of_two_length() {
        let words = vec![0u32; 3 * 4];
        assert_eq!(
            HashTable::from_words(&words).unwrap_err(),
            TableError::BadTableLength(3)
        );
    }

    fn assert_no_overlapping_free_regions(table: &BlockTable) {
        let mut regions: Vec<_> = table.free_regions().collect();
        regions.sort_unstable();
        for pair in regions.windows(2) {
            let (off_a, size_a) = pair[0];
            let (off_b, _) = pair[1];
            assert!(
                off_a + size_a <= off_b,
                "free regions overlap: {pair:?}"
            );
        }
    }

    #[test]
    fn allocation_appends_at_logical_end() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let offset = assert_ok!(table.find_free(100, &mut size));
        assert_eq!(offset, EMPTY_ARCHIVE_SIZE);
        assert_eq!(size, EMPTY_ARCHIVE_SIZE + 100);
    }

    #[test]
    fn release_at_logical_end_shrinks() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let offset = assert_ok!(table.find_free(100, &mut size));
        assert_ok!(table.release(offset, 100, &mut size));
        assert_eq!(size, EMPTY_ARCHIVE_SIZE);
        assert_eq!(table.free_regions().count(), 0);
    }

    #[test]
    fn first_fit_splits_free_region() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let a = assert_ok!(table.find_free(100, &mut size));
        let _b = assert_ok!(table.find_free(50, &mut size));
        // A live allocation after `a` keeps its release off the logical end.
        assert_ok!(table.release(a, 100, &mut size));
        assert_eq!(table.free_regions().count(), 1);

        let c = assert_ok!(table.find_free(60, &mut size));
        assert_eq!(c, a);
        assert_eq!(table.free_regions().next(), Some((a + 60, 40)));
        assert_no_overlapping_free_regions(&table);
    }

    #[test]
    fn exact_fit_clears_the_free_entry() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let a = assert_ok!(table.find_free(100, &mut size));
        let _b = assert_ok!(table.find_free(50, &mut size));
        assert_ok!(table.release(a, 100, &mut size));

        let c = assert_ok!(table.find_free(100, &mut size));
        assert_eq!(c, a);
        assert_eq!(table.free_regions().count(), 0);
    }

    #[test]
    fn adjacent_releases_coalesce() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let a = assert_ok!(table.find_free(100, &mut size));
        let b = assert_ok!(table.find_free(50, &mut size));
        let _guard = assert_ok!(table.find_free(10, &mut size));

        assert_ok!(table.release(a, 100, &mut size));
        assert_ok!(table.release(b, 50, &mut size));
        // One merged region, not two fragments.
        assert_eq!(table.free_regions().collect::<Vec<_>>(), vec![(a, 150)]);
        assert_no_overlapping_free_regions(&table);

        // A request fitting only in the merged region must not grow the
        // archive.
        let before = size;
        let c = assert_ok!(table.find_free(150, &mut size));
        assert_eq!(c, a);
        assert_eq!(size, before);
    }

    #[test]
    fn coalescing_chains_through_multiple_regions() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let a = assert_ok!(table.find_free(10, &mut size));
        let b = assert_ok!(table.find_free(10, &mut size));
        let c = assert_ok!(table.find_free(10, &mut size));
        let _guard = assert_ok!(table.find_free(10, &mut size));

        assert_ok!(table.release(a, 10, &mut size));
        assert_ok!(table.release(c, 10, &mut size));
        assert_eq!(table.free_regions().count(), 2);
        // Releasing the middle absorbs both neighbors in one pass.
        assert_ok!(table.release(b, 10, &mut size));
        assert_eq!(table.free_regions().collect::<Vec<_>>(), vec![(a, 30)]);
    }

    #[test]
    fn merged_region_reaching_logical_end_shrinks() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let a = assert_ok!(table.find_free(10, &mut size));
        let b = assert_ok!(table.find_free(10, &mut size));

        assert_ok!(table.release(a, 10, &mut size));
        assert_eq!(table.free_regions().count(), 1);
        // Releasing `b` merges with `a` and reaches the end: both vanish.
        assert_ok!(table.release(b, 10, &mut size));
        assert_eq!(table.free_regions().count(), 0);
        assert_eq!(size, EMPTY_ARCHIVE_SIZE);
    }

    #[test]
    fn release_beyond_logical_end_is_corrupt() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        assert_eq!(
            table.release(EMPTY_ARCHIVE_SIZE, 100, &mut size),
            Err(TableError::FreeListCorrupt)
        );
    }

    #[test]
    fn release_of_overflowing_span_is_corrupt() {
        let mut table = BlockTable::new();
        let mut size = u32::MAX;
        assert_eq!(
            table.release(0xFFFF_FFF0, 0x100, &mut size),
            Err(TableError::FreeListCorrupt)
        );
    }

    #[test]
    fn free_entry_with_overflowing_span_is_corrupt() {
        let mut table = BlockTable::new();
        table.entries[0] = BlockEntry {
            offset: 0xFFFF_FFF0,
            packed_size: 0x100,
            unpacked_size: 0,
            flags: crate::format::BlockFlags::empty(),
        };
        let mut size = u32::MAX;
        assert_eq!(
            table.find_free(0x80, &mut size),
            Err(TableError::FreeListCorrupt)
        );
    }

    #[test]
    fn growth_past_the_size_limit_is_rejected() {
        let mut table = BlockTable::new();
        let mut size = u32::MAX - 50;
        assert_eq!(
            table.find_free(100, &mut size),
            Err(TableError::ArchiveFull)
        );
        // The logical size is untouched on failure.
        assert_eq!(size, u32::MAX - 50);
    }

    #[test]
    fn merge_into_a_full_block_table_reuses_the_vacated_slot() {
        let mut table = BlockTable::new();
        let mut size = EMPTY_ARCHIVE_SIZE;
        let a = assert_ok!(table.find_free(10, &mut size));
        let b = assert_ok!(table.find_free(10, &mut size));
        let _guard = assert_ok!(table.find_free(10, &mut size));
        assert_ok!(table.release(a, 10, &mut size));

        // Burn every remaining slot so recording the merged region depends on
        // the slot the merge itself vacates.
        for entry in table.entries.iter_mut().filter(|e| e.is_vacant()) {
            *entry = BlockEntry {
                offset: 1,
                packed_size: 1,
                unpacked_size: 1,
                flags: crate::format::BlockFlags::EXISTS,
            };
        }
        assert_eq!(table.new_block(), Err(TableError::BlockTableFull));

        assert_ok!(table.release(b, 10, &mut size));
        assert_eq!(table.free_regions().collect::<Vec<_>>(), vec![(a, 20)]);
    }

    #[test]
    fn new_block_exhaustion() {
        let mut table = BlockTable::new();
        for i in 0..TABLE_ENTRIES {
            let entry = assert_ok!(table.new_block()) as usize;
            assert_eq!(entry, i);
            table.entries[entry] = BlockEntry {
                offset: 1 + entry as u32,
                packed_size: 1,
                unpacked_size: 1,
                flags: crate::format::BlockFlags::EXISTS,
            };
        }
        assert_eq!(table.new_block(), Err(TableError::BlockTableFull));
    }
}
