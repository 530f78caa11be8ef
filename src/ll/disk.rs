//! The disk index flavor: the index is itself a B-tree keyed by
//! bitmap-block index, fronted by a small direct-mapped write-back cache so
//! that a run of `inc`/`dec` calls touching the same bitmap block doesn't
//! pay a B-tree round trip per block.

use crate::block::TransactionManager;
use crate::btree::Btree;
use crate::error::SmError;
use crate::index_entry::IndexEntry;

use super::{IndexStore, LLDisk};

/// Number of direct-mapped cache slots; must be a power of two so indexing
/// can use a mask instead of a modulo.
const IE_CACHE_SIZE: usize = 16;

#[derive(Clone, Copy)]
struct Slot {
    valid: bool,
    dirty: bool,
    index: u64,
    entry: IndexEntry,
}

impl Slot {
    const EMPTY: Slot = Slot {
        valid: false,
        dirty: false,
        index: 0,
        entry: IndexEntry {
            blocknr: 0,
            nr_free: 0,
            none_free_before: 0,
        },
    };
}

fn slot_for(index: u64) -> usize {
    (index as usize) & (IE_CACHE_SIZE - 1)
}

/// Backs the index with a real B-tree (`B`), keyed by bitmap-block index and
/// valued by [`IndexEntry`], cached through a fixed-size direct-mapped
/// write-back array.
pub struct DiskIndexStore<TM, B> {
    root: u64,
    cache: [Slot; IE_CACHE_SIZE],
    _tm: std::marker::PhantomData<TM>,
    _b: std::marker::PhantomData<B>,
}

impl<TM, B> DiskIndexStore<TM, B>
where
    TM: TransactionManager,
    B: Btree<TM, IndexEntry>,
{
    fn new() -> Self {
        Self {
            root: 0,
            cache: [Slot::EMPTY; IE_CACHE_SIZE],
            _tm: std::marker::PhantomData,
            _b: std::marker::PhantomData,
        }
    }

    fn writeback(&mut self, tm: &mut TM, slot_idx: usize) -> Result<(), SmError> {
        let slot = self.cache[slot_idx];
        if slot.valid && slot.dirty {
            self.root = B::insert(tm, self.root, slot.index, slot.entry)?;
        }
        self.cache[slot_idx].dirty = false;
        Ok(())
    }
}

impl<TM, B> IndexStore<TM> for DiskIndexStore<TM, B>
where
    TM: TransactionManager,
    B: Btree<TM, IndexEntry>,
{
    fn init_index(&mut self, tm: &mut TM) -> Result<(), SmError> {
        self.root = B::empty(tm)?;
        self.cache = [Slot::EMPTY; IE_CACHE_SIZE];
        Ok(())
    }

    fn open_index(&mut self, _tm: &mut TM) -> Result<(), SmError> {
        self.cache = [Slot::EMPTY; IE_CACHE_SIZE];
        Ok(())
    }

    fn load_ie(&mut self, tm: &mut TM, index: u64) -> Result<IndexEntry, SmError> {
        let slot_idx = slot_for(index);
        let slot = self.cache[slot_idx];
        if slot.valid && slot.index == index {
            return Ok(slot.entry);
        }
        self.writeback(tm, slot_idx)?;
        let entry = B::lookup(tm, self.root, index)?.ok_or(SmError::OutOfBounds {
            addr: index,
            nr_blocks: u64::MAX,
        })?;
        self.cache[slot_idx] = Slot {
            valid: true,
            dirty: false,
            index,
            entry,
        };
        Ok(entry)
    }

    fn save_ie(&mut self, tm: &mut TM, index: u64, ie: IndexEntry) -> Result<(), SmError> {
        let slot_idx = slot_for(index);
        let slot = self.cache[slot_idx];
        if !(slot.valid && slot.index == index) {
            self.writeback(tm, slot_idx)?;
        }
        self.cache[slot_idx] = Slot {
            valid: true,
            dirty: true,
            index,
            entry: ie,
        };
        Ok(())
    }

    fn max_entries(&self) -> u64 {
        // The index is itself a B-tree, not a fixed array: there is no
        // inherent ceiling short of the 64-bit key space.
        u64::MAX
    }

    fn commit(&mut self, tm: &mut TM) -> Result<(), SmError> {
        for slot_idx in 0..IE_CACHE_SIZE {
            self.writeback(tm, slot_idx)?;
        }
        Ok(())
    }

    fn root(&self) -> u64 {
        self.root
    }

    fn set_root(&mut self, root: u64) {
        self.root = root;
    }
}

/// Alias for a low-level space map backed by the disk index flavor, whose
/// index is itself a B-tree `B` keyed by bitmap-block index.
pub type DiskSm<TM, B, Ovf> = LLDisk<TM, DiskIndexStore<TM, B>, Ovf>;

/// Creates a brand-new disk-flavored low-level space map with no tracked
/// blocks.
pub fn new_disk<TM, B, Ovf>(mut tm: TM) -> Result<DiskSm<TM, B, Ovf>, SmError>
where
    TM: TransactionManager,
    B: Btree<TM, IndexEntry>,
    Ovf: Btree<TM, u32>,
{
    let block_size = tm.block_size();
    let entries_per_block =
        LLDisk::<TM, DiskIndexStore<TM, B>, Ovf>::compute_entries_per_block(block_size)?;
    let mut index = DiskIndexStore::new();
    IndexStore::<TM>::init_index(&mut index, &mut tm)?;
    let ref_count_root = Ovf::empty(&mut tm)?;
    Ok(LLDisk {
        tm,
        block_size,
        entries_per_block,
        nr_blocks: 0,
        nr_allocated: 0,
        ref_count_root,
        bitmap_index_changed: false,
        index,
        _ovf: std::marker::PhantomData,
    })
}

/// Reopens a disk-flavored low-level space map from a previously committed
/// [`crate::root::DiskSmRoot`].
pub fn open_disk<TM, B, Ovf>(
    mut tm: TM,
    root: crate::root::DiskSmRoot,
) -> Result<DiskSm<TM, B, Ovf>, SmError>
where
    TM: TransactionManager,
    B: Btree<TM, IndexEntry>,
    Ovf: Btree<TM, u32>,
{
    let block_size = tm.block_size();
    let entries_per_block =
        LLDisk::<TM, DiskIndexStore<TM, B>, Ovf>::compute_entries_per_block(block_size)?;
    let mut index = DiskIndexStore::new();
    index.set_root(root.bitmap_root);
    IndexStore::<TM>::open_index(&mut index, &mut tm)?;
    Ok(LLDisk {
        tm,
        block_size,
        entries_per_block,
        nr_blocks: root.nr_blocks,
        nr_allocated: root.nr_allocated,
        ref_count_root: root.ref_count_root,
        bitmap_index_changed: false,
        index,
        _ovf: std::marker::PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemBtree, MemTransactionManager};

    #[test]
    fn fresh_disk_index_has_no_blocks() {
        let tm = MemTransactionManager::new(4096);
        let sm: DiskSm<_, MemBtree<IndexEntry>, MemBtree<u32>> = new_disk(tm).unwrap();
        assert_eq!(sm.nr_blocks(), 0);
    }

    #[test]
    fn cache_survives_repeated_access_to_same_slot() {
        let tm = MemTransactionManager::new(4096);
        let mut sm: DiskSm<_, MemBtree<IndexEntry>, MemBtree<u32>> = new_disk(tm).unwrap();
        sm.extend(sm.entries_per_block() as u64).unwrap();
        for b in 0..10 {
            sm.insert(b, 1).unwrap();
        }
        assert_eq!(sm.nr_allocated(), 10);
    }
}
