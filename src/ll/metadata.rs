//! The metadata index flavor: the index itself is a single fixed
//! block holding a flat array of [`IndexEntry`] records, entirely resident
//! once loaded. Used when the space map is tracking metadata blocks, whose
//! count is small enough that the whole index fits in one block.

use crate::block::TransactionManager;
use crate::btree::BtreeValue;
use crate::error::SmError;
use crate::index_entry::{IndexEntry, IndexValidator, max_metadata_bitmaps};

use super::{IndexStore, LLDisk};

/// Backs the index with one resident `Vec<IndexEntry>`, persisted as a
/// single block on `commit`.
pub struct MetadataIndexStore {
    root: u64,
    max_entries: u64,
    entries: Vec<IndexEntry>,
    dirty: bool,
}

impl MetadataIndexStore {
    fn new(block_size: u32) -> Self {
        Self {
            root: 0,
            max_entries: max_metadata_bitmaps(block_size),
            entries: Vec::new(),
            dirty: false,
        }
    }

    fn decode_block(&mut self, data: &[u8]) {
        self.entries.clear();
        let mut off = crate::checksum::HEADER_SIZE;
        for _ in 0..self.max_entries {
            if off + IndexEntry::ENCODED_SIZE > data.len() {
                break;
            }
            self.entries
                .push(IndexEntry::decode(&data[off..off + IndexEntry::ENCODED_SIZE]));
            off += IndexEntry::ENCODED_SIZE;
        }
    }

    fn encode_block(&self, data: &mut [u8]) {
        let mut off = crate::checksum::HEADER_SIZE;
        for ie in &self.entries {
            ie.encode(&mut data[off..off + IndexEntry::ENCODED_SIZE]);
            off += IndexEntry::ENCODED_SIZE;
        }
    }
}

impl<TM: TransactionManager> IndexStore<TM> for MetadataIndexStore {
    fn init_index(&mut self, tm: &mut TM) -> Result<(), SmError> {
        let block = tm.new_block(&IndexValidator)?;
        self.root = block.location;
        self.entries.clear();
        tm.unlock_write(block, &IndexValidator)?;
        self.dirty = false;
        Ok(())
    }

    fn open_index(&mut self, tm: &mut TM) -> Result<(), SmError> {
        let block = tm.read_lock(self.root, &IndexValidator)?;
        self.decode_block(block.as_bytes());
        tm.unlock_read(block);
        Ok(())
    }

    fn load_ie(&mut self, _tm: &mut TM, index: u64) -> Result<IndexEntry, SmError> {
        self.entries
            .get(index as usize)
            .copied()
            .ok_or(SmError::OutOfBounds {
                addr: index,
                nr_blocks: self.entries.len() as u64,
            })
    }

    fn save_ie(&mut self, _tm: &mut TM, index: u64, ie: IndexEntry) -> Result<(), SmError> {
        let idx = index as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, IndexEntry::default());
        }
        self.entries[idx] = ie;
        self.dirty = true;
        Ok(())
    }

    fn max_entries(&self) -> u64 {
        self.max_entries
    }

    fn commit(&mut self, tm: &mut TM) -> Result<(), SmError> {
        if !self.dirty {
            return Ok(());
        }
        let (mut block, _already) = tm.shadow_block(self.root, &IndexValidator)?;
        self.root = block.location;
        self.encode_block(block.as_bytes_mut());
        tm.unlock_write(block, &IndexValidator)?;
        self.dirty = false;
        Ok(())
    }

    fn root(&self) -> u64 {
        self.root
    }

    fn set_root(&mut self, root: u64) {
        self.root = root;
    }
}

/// Alias for a low-level space map backed by the metadata index flavor.
pub type MetadataSm<TM, Ovf> = LLDisk<TM, MetadataIndexStore, Ovf>;

/// Creates a brand-new metadata-flavored low-level space map with no
/// tracked blocks.
pub fn new_metadata<TM, Ovf>(mut tm: TM) -> Result<MetadataSm<TM, Ovf>, SmError>
where
    TM: TransactionManager,
    Ovf: crate::btree::Btree<TM, u32>,
{
    let block_size = tm.block_size();
    let entries_per_block = LLDisk::<TM, MetadataIndexStore, Ovf>::compute_entries_per_block(block_size)?;
    let mut index = MetadataIndexStore::new(block_size);
    index.init_index(&mut tm)?;
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

/// Reopens a metadata-flavored low-level space map from a previously
/// committed [`crate::root::DiskSmRoot`].
pub fn open_metadata<TM, Ovf>(
    mut tm: TM,
    root: crate::root::DiskSmRoot,
) -> Result<MetadataSm<TM, Ovf>, SmError>
where
    TM: TransactionManager,
    Ovf: crate::btree::Btree<TM, u32>,
{
    let block_size = tm.block_size();
    let entries_per_block = LLDisk::<TM, MetadataIndexStore, Ovf>::compute_entries_per_block(block_size)?;
    let mut index = MetadataIndexStore::new(block_size);
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
    fn fresh_index_has_no_entries() {
        let tm = MemTransactionManager::new(4096);
        let sm: MetadataSm<_, MemBtree<u32>> = new_metadata(tm).unwrap();
        assert_eq!(sm.nr_blocks(), 0);
        assert_eq!(sm.nr_allocated(), 0);
    }

    #[test]
    fn save_and_load_round_trip_before_commit() {
        let tm = MemTransactionManager::new(4096);
        let mut sm: MetadataSm<_, MemBtree<u32>> = new_metadata(tm).unwrap();
        sm.extend(sm.entries_per_block() as u64 + 10).unwrap();
        assert_eq!(sm.nr_blocks(), sm.entries_per_block() as u64 + 10);
    }
}
