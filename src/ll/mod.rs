//! The LL (low-level) core: lookup, find-free, insert, range inc/dec, and
//! commit, generic over the index storage strategy and the overflow B-tree.

pub mod disk;
pub mod metadata;

use std::marker::PhantomData;

use crate::bitmap::{self, BitmapValidator};
use crate::block::TransactionManager;
use crate::btree::Btree;
use crate::error::SmError;
use crate::index_entry::IndexEntry;
use crate::root::DiskSmRoot;

pub use disk::DiskIndexStore;
pub use metadata::MetadataIndexStore;

/// The two index flavors share this interface; the LL core
/// is generic over it rather than branching on a variant tag.
pub trait IndexStore<TM: TransactionManager> {
    fn init_index(&mut self, tm: &mut TM) -> Result<(), SmError>;
    fn open_index(&mut self, tm: &mut TM) -> Result<(), SmError>;
    fn load_ie(&mut self, tm: &mut TM, index: u64) -> Result<IndexEntry, SmError>;
    fn save_ie(&mut self, tm: &mut TM, index: u64, ie: IndexEntry) -> Result<(), SmError>;
    fn max_entries(&self) -> u64;
    fn commit(&mut self, tm: &mut TM) -> Result<(), SmError>;
    fn root(&self) -> u64;
    fn set_root(&mut self, root: u64);
}

/// Holds the bitmap block and overflow leaf that may be locked mid-way
/// through one bitmap-block's worth of `inc`/`dec` work, so that either can
/// be released (to let the overflow tree allocate through this same space
/// map) and reacquired without losing track of what's still held. `reset`
/// releases both unconditionally; every exit path, success or error, calls
/// it before returning, so a lock is never leaked out of one range step.
struct IncContext<V> {
    bitmap: Option<crate::block::WriteBlock>,
    overflow_leaf: Option<crate::btree::OverwriteLeaf<V>>,
}

impl<V> IncContext<V> {
    fn new() -> Self {
        Self {
            bitmap: None,
            overflow_leaf: None,
        }
    }

    fn ensure_bitmap<TM: TransactionManager>(
        &mut self,
        tm: &mut TM,
        blocknr: u64,
    ) -> Result<(), SmError> {
        if self.bitmap.is_none() {
            self.bitmap = Some(tm.write_lock(blocknr, &BitmapValidator)?);
        }
        Ok(())
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        self.bitmap
            .as_mut()
            .expect("ensure_bitmap must be called before touching the bitmap")
            .as_bytes_mut()
    }

    fn reset<TM: TransactionManager, Ovf: Btree<TM, V>>(
        &mut self,
        tm: &mut TM,
        ref_count_root: &mut u64,
    ) -> Result<(), SmError> {
        if let Some(wb) = self.bitmap.take() {
            tm.unlock_write(wb, &BitmapValidator)?;
        }
        if let Some(leaf) = self.overflow_leaf.take() {
            *ref_count_root = Ovf::commit_overwrite_leaf(tm, leaf)?;
        }
        Ok(())
    }
}

/// Per-space-map-instance state shared by both index flavors. Generic over
/// the transaction manager, the index store, and the overflow B-tree rather
/// than a runtime vtable. Monomorphized dispatch, in keeping with this
/// codebase's preference for generics over `dyn`.
pub struct LLDisk<TM, Idx, Ovf> {
    tm: TM,
    block_size: u32,
    entries_per_block: u32,
    nr_blocks: u64,
    nr_allocated: u64,
    ref_count_root: u64,
    bitmap_index_changed: bool,
    index: Idx,
    _ovf: PhantomData<Ovf>,
}

impl<TM, Idx, Ovf> LLDisk<TM, Idx, Ovf>
where
    TM: TransactionManager,
    Idx: IndexStore<TM>,
    Ovf: Btree<TM, u32>,
{
    pub(crate) fn compute_entries_per_block(block_size: u32) -> Result<u32, SmError> {
        let entries = bitmap::entries_per_block_u64(block_size);
        if entries > u32::MAX as u64 {
            return Err(SmError::InvalidConfig { block_size });
        }
        Ok(entries as u32)
    }

    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    pub fn nr_allocated(&self) -> u64 {
        self.nr_allocated
    }

    pub fn entries_per_block(&self) -> u32 {
        self.entries_per_block
    }

    pub fn tm(&self) -> &TM {
        &self.tm
    }

    pub fn tm_mut(&mut self) -> &mut TM {
        &mut self.tm
    }

    pub fn into_tm(self) -> TM {
        self.tm
    }

    fn split(&self, b: u64) -> (u64, u32) {
        (
            b / self.entries_per_block as u64,
            (b % self.entries_per_block as u64) as u32,
        )
    }

    fn lookup_big_ref_count(&mut self, b: u64) -> Result<u32, SmError> {
        Ovf::lookup(&mut self.tm, self.ref_count_root, b)?.ok_or_else(|| {
            log::warn!("overflow btree missing entry for block {b}");
            SmError::MissingOverflow { addr: b }
        })
    }

    pub fn lookup_bitmap(&mut self, b: u64) -> Result<u8, SmError> {
        if b >= self.nr_blocks {
            return Err(SmError::OutOfBounds {
                addr: b,
                nr_blocks: self.nr_blocks,
            });
        }
        let (index, j) = self.split(b);
        let ie = self.index.load_ie(&mut self.tm, index)?;
        let block = self.tm.read_lock(ie.blocknr, &BitmapValidator)?;
        let v = bitmap::lookup(block.as_bytes(), j);
        self.tm.unlock_read(block);
        Ok(v)
    }

    pub fn lookup(&mut self, b: u64) -> Result<u32, SmError> {
        let v = self.lookup_bitmap(b)?;
        if v == 3 {
            self.lookup_big_ref_count(b)
        } else {
            Ok(v as u32)
        }
    }

    /// Walks bitmap blocks from `begin` to `end`, narrowing each scan by
    /// `none_free_before` but never trusting it as authoritative: a `NoSpace`
    /// from a partial scan just means "try the next bitmap".
    pub fn find_free_block(&mut self, begin: u64, end: u64) -> Result<u64, SmError> {
        let epb = self.entries_per_block as u64;
        let index_begin = begin / epb;
        let index_end = end.div_ceil(epb);
        let mut bit_begin = (begin % epb) as u32;

        for i in index_begin..index_end {
            let ie = self.index.load_ie(&mut self.tm, i)?;
            if ie.nr_free == 0 {
                bit_begin = 0;
                continue;
            }
            let block = self.tm.read_lock(ie.blocknr, &BitmapValidator)?;
            let bit_end = if i == index_end - 1 {
                let rem = (end % epb) as u32;
                if rem == 0 { self.entries_per_block } else { rem }
            } else {
                self.entries_per_block
            };
            let scan_begin = bit_begin.max(ie.none_free_before);
            let found = bitmap::find_free(block.as_bytes(), scan_begin, bit_end);
            self.tm.unlock_read(block);
            bit_begin = 0;

            if let Some(pos) = found {
                return Ok(i * epb + pos as u64);
            }
        }
        Err(SmError::NoSpace)
    }

    /// Finds a block free in `self` but skips any block that is still
    /// referenced in `old`, since it may still be needed for that
    /// transaction's rollback. Used when choosing where to write new data
    /// without clobbering content the previous snapshot still depends on.
    pub fn find_common_free_block(
        &mut self,
        old: &mut Self,
        begin: u64,
        end: u64,
    ) -> Result<u64, SmError> {
        let mut begin = begin;
        loop {
            let b = self.find_free_block(begin, end)?;
            let still_referenced = if b >= old.nr_blocks {
                false
            } else {
                old.lookup(b)? != 0
            };
            if !still_referenced {
                return Ok(b);
            }
            begin = b + 1;
        }
    }

    /// Sets the absolute refcount of `b`, returning the change in
    /// `nr_allocated` (`+1` on `0 -> >=1`, `-1` on `>=1 -> 0`, else `0`).
    pub fn insert(&mut self, b: u64, ref_count: u32) -> Result<i64, SmError> {
        let (index, bit) = self.split(b);
        let mut ie = self.index.load_ie(&mut self.tm, index)?;

        let (mut block, _already_shadowed) = self.tm.shadow_block(ie.blocknr, &BitmapValidator)?;
        ie.blocknr = block.location;

        let mut old = bitmap::lookup(block.as_bytes(), bit) as u32;
        if old > 2 {
            old = match self.tm.unlock_write(block, &BitmapValidator) {
                Ok(()) => self.lookup_big_ref_count(b)?,
                Err(e) => return Err(e),
            };
            let (new_block, _) = self.tm.shadow_block(ie.blocknr, &BitmapValidator)?;
            block = new_block;
        }

        if ref_count <= 2 {
            bitmap::set(block.as_bytes_mut(), bit, ref_count as u8);
            self.tm.unlock_write(block, &BitmapValidator)?;
            if old > 2 {
                self.ref_count_root = Ovf::remove(&mut self.tm, self.ref_count_root, b)?;
            }
        } else {
            bitmap::set(block.as_bytes_mut(), bit, 3);
            self.tm.unlock_write(block, &BitmapValidator)?;
            self.ref_count_root = Ovf::insert(&mut self.tm, self.ref_count_root, b, ref_count)?;
        }

        let delta = if ref_count != 0 && old == 0 {
            ie.nr_free -= 1;
            if ie.none_free_before == bit {
                ie.none_free_before = bit + 1;
            }
            1
        } else if ref_count == 0 && old != 0 {
            ie.nr_free += 1;
            ie.none_free_before = ie.none_free_before.min(bit);
            -1
        } else {
            0
        };
        self.nr_allocated = (self.nr_allocated as i64 + delta) as u64;

        self.index.save_ie(&mut self.tm, index, ie)?;
        self.bitmap_index_changed = true;
        Ok(delta)
    }

    fn inc_overflow(&mut self, ic: &mut IncContext<u32>, b: u64) -> Result<(), SmError> {
        if let Some(leaf) = ic.overflow_leaf.as_mut() {
            if leaf.contains(b) {
                let v = leaf.value().expect("leaf containing b has a value");
                leaf.set(v + 1);
                return Ok(());
            }
        }
        ic.reset::<TM, Ovf>(&mut self.tm, &mut self.ref_count_root)?;
        let mut leaf = Ovf::get_overwrite_leaf(&mut self.tm, self.ref_count_root, b)?;
        if !leaf.contains(b) {
            log::warn!("overflow btree missing entry for block {b} during inc");
            return Err(SmError::MissingOverflow { addr: b });
        }
        let v = leaf.value().unwrap();
        leaf.set(v + 1);
        ic.overflow_leaf = Some(leaf);
        Ok(())
    }

    /// Returns the refcount the overflow tree held before this decrement.
    fn dec_overflow(&mut self, ic: &mut IncContext<u32>, b: u64) -> Result<u32, SmError> {
        if let Some(leaf) = ic.overflow_leaf.as_mut() {
            if leaf.contains(b) {
                let old = leaf.value().expect("leaf containing b has a value");
                if old > 3 {
                    leaf.set(old - 1);
                } else {
                    leaf.clear();
                }
                return Ok(old);
            }
        }
        ic.reset::<TM, Ovf>(&mut self.tm, &mut self.ref_count_root)?;
        let mut leaf = Ovf::get_overwrite_leaf(&mut self.tm, self.ref_count_root, b)?;
        if !leaf.contains(b) {
            log::warn!("overflow btree missing entry for block {b} during dec");
            return Err(SmError::MissingOverflow { addr: b });
        }
        let old = leaf.value().unwrap();
        if old > 3 {
            leaf.set(old - 1);
        } else {
            leaf.clear();
        }
        ic.overflow_leaf = Some(leaf);
        Ok(old)
    }

    /// One bitmap-block's worth of `inc`, stopping at whichever comes first
    /// of `end` or the end of this bitmap block, and returning the next
    /// unconsumed block address and the change in `nr_allocated`.
    fn inc_step(&mut self, b0: u64, end: u64) -> Result<(u64, i64), SmError> {
        let (index, bit0) = self.split(b0);
        let mut ie = self.index.load_ie(&mut self.tm, index)?;

        let mut ic: IncContext<u32> = IncContext::new();
        let (wb, _already) = self.tm.shadow_block(ie.blocknr, &BitmapValidator)?;
        ie.blocknr = wb.location;
        ic.bitmap = Some(wb);

        let remaining = end.saturating_sub(b0);
        let bit_end = ((bit0 as u64 + remaining).min(self.entries_per_block as u64)) as u32;

        let mut nr_alloc: i64 = 0;
        let mut b = b0;
        let mut bit = bit0;
        while bit != bit_end {
            ic.ensure_bitmap(&mut self.tm, ie.blocknr)?;
            let old = bitmap::lookup(ic.bitmap_mut(), bit);
            match old {
                0 => {
                    bitmap::set(ic.bitmap_mut(), bit, 1);
                    nr_alloc += 1;
                    self.nr_allocated += 1;
                    ie.nr_free -= 1;
                    if ie.none_free_before == bit {
                        ie.none_free_before = bit + 1;
                    }
                }
                1 => bitmap::set(ic.bitmap_mut(), bit, 2),
                2 => {
                    bitmap::set(ic.bitmap_mut(), bit, 3);
                    ic.reset::<TM, Ovf>(&mut self.tm, &mut self.ref_count_root)?;
                    self.ref_count_root = Ovf::insert(&mut self.tm, self.ref_count_root, b, 3)?;
                }
                _ => self.inc_overflow(&mut ic, b)?,
            }
            bit += 1;
            b += 1;
        }

        ic.reset::<TM, Ovf>(&mut self.tm, &mut self.ref_count_root)?;
        self.index.save_ie(&mut self.tm, index, ie)?;
        self.bitmap_index_changed = true;
        Ok((b, nr_alloc))
    }

    fn dec_step(&mut self, b0: u64, end: u64) -> Result<(u64, i64), SmError> {
        let (index, bit0) = self.split(b0);
        let mut ie = self.index.load_ie(&mut self.tm, index)?;

        let mut ic: IncContext<u32> = IncContext::new();
        let (wb, _already) = self.tm.shadow_block(ie.blocknr, &BitmapValidator)?;
        ie.blocknr = wb.location;
        ic.bitmap = Some(wb);

        let remaining = end.saturating_sub(b0);
        let bit_end = ((bit0 as u64 + remaining).min(self.entries_per_block as u64)) as u32;

        let mut nr_alloc: i64 = 0;
        let mut b = b0;
        let mut bit = bit0;
        while bit != bit_end {
            ic.ensure_bitmap(&mut self.tm, ie.blocknr)?;
            let old = bitmap::lookup(ic.bitmap_mut(), bit);
            match old {
                0 => {
                    ic.reset::<TM, Ovf>(&mut self.tm, &mut self.ref_count_root)?;
                    return Err(SmError::CannotDecZero { addr: b });
                }
                1 => {
                    bitmap::set(ic.bitmap_mut(), bit, 0);
                    nr_alloc -= 1;
                    self.nr_allocated -= 1;
                    ie.nr_free += 1;
                    ie.none_free_before = ie.none_free_before.min(bit);
                }
                2 => bitmap::set(ic.bitmap_mut(), bit, 1),
                _ => {
                    let was = self.dec_overflow(&mut ic, b)?;
                    if was == 3 {
                        ic.ensure_bitmap(&mut self.tm, ie.blocknr)?;
                        bitmap::set(ic.bitmap_mut(), bit, 2);
                    }
                }
            }
            bit += 1;
            b += 1;
        }

        ic.reset::<TM, Ovf>(&mut self.tm, &mut self.ref_count_root)?;
        self.index.save_ie(&mut self.tm, index, ie)?;
        self.bitmap_index_changed = true;
        Ok((b, nr_alloc))
    }

    /// Increments every block in `[begin, end)`, returning the net change in
    /// `nr_allocated`. Amortizes bitmap acquisition across each bitmap
    /// block's worth of the range.
    pub fn inc(&mut self, begin: u64, end: u64) -> Result<i64, SmError> {
        if end > self.nr_blocks {
            return Err(SmError::OutOfBounds {
                addr: end.saturating_sub(1),
                nr_blocks: self.nr_blocks,
            });
        }
        let mut total = 0i64;
        let mut b = begin;
        while b < end {
            let (next_b, delta) = self.inc_step(b, end)?;
            total += delta;
            b = next_b;
        }
        Ok(total)
    }

    /// Decrements every block in `[begin, end)`, returning the net change in
    /// `nr_allocated`.
    pub fn dec(&mut self, begin: u64, end: u64) -> Result<i64, SmError> {
        if end > self.nr_blocks {
            return Err(SmError::OutOfBounds {
                addr: end.saturating_sub(1),
                nr_blocks: self.nr_blocks,
            });
        }
        let mut total = 0i64;
        let mut b = begin;
        while b < end {
            let (next_b, delta) = self.dec_step(b, end)?;
            total += delta;
            b = next_b;
        }
        Ok(total)
    }

    /// Appends `extra` blocks to the address space, allocating the bitmap
    /// blocks needed to cover them. `nr_blocks` is updated *before* any
    /// allocation: the allocator is this same space map, so a newly created
    /// bitmap block's own `inc` must already see the enlarged universe.
    pub fn extend(&mut self, extra: u64) -> Result<(), SmError> {
        let epb = self.entries_per_block as u64;
        let old_indexes = self.nr_blocks.div_ceil(epb.max(1));
        let new_nr = self.nr_blocks + extra;
        let new_indexes = new_nr.div_ceil(epb.max(1));

        if new_indexes > self.index.max_entries() {
            return Err(SmError::TooLarge {
                requested: new_indexes,
                max: self.index.max_entries(),
            });
        }

        self.nr_blocks = new_nr;

        for i in old_indexes..new_indexes {
            let block = self.tm.new_block(&BitmapValidator)?;
            let blocknr = block.location;
            self.tm.unlock_write(block, &BitmapValidator)?;
            self.index.save_ie(
                &mut self.tm,
                i,
                IndexEntry {
                    blocknr,
                    nr_free: self.entries_per_block,
                    none_free_before: 0,
                },
            )?;
            self.bitmap_index_changed = true;
        }
        Ok(())
    }

    /// Flushes any cached index state and writes the index root, then
    /// serializes `disk_sm_root`. A no-op on the index side when nothing is
    /// dirty (idempotent on repeated calls).
    pub fn commit(&mut self) -> Result<Vec<u8>, SmError> {
        if self.bitmap_index_changed {
            self.index.commit(&mut self.tm)?;
            self.bitmap_index_changed = false;
        }
        Ok(DiskSmRoot {
            nr_blocks: self.nr_blocks,
            nr_allocated: self.nr_allocated,
            bitmap_root: self.index.root(),
            ref_count_root: self.ref_count_root,
        }
        .to_bytes())
    }
}
