//! Low-level space map core: a persistent, transactional structure tracking
//! the reference count of every block on a device, for copy-on-write volume
//! managers to decide which blocks are free, singly referenced, or shared.
//!
//! Combines a two-bit-per-block bitmap ([`bitmap`]) addressed through a
//! top-level index ([`index_entry`], [`ll::metadata`], [`ll::disk`]) with an
//! overflow B-tree ([`btree`]) for blocks referenced three or more times.
//! All mutation flows through a [`block::TransactionManager`] collaborator
//! so that shadowed blocks stay crash-consistent; the transaction manager
//! itself, and the overflow B-tree's concrete implementation, are out of
//! scope for this crate and are modeled only as narrow traits. See
//! [`testing`] for in-memory doubles of both, useful for exercising this
//! crate without a real block device.

mod bitmap;
mod block;
mod btree;
mod checksum;
mod error;
mod index_entry;
mod ll;
mod root;

pub mod testing;

pub use bitmap::BitmapValidator;
pub use block::{ReadBlock, TransactionManager, Validator, WriteBlock};
pub use btree::{Btree, BtreeValue, OverwriteLeaf};
pub use error::SmError;
pub use index_entry::{IndexEntry, IndexValidator, max_metadata_bitmaps};
pub use ll::{
    IndexStore, LLDisk,
    disk::{DiskIndexStore, DiskSm, new_disk, open_disk},
    metadata::{MetadataIndexStore, MetadataSm, new_metadata, open_metadata},
};
pub use root::DiskSmRoot;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemBtree, MemTransactionManager};

    type Sm = MetadataSm<MemTransactionManager, MemBtree<u32>>;

    fn fresh(block_size: u32) -> Sm {
        new_metadata(MemTransactionManager::new(block_size)).unwrap()
    }

    /// S1: the 0→1→2→3 bitmap transition handoff to the overflow tree, and
    /// back down through 3→2 with the overflow entry removed.
    #[test]
    fn s1_inc_dec_transitions_through_overflow() {
        let mut sm = fresh(4096);
        sm.extend(1024).unwrap();

        assert_eq!(sm.lookup(0).unwrap(), 0);
        assert_eq!(sm.inc(0, 1).unwrap(), 1);
        assert_eq!(sm.lookup(0).unwrap(), 1);
        assert_eq!(sm.inc(0, 1).unwrap(), 0);
        assert_eq!(sm.lookup(0).unwrap(), 2);
        assert_eq!(sm.inc(0, 1).unwrap(), 0);
        assert_eq!(sm.lookup(0).unwrap(), 3);

        assert_eq!(sm.dec(0, 1).unwrap(), 0);
        assert_eq!(sm.lookup(0).unwrap(), 2);
    }

    /// S2: a range straddling a bitmap-block boundary updates both index
    /// entries' free counts by the right amount.
    #[test]
    fn s2_range_inc_spans_bitmap_boundary() {
        let mut sm: DiskSm<MemTransactionManager, MemBtree<IndexEntry>, MemBtree<u32>> =
            new_disk(MemTransactionManager::new(4096)).unwrap();
        let epb = sm.entries_per_block() as u64;
        sm.extend(epb + 5).unwrap();

        let delta = sm.inc(epb - 1, epb + 5).unwrap();
        assert_eq!(delta, 6);
        for b in (epb - 1)..(epb + 5) {
            assert_eq!(sm.lookup(b).unwrap(), 1);
        }
    }

    /// S3: `insert` sets an absolute refcount and correctly unwinds an
    /// overflow entry when the new value drops back to 1.
    #[test]
    fn s3_insert_absolute_value_through_overflow_and_back() {
        let mut sm = fresh(4096);
        sm.extend(10).unwrap();

        assert_eq!(sm.insert(4, 7).unwrap(), 1);
        assert_eq!(sm.lookup(4).unwrap(), 7);

        assert_eq!(sm.insert(4, 1).unwrap(), 0);
        assert_eq!(sm.lookup(4).unwrap(), 1);
    }

    /// S4: `find_free_block` tracks consumption of the range and reports
    /// `NoSpace` once everything is allocated.
    #[test]
    fn s4_find_free_block_tracks_consumption() {
        let mut sm = fresh(4096);
        sm.extend(20).unwrap();

        sm.inc(0, 10).unwrap();
        assert_eq!(sm.find_free_block(0, sm.nr_blocks()).unwrap(), 10);

        sm.inc(10, 20).unwrap();
        assert!(matches!(
            sm.find_free_block(0, sm.nr_blocks()),
            Err(SmError::NoSpace)
        ));
    }

    /// S5: `find_common_free_block` skips blocks still referenced in the
    /// previous snapshot even though the new map reports them free.
    #[test]
    fn s5_find_common_free_block_skips_old_referenced() {
        let mut old = fresh(4096);
        old.extend(10).unwrap();
        old.inc(0, 3).unwrap();

        let mut new = fresh(4096);
        new.extend(10).unwrap();

        let b = new.find_common_free_block(&mut old, 0, 10).unwrap();
        assert_eq!(b, 3);
    }

    /// S6: a mixed workload on the disk flavor survives a commit/reopen
    /// round trip with every lookup agreeing.
    #[test]
    fn s6_disk_flavor_survives_commit_and_reopen() {
        let mut sm: DiskSm<MemTransactionManager, MemBtree<IndexEntry>, MemBtree<u32>> =
            new_disk(MemTransactionManager::new(4096)).unwrap();
        sm.extend(64).unwrap();
        sm.inc(0, 5).unwrap();
        sm.inc(2, 4).unwrap();
        sm.insert(40, 9).unwrap();

        let root_bytes = sm.commit().unwrap();
        let root = DiskSmRoot::from_bytes(&root_bytes).unwrap();

        let mut expected = Vec::new();
        for b in 0..64 {
            expected.push(sm.lookup(b).unwrap());
        }

        let mut reopened: DiskSm<MemTransactionManager, MemBtree<IndexEntry>, MemBtree<u32>> =
            open_disk(sm.into_tm(), root).unwrap();

        for (b, &want) in expected.iter().enumerate() {
            assert_eq!(reopened.lookup(b as u64).unwrap(), want);
        }

        // commit is idempotent once nothing is dirty
        let again = reopened.commit().unwrap();
        assert_eq!(again, reopened.commit().unwrap());
    }

    #[test]
    fn extend_zero_is_a_no_op() {
        let mut sm = fresh(4096);
        sm.extend(5).unwrap();
        let before = sm.nr_blocks();
        sm.extend(0).unwrap();
        assert_eq!(sm.nr_blocks(), before);
    }

    #[test]
    fn extend_across_bitmap_boundary_reallocates_through_itself() {
        let mut sm = fresh(4096);
        let epb = sm.entries_per_block() as u64;
        sm.extend(epb + 1).unwrap();
        assert_eq!(sm.nr_blocks(), epb + 1);
        assert_eq!(sm.lookup(epb).unwrap(), 0);
    }

    #[test]
    fn dec_zero_refcount_is_an_error() {
        let mut sm = fresh(4096);
        sm.extend(4).unwrap();
        assert!(matches!(
            sm.dec(0, 1),
            Err(SmError::CannotDecZero { addr: 0 })
        ));
    }

    #[test]
    fn inc_then_dec_restores_refcounts_and_allocation_count() {
        let mut sm = fresh(4096);
        sm.extend(50).unwrap();
        sm.inc(5, 30).unwrap();
        let allocated = sm.nr_allocated();
        sm.dec(5, 30).unwrap();
        assert_eq!(sm.nr_allocated(), allocated - 25);
        for b in 5..30 {
            assert_eq!(sm.lookup(b).unwrap(), 0);
        }
    }
}
