//! The B-tree itself is an out-of-scope collaborator: this module
//! only declares the narrow interface the LL layer drives it through. A
//! concrete single-node double lives in [`crate::testing::mem_btree`].

use crate::block::WriteBlock;
use crate::error::SmError;

/// A value type storable in a B-tree leaf: the overflow tree stores `u32`
/// refcounts, the disk index flavor stores [`crate::index_entry::IndexEntry`].
pub trait BtreeValue: Copy {
    const ENCODED_SIZE: usize;
    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl BtreeValue for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().unwrap())
    }
}

impl BtreeValue for crate::index_entry::IndexEntry {
    const ENCODED_SIZE: usize = Self::ENCODED_SIZE;

    fn encode(&self, buf: &mut [u8]) {
        use binrw::BinWrite;
        let mut cursor = binrw::io::Cursor::new(buf);
        self.write_le(&mut cursor).expect("fixed-size record write cannot fail");
    }

    fn decode(buf: &[u8]) -> Self {
        use binrw::BinRead;
        let mut cursor = binrw::io::Cursor::new(buf);
        Self::read_le(&mut cursor).expect("fixed-size record read cannot fail")
    }
}

/// A shadow-locked leaf known to contain (or not contain) `key`, returned by
/// `get_overwrite_leaf`. The caller mutates it in place with [`Self::set`] or
/// [`Self::clear`] and hands it back to `commit_overwrite_leaf`, which
/// persists the change and unlocks the leaf. This replaces the six-argument
/// C `get_overwrite_leaf`/separate-index form: the leaf handle itself
/// records whether the key was present and its value, so callers never need
/// a separate index output.
pub struct OverwriteLeaf<V> {
    pub(crate) block: WriteBlock,
    pub(crate) key: u64,
    present: bool,
    value: Option<V>,
}

impl<V: Copy> OverwriteLeaf<V> {
    pub fn new(block: WriteBlock, key: u64, present: bool, value: Option<V>) -> Self {
        Self {
            block,
            key,
            present,
            value,
        }
    }

    /// True iff this leaf currently holds `key` (the key it was located
    /// for; a leaf is never reused for a different key).
    pub fn contains(&self, key: u64) -> bool {
        self.present && self.key == key
    }

    pub fn value(&self) -> Option<V> {
        self.value
    }

    pub fn set(&mut self, value: V) {
        self.present = true;
        self.value = Some(value);
    }

    pub fn clear(&mut self) {
        self.present = false;
        self.value = None;
    }

    pub(crate) fn into_parts(self) -> (WriteBlock, u64, bool, Option<V>) {
        (self.block, self.key, self.present, self.value)
    }
}

/// Narrow interface the LL layer needs from a B-tree keyed by `u64`, typed
/// over `V`. Deliberately stateless (every operation takes the tree's root
/// and returns the new one); the tree's state lives entirely in blocks
/// addressed through the transaction manager.
pub trait Btree<TM, V> {
    fn empty(tm: &mut TM) -> Result<u64, SmError>;
    fn lookup(tm: &mut TM, root: u64, key: u64) -> Result<Option<V>, SmError>;
    fn insert(tm: &mut TM, root: u64, key: u64, value: V) -> Result<u64, SmError>;
    fn remove(tm: &mut TM, root: u64, key: u64) -> Result<u64, SmError>;
    /// Shadow-locates the leaf where `key` lives or would live.
    fn get_overwrite_leaf(tm: &mut TM, root: u64, key: u64) -> Result<OverwriteLeaf<V>, SmError>;
    /// Persists whatever the caller left in `leaf` (inserting, overwriting,
    /// or removing `key`) and returns the resulting root.
    fn commit_overwrite_leaf(tm: &mut TM, leaf: OverwriteLeaf<V>) -> Result<u64, SmError>;
}
