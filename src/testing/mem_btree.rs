//! A single-node stand-in for the overflow/index B-tree: the whole
//! tree lives in one transaction-manager block as a sorted `(key, value)`
//! array. Enough to drive the LL layer's insert/lookup/remove logic in
//! tests without pulling in a real balanced tree implementation, which is
//! out of scope for this crate.

use std::marker::PhantomData;

use crate::block::{TransactionManager, Validator};
use crate::btree::{Btree, BtreeValue, OverwriteLeaf};
use crate::error::SmError;

/// The node block carries no checksum of its own; a real B-tree
/// implementation would use the same validator machinery as the bitmap and
/// index blocks, but that's one more thing this test double doesn't need to
/// model.
struct NullValidator;

impl Validator for NullValidator {
    fn prepare_for_write(&self, _data: &mut [u8], _location: u64) {}
    fn check(&self, _data: &[u8], _location: u64) -> Result<(), SmError> {
        Ok(())
    }
}

fn decode_node<V: BtreeValue>(data: &[u8]) -> Vec<(u64, V)> {
    let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let stride = 8 + V::ENCODED_SIZE;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        let key = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        let value = V::decode(&data[off + 8..off + stride]);
        out.push((key, value));
        off += stride;
    }
    out
}

fn encode_node<V: BtreeValue>(entries: &[(u64, V)], data: &mut [u8]) -> Result<(), SmError> {
    let stride = 8 + V::ENCODED_SIZE;
    let needed = 4 + entries.len() * stride;
    if needed > data.len() {
        return Err(SmError::TooLarge {
            requested: needed as u64,
            max: data.len() as u64,
        });
    }
    data[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    let mut off = 4;
    for (key, value) in entries {
        data[off..off + 8].copy_from_slice(&key.to_le_bytes());
        value.encode(&mut data[off + 8..off + stride]);
        off += stride;
    }
    Ok(())
}

/// Marker type implementing [`Btree`] over any [`TransactionManager`] `TM`;
/// has no state of its own since the tree lives entirely in blocks `TM`
/// addresses.
pub struct MemBtree<V>(PhantomData<V>);

impl<TM, V> Btree<TM, V> for MemBtree<V>
where
    TM: TransactionManager,
    V: BtreeValue,
{
    fn empty(tm: &mut TM) -> Result<u64, SmError> {
        let block = tm.new_block(&NullValidator)?;
        let loc = block.location;
        tm.unlock_write(block, &NullValidator)?;
        Ok(loc)
    }

    fn lookup(tm: &mut TM, root: u64, key: u64) -> Result<Option<V>, SmError> {
        let block = tm.read_lock(root, &NullValidator)?;
        let entries = decode_node::<V>(block.as_bytes());
        tm.unlock_read(block);
        Ok(entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v))
    }

    fn insert(tm: &mut TM, root: u64, key: u64, value: V) -> Result<u64, SmError> {
        let (mut block, _already) = tm.shadow_block(root, &NullValidator)?;
        let mut entries = decode_node::<V>(block.as_bytes());
        match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) => entries[i].1 = value,
            Err(i) => entries.insert(i, (key, value)),
        }
        encode_node(&entries, block.as_bytes_mut())?;
        let loc = block.location;
        tm.unlock_write(block, &NullValidator)?;
        Ok(loc)
    }

    fn remove(tm: &mut TM, root: u64, key: u64) -> Result<u64, SmError> {
        let (mut block, _already) = tm.shadow_block(root, &NullValidator)?;
        let mut entries = decode_node::<V>(block.as_bytes());
        if let Ok(i) = entries.binary_search_by_key(&key, |(k, _)| *k) {
            entries.remove(i);
        }
        encode_node(&entries, block.as_bytes_mut())?;
        let loc = block.location;
        tm.unlock_write(block, &NullValidator)?;
        Ok(loc)
    }

    fn get_overwrite_leaf(tm: &mut TM, root: u64, key: u64) -> Result<OverwriteLeaf<V>, SmError> {
        let (block, _already) = tm.shadow_block(root, &NullValidator)?;
        let entries = decode_node::<V>(block.as_bytes());
        let found = entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
        Ok(OverwriteLeaf::new(block, key, found.is_some(), found))
    }

    fn commit_overwrite_leaf(tm: &mut TM, leaf: OverwriteLeaf<V>) -> Result<u64, SmError> {
        let (mut block, key, present, value) = leaf.into_parts();
        let mut entries = decode_node::<V>(block.as_bytes());
        match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) if present => entries[i].1 = value.expect("present leaf carries a value"),
            Ok(i) => {
                entries.remove(i);
            }
            Err(i) if present => entries.insert(i, (key, value.expect("present leaf carries a value"))),
            Err(_) => {}
        }
        encode_node(&entries, block.as_bytes_mut())?;
        let loc = block.location;
        tm.unlock_write(block, &NullValidator)?;
        Ok(loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemTransactionManager;

    #[test]
    fn insert_then_lookup() {
        let mut tm = MemTransactionManager::new(4096);
        let root = <MemBtree<u32> as Btree<_, u32>>::empty(&mut tm).unwrap();
        let root = <MemBtree<u32> as Btree<_, u32>>::insert(&mut tm, root, 7, 42).unwrap();
        assert_eq!(
            <MemBtree<u32> as Btree<_, u32>>::lookup(&mut tm, root, 7).unwrap(),
            Some(42)
        );
        assert_eq!(
            <MemBtree<u32> as Btree<_, u32>>::lookup(&mut tm, root, 8).unwrap(),
            None
        );
    }

    #[test]
    fn remove_then_lookup_misses() {
        let mut tm = MemTransactionManager::new(4096);
        let root = <MemBtree<u32> as Btree<_, u32>>::empty(&mut tm).unwrap();
        let root = <MemBtree<u32> as Btree<_, u32>>::insert(&mut tm, root, 3, 9).unwrap();
        let root = <MemBtree<u32> as Btree<_, u32>>::remove(&mut tm, root, 3).unwrap();
        assert_eq!(
            <MemBtree<u32> as Btree<_, u32>>::lookup(&mut tm, root, 3).unwrap(),
            None
        );
    }

    #[test]
    fn overwrite_leaf_round_trips() {
        let mut tm = MemTransactionManager::new(4096);
        let root = <MemBtree<u32> as Btree<_, u32>>::empty(&mut tm).unwrap();
        let mut leaf = <MemBtree<u32> as Btree<_, u32>>::get_overwrite_leaf(&mut tm, root, 1).unwrap();
        assert!(!leaf.contains(1));
        leaf.set(5);
        let root = <MemBtree<u32> as Btree<_, u32>>::commit_overwrite_leaf(&mut tm, leaf).unwrap();
        assert_eq!(
            <MemBtree<u32> as Btree<_, u32>>::lookup(&mut tm, root, 1).unwrap(),
            Some(5)
        );
    }
}
