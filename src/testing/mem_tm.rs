//! A transaction manager backed by a plain growable `Vec` of blocks. Good
//! enough to drive the LL layer's algorithms in tests; makes no attempt at
//! the crash-consistency or COW-sharing behavior a real one provides.

use std::collections::HashSet;

use crate::block::{ReadBlock, TransactionManager, Validator, WriteBlock};
use crate::error::SmError;

pub struct MemTransactionManager {
    block_size: u32,
    blocks: Vec<Option<Box<[u8]>>>,
    free: Vec<u64>,
    shadowed_this_txn: HashSet<u64>,
}

impl MemTransactionManager {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            blocks: Vec::new(),
            free: Vec::new(),
            shadowed_this_txn: HashSet::new(),
        }
    }

    fn alloc(&mut self) -> u64 {
        if let Some(loc) = self.free.pop() {
            loc
        } else {
            let loc = self.blocks.len() as u64;
            self.blocks.push(None);
            loc
        }
    }

    fn zeroed(&self) -> Box<[u8]> {
        vec![0u8; self.block_size as usize].into_boxed_slice()
    }
}

impl TransactionManager for MemTransactionManager {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn new_block(&mut self, validator: &dyn Validator) -> Result<WriteBlock, SmError> {
        let loc = self.alloc();
        let mut data = self.zeroed();
        validator.prepare_for_write(&mut data, loc);
        self.shadowed_this_txn.insert(loc);
        Ok(WriteBlock::new(loc, data))
    }

    fn shadow_block(
        &mut self,
        location: u64,
        validator: &dyn Validator,
    ) -> Result<(WriteBlock, bool), SmError> {
        let data = self
            .blocks
            .get(location as usize)
            .and_then(|b| b.clone())
            .unwrap_or_else(|| self.zeroed());
        validator.check(&data, location)?;

        if self.shadowed_this_txn.contains(&location) {
            return Ok((WriteBlock::new(location, data), true));
        }
        self.shadowed_this_txn.insert(location);
        Ok((WriteBlock::new(location, data), false))
    }

    fn read_lock(
        &mut self,
        location: u64,
        validator: &dyn Validator,
    ) -> Result<ReadBlock, SmError> {
        let data = self
            .blocks
            .get(location as usize)
            .and_then(|b| b.clone())
            .ok_or(SmError::NotThisBlock {
                expected: location,
                actual: location,
            })?;
        validator.check(&data, location)?;
        Ok(ReadBlock::new(location, data))
    }

    fn write_lock(
        &mut self,
        location: u64,
        validator: &dyn Validator,
    ) -> Result<WriteBlock, SmError> {
        let data = self
            .blocks
            .get(location as usize)
            .and_then(|b| b.clone())
            .ok_or(SmError::NotThisBlock {
                expected: location,
                actual: location,
            })?;
        validator.check(&data, location)?;
        Ok(WriteBlock::new(location, data))
    }

    fn unlock_read(&mut self, _block: ReadBlock) {}

    fn unlock_write(&mut self, block: WriteBlock, validator: &dyn Validator) -> Result<(), SmError> {
        let loc = block.location;
        let mut data = block.into_bytes();
        validator.prepare_for_write(&mut data, loc);
        if loc as usize >= self.blocks.len() {
            self.blocks.resize(loc as usize + 1, None);
        }
        self.blocks[loc as usize] = Some(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapValidator;

    #[test]
    fn new_block_round_trips_through_write_lock() {
        let mut tm = MemTransactionManager::new(64);
        let mut wb = tm.new_block(&BitmapValidator).unwrap();
        wb.as_bytes_mut()[20] = 0xAB;
        let loc = wb.location;
        tm.unlock_write(wb, &BitmapValidator).unwrap();

        let rb = tm.read_lock(loc, &BitmapValidator).unwrap();
        assert_eq!(rb.as_bytes()[20], 0xAB);
    }

    #[test]
    fn shadow_block_reports_repeat_shadow_in_same_transaction() {
        let mut tm = MemTransactionManager::new(64);
        let wb = tm.new_block(&BitmapValidator).unwrap();
        let loc = wb.location;
        tm.unlock_write(wb, &BitmapValidator).unwrap();

        let (b1, first) = tm.shadow_block(loc, &BitmapValidator).unwrap();
        tm.unlock_write(b1, &BitmapValidator).unwrap();
        let (b2, second) = tm.shadow_block(loc, &BitmapValidator).unwrap();
        tm.unlock_write(b2, &BitmapValidator).unwrap();

        assert!(!first);
        assert!(second);
    }
}
