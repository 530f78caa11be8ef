//! Collaborator contracts: the block manager and transaction manager are
//! deliberately out of scope for this crate, but the LL layer
//! is written against narrow traits so it can be driven by a real one. A
//! concrete in-memory double lives in [`crate::testing`].

use crate::error::SmError;

/// Runs at every `new_block`/`shadow_block`/`read_lock`/`write_lock` call to
/// stamp a block's self-location and checksum before it hits stable storage,
/// and to verify both on the way back in.
pub trait Validator {
    fn prepare_for_write(&self, data: &mut [u8], location: u64);
    fn check(&self, data: &[u8], location: u64) -> Result<(), SmError>;
}

/// A block handle obtained under a shared lock. Only ever read.
pub struct ReadBlock {
    pub location: u64,
    data: Box<[u8]>,
}

impl ReadBlock {
    pub fn new(location: u64, data: Box<[u8]>) -> Self {
        Self { location, data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A block handle obtained under an exclusive lock, via `new_block` or
/// `shadow_block`. Distinct from [`ReadBlock`] so that mutating a read-locked
/// block is rejected at compile time rather than at runtime.
pub struct WriteBlock {
    pub location: u64,
    data: Box<[u8]>,
}

impl WriteBlock {
    pub fn new(location: u64, data: Box<[u8]>) -> Self {
        Self { location, data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.data
    }
}

/// Owns shadowing, commit and rollback of blocks belonging to one in-flight
/// transaction. All LL operations in this crate belong to a single logical
/// writer, so no internal locking is done here.
pub trait TransactionManager {
    fn block_size(&self) -> u32;

    /// Reserve a fresh block in the current transaction.
    fn new_block(&mut self, validator: &dyn Validator) -> Result<WriteBlock, SmError>;

    /// Return a writable copy of `location`. Returns `true` in the second
    /// element of the tuple iff this block was already shadowed earlier in
    /// the current transaction (and so occupies the same address as last
    /// time); otherwise the copy lands at a freshly allocated address.
    fn shadow_block(
        &mut self,
        location: u64,
        validator: &dyn Validator,
    ) -> Result<(WriteBlock, bool), SmError>;

    fn read_lock(&mut self, location: u64, validator: &dyn Validator) -> Result<ReadBlock, SmError>;

    fn write_lock(&mut self, location: u64, validator: &dyn Validator) -> Result<WriteBlock, SmError>;

    fn unlock_read(&mut self, block: ReadBlock);

    /// Stamps the validator over `block` (`prepare_for_write`) and commits it
    /// back to the block store.
    fn unlock_write(&mut self, block: WriteBlock, validator: &dyn Validator) -> Result<(), SmError>;
}
