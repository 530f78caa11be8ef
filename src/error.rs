use thiserror::Error;

/// Error taxonomy for the low-level space map. Every fallible boundary in
/// this crate returns `Result<_, SmError>`.
#[derive(Debug, Error)]
pub enum SmError {
    #[error("block {addr} is out of bounds (nr_blocks = {nr_blocks})")]
    OutOfBounds { addr: u64, nr_blocks: u64 },

    #[error("no free block in the requested range")]
    NoSpace,

    #[error("extending would require {requested} index entries, more than the {max} this index supports")]
    TooLarge { requested: u64, max: u64 },

    #[error("cannot decrement block {addr}: refcount is already zero")]
    CannotDecZero { addr: u64 },

    #[error("bitmap marks block {addr} as overflow but the overflow tree has no entry for it")]
    MissingOverflow { addr: u64 },

    #[error("bad checksum on block {addr}")]
    BadChecksum { addr: u64 },

    #[error("block read from location {actual} does not match the expected location {expected}")]
    NotThisBlock { expected: u64, actual: u64 },

    #[error("root descriptor buffer too small: got {got} bytes, need {need}")]
    TooSmall { got: usize, need: usize },

    #[error("block size {block_size} yields more entries per block than a 32-bit index can address")]
    InvalidConfig { block_size: u32 },

    #[error("space map collaborator failed: {0}")]
    Collaborator(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<binrw::Error> for SmError {
    fn from(e: binrw::Error) -> Self {
        SmError::Collaborator(Box::new(e))
    }
}
