//! Per-bitmap-block metadata record, and the validator for the block kind
//! that stores an array of these (the metadata index flavor's root block).

use binrw::{BinRead, BinWrite};

use crate::block::Validator;
use crate::checksum;
use crate::error::SmError;

const INDEX_CSUM_XOR: u32 = 160478;

/// Location, free count, and search hint for one bitmap block.
///
/// `none_free_before` is a conservative lower bound on the first position
/// that might still be free: every position below it is guaranteed
/// non-free, but it is never required to be tight. It only ever moves
/// forward when a free slot at exactly that position is consumed, and
/// backward when a slot below it is freed.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[brw(little)]
pub struct IndexEntry {
    pub blocknr: u64,
    pub nr_free: u32,
    pub none_free_before: u32,
}

impl IndexEntry {
    pub const ENCODED_SIZE: usize = 16;
}

pub struct IndexValidator;

impl Validator for IndexValidator {
    fn prepare_for_write(&self, data: &mut [u8], location: u64) {
        checksum::prepare_for_write(data, location, INDEX_CSUM_XOR);
    }

    fn check(&self, data: &[u8], location: u64) -> Result<(), SmError> {
        checksum::check(data, location, INDEX_CSUM_XOR)
    }
}

/// How many index entries fit in one metadata-index block after its header.
pub fn max_metadata_bitmaps(block_size: u32) -> u64 {
    (block_size as u64 - checksum::HEADER_SIZE as u64) / IndexEntry::ENCODED_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::{BinWrite, io::Cursor};

    #[test]
    fn index_entry_round_trips_little_endian() {
        let ie = IndexEntry {
            blocknr: 0x1122_3344_5566_7788,
            nr_free: 17,
            none_free_before: 3,
        };
        let mut buf = Cursor::new(Vec::new());
        ie.write_le(&mut buf).unwrap();
        let bytes = buf.into_inner();
        assert_eq!(bytes.len(), IndexEntry::ENCODED_SIZE);

        let mut cursor = Cursor::new(&bytes);
        let back = IndexEntry::read_le(&mut cursor).unwrap();
        assert_eq!(ie, back);
    }

    #[test]
    fn max_metadata_bitmaps_matches_header_math() {
        assert_eq!(max_metadata_bitmaps(4096), (4096 - 16) / 16);
    }
}
