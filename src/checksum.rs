//! Shared checksum plumbing for the two on-disk block headers (index and
//! bitmap). Both share the same 16-byte shape (an 8-byte `blocknr`, a
//! 4-byte checksum, and 4 bytes of padding kept at zero), so the
//! prepare/check logic is written once here and parameterized by the
//! kind-specific XOR constant.

use binrw::{BinRead, BinWrite};

use crate::error::SmError;

pub const HEADER_SIZE: usize = 16;
const CHECKSUM_OFFSET: usize = 8;
const CHECKSUM_FIELD_SIZE: usize = 4;

/// The common 16-byte prefix shared by bitmap blocks and the metadata index
/// block: self-location, checksum, and reserved padding.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, Default)]
#[brw(little)]
pub struct BlockHeader {
    pub blocknr: u64,
    pub checksum: u32,
    pub padding: u32,
}

/// Covers everything after the checksum field itself: the 4 padding bytes
/// plus the payload. Both the write path and the check path start counting
/// from the same offset, unlike the original C macro invocation this was
/// distilled from, whose length argument is computed relative to a
/// different base than the pointer it's paired with (see DESIGN.md).
fn body_checksum(data: &[u8], xor: u32) -> u32 {
    crc32c::crc32c(&data[CHECKSUM_OFFSET + CHECKSUM_FIELD_SIZE..]) ^ xor
}

pub fn prepare_for_write(data: &mut [u8], location: u64, xor: u32) {
    data[0..8].copy_from_slice(&location.to_le_bytes());
    let csum = body_checksum(data, xor);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&csum.to_le_bytes());
}

pub fn check(data: &[u8], location: u64, xor: u32) -> Result<(), SmError> {
    let actual = u64::from_le_bytes(data[0..8].try_into().unwrap());
    if actual != location {
        return Err(SmError::NotThisBlock {
            expected: location,
            actual,
        });
    }
    let want = u32::from_le_bytes(
        data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    let got = body_checksum(data, xor);
    if want != got {
        log::warn!("bad checksum on block {location}");
        return Err(SmError::BadChecksum { addr: location });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_then_check_roundtrips() {
        let mut data = vec![0u8; 64];
        data[20] = 0xAB;
        prepare_for_write(&mut data, 42, 160478);
        check(&data, 42, 160478).unwrap();
    }

    #[test]
    fn wrong_location_is_rejected() {
        let mut data = vec![0u8; 64];
        prepare_for_write(&mut data, 42, 160478);
        assert!(matches!(
            check(&data, 43, 160478),
            Err(SmError::NotThisBlock { .. })
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let mut data = vec![0u8; 64];
        prepare_for_write(&mut data, 42, 160478);
        data[32] ^= 0xFF;
        assert!(matches!(
            check(&data, 42, 160478),
            Err(SmError::BadChecksum { .. })
        ));
    }
}
