//! `disk_sm_root`: the fixed-length record the enclosing space-map layer
//! writes at commit time and passes back in on `open_metadata`/`open_disk`.

use binrw::{BinRead, BinWrite};

use crate::error::SmError;

#[derive(BinRead, BinWrite, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[brw(little)]
pub struct DiskSmRoot {
    pub nr_blocks: u64,
    pub nr_allocated: u64,
    pub bitmap_root: u64,
    pub ref_count_root: u64,
}

impl DiskSmRoot {
    pub const SIZE: usize = 32;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, SmError> {
        if buf.len() < Self::SIZE {
            return Err(SmError::TooSmall {
                got: buf.len(),
                need: Self::SIZE,
            });
        }
        let mut cursor = binrw::io::Cursor::new(&buf[..Self::SIZE]);
        Ok(Self::read(&mut cursor)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = binrw::io::Cursor::new(Vec::with_capacity(Self::SIZE));
        self.write(&mut cursor)
            .expect("fixed-size record write cannot fail");
        cursor.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let root = DiskSmRoot {
            nr_blocks: 1024,
            nr_allocated: 17,
            bitmap_root: 3,
            ref_count_root: 9,
        };
        let bytes = root.to_bytes();
        assert_eq!(bytes.len(), DiskSmRoot::SIZE);
        assert_eq!(DiskSmRoot::from_bytes(&bytes).unwrap(), root);
    }

    #[test]
    fn rejects_short_buffer() {
        let err = DiskSmRoot::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, SmError::TooSmall { got: 10, need: 32 }));
    }

    #[test]
    fn tolerates_trailing_bytes() {
        let root = DiskSmRoot {
            nr_blocks: 5,
            nr_allocated: 1,
            bitmap_root: 2,
            ref_count_root: 3,
        };
        let mut bytes = root.to_bytes();
        bytes.extend_from_slice(&[0xFF; 8]);
        assert_eq!(DiskSmRoot::from_bytes(&bytes).unwrap(), root);
    }
}
