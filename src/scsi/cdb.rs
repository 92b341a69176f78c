//! READ/WRITE command descriptor blocks
//!
//! Builds 6, 10, 12 and 16 byte READ and WRITE CDBs as laid out by SBC,
//! plus the handful of housekeeping commands the copy needs (READ CAPACITY
//! and SYNCHRONIZE CACHE). All multi-byte fields are big-endian.

use thiserror::Error;

/// Longest CDB the copy ever builds
pub const MAX_CDB_LEN: usize = 16;

pub const READ_CAPACITY_10: u8 = 0x25;
pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
pub const SAI_READ_CAPACITY_16: u8 = 0x10;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;

const READ_OPCODES: [u8; 4] = [0x08, 0x28, 0xa8, 0x88];
const WRITE_OPCODES: [u8; 4] = [0x0a, 0x2a, 0xaa, 0x8a];

const DPO_BIT: u8 = 0x10;
const FUA_BIT: u8 = 0x08;

/// Largest transfer length a 6-byte CDB can carry (encoded as 0)
const MAX_BLOCKS_6: u32 = 256;
/// Largest LBA a 6-byte CDB can address
const MAX_LBA_6: u64 = 0x1f_ffff;

/// Data direction of a command, from the initiator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    Read,
    /// Host to device
    Write,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// CDB construction failures; always a configuration problem
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdbError {
    #[error("unsupported cdb size {0}, expected 6, 10, 12 or 16")]
    UnsupportedSize(usize),

    #[error("{size} byte cdb can't carry {blocks} blocks (max {max})")]
    TooManyBlocks { size: usize, blocks: u32, max: u32 },

    #[error("{size} byte cdb can't address lba {lba:#x}")]
    AddressOutOfRange { size: usize, lba: u64 },

    #[error("6 byte cdb has no dpo or fua bits")]
    NoCacheBits,
}

/// A built command descriptor block
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LEN],
    len: usize,
}

impl Cdb {
    /// Build a READ or WRITE of `blocks` blocks starting at `lba`
    ///
    /// `size` picks the CDB flavour. The 6-byte form can't express
    /// more than 256 blocks, an LBA past 2^21-1 or the DPO/FUA bits; the
    /// 10-byte form caps the block count at 65535 and the 10 and 12 byte
    /// forms cap the LBA at 32 bits.
    pub fn read_write(
        size: usize,
        direction: Direction,
        blocks: u32,
        lba: u64,
        fua: bool,
        dpo: bool,
    ) -> Result<Self, CdbError> {
        let opcodes = match direction {
            Direction::Read => &READ_OPCODES,
            Direction::Write => &WRITE_OPCODES,
        };
        let mut bytes = [0u8; MAX_CDB_LEN];
        let idx = match size {
            6 => 0,
            10 => 1,
            12 => 2,
            16 => 3,
            other => return Err(CdbError::UnsupportedSize(other)),
        };
        bytes[0] = opcodes[idx];
        if dpo {
            bytes[1] |= DPO_BIT;
        }
        if fua {
            bytes[1] |= FUA_BIT;
        }

        match size {
            6 => {
                if blocks > MAX_BLOCKS_6 {
                    return Err(CdbError::TooManyBlocks { size, blocks, max: MAX_BLOCKS_6 });
                }
                let last = lba + u64::from(blocks.max(1)) - 1;
                if last > MAX_LBA_6 {
                    return Err(CdbError::AddressOutOfRange { size, lba: last });
                }
                if dpo || fua {
                    return Err(CdbError::NoCacheBits);
                }
                bytes[1] = ((lba >> 16) & 0x1f) as u8;
                bytes[2] = (lba >> 8) as u8;
                bytes[3] = lba as u8;
                // 256 blocks is encoded as zero
                bytes[4] = if blocks == MAX_BLOCKS_6 { 0 } else { blocks as u8 };
            }
            10 => {
                if blocks > u32::from(u16::MAX) {
                    return Err(CdbError::TooManyBlocks {
                        size,
                        blocks,
                        max: u32::from(u16::MAX),
                    });
                }
                let lba = u32::try_from(lba).map_err(|_| CdbError::AddressOutOfRange { size, lba })?;
                bytes[2..6].copy_from_slice(&lba.to_be_bytes());
                bytes[7..9].copy_from_slice(&(blocks as u16).to_be_bytes());
            }
            12 => {
                let lba = u32::try_from(lba).map_err(|_| CdbError::AddressOutOfRange { size, lba })?;
                bytes[2..6].copy_from_slice(&lba.to_be_bytes());
                bytes[6..10].copy_from_slice(&blocks.to_be_bytes());
            }
            _ => {
                bytes[2..10].copy_from_slice(&lba.to_be_bytes());
                bytes[10..14].copy_from_slice(&blocks.to_be_bytes());
            }
        }

        Ok(Self { bytes, len: size })
    }

    /// READ CAPACITY(10)
    pub fn read_capacity_10() -> Self {
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[0] = READ_CAPACITY_10;
        Self { bytes, len: 10 }
    }

    /// READ CAPACITY(16) with the given allocation length
    pub fn read_capacity_16(alloc_len: u32) -> Self {
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[0] = SERVICE_ACTION_IN_16;
        bytes[1] = SAI_READ_CAPACITY_16;
        bytes[10..14].copy_from_slice(&alloc_len.to_be_bytes());
        Self { bytes, len: 16 }
    }

    /// SYNCHRONIZE CACHE(10) over the whole medium
    pub fn sync_cache_10() -> Self {
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[0] = SYNCHRONIZE_CACHE_10;
        Self { bytes, len: 10 }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Decode a READ/WRITE CDB back into its transfer parameters
    pub fn decode_read_write(bytes: &[u8]) -> Option<ReadWrite> {
        let opcode = *bytes.first()?;
        let (direction, size) = if let Some(i) = READ_OPCODES.iter().position(|&o| o == opcode) {
            (Direction::Read, [6, 10, 12, 16][i])
        } else if let Some(i) = WRITE_OPCODES.iter().position(|&o| o == opcode) {
            (Direction::Write, [6, 10, 12, 16][i])
        } else {
            return None;
        };
        if bytes.len() < size {
            return None;
        }
        let be32 = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let (lba, blocks, fua, dpo) = match size {
            6 => {
                let lba = (u64::from(bytes[1] & 0x1f) << 16) | (u64::from(bytes[2]) << 8) | u64::from(bytes[3]);
                let blocks = if bytes[4] == 0 { MAX_BLOCKS_6 } else { u32::from(bytes[4]) };
                (lba, blocks, false, false)
            }
            10 => (
                u64::from(be32(2)),
                u32::from(u16::from_be_bytes([bytes[7], bytes[8]])),
                bytes[1] & FUA_BIT != 0,
                bytes[1] & DPO_BIT != 0,
            ),
            12 => (u64::from(be32(2)), be32(6), bytes[1] & FUA_BIT != 0, bytes[1] & DPO_BIT != 0),
            _ => {
                let mut lba = [0u8; 8];
                lba.copy_from_slice(&bytes[2..10]);
                (u64::from_be_bytes(lba), be32(10), bytes[1] & FUA_BIT != 0, bytes[1] & DPO_BIT != 0)
            }
        };
        Some(ReadWrite { direction, size, lba, blocks, fua, dpo })
    }
}

impl std::fmt::Debug for Cdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}

/// Transfer parameters recovered from a READ/WRITE CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWrite {
    pub direction: Direction,
    pub size: usize,
    pub lba: u64,
    pub blocks: u32,
    pub fua: bool,
    pub dpo: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read10_layout() {
        let cdb = Cdb::read_write(10, Direction::Read, 128, 0x1234_5678, false, false).unwrap();
        assert_eq!(
            cdb.as_bytes(),
            &[0x28, 0, 0x12, 0x34, 0x56, 0x78, 0, 0x00, 0x80, 0]
        );
    }

    #[test]
    fn test_write16_with_fua_and_dpo() {
        let cdb = Cdb::read_write(16, Direction::Write, 0x10000, 0x1_0000_0000, true, true).unwrap();
        let b = cdb.as_bytes();
        assert_eq!(b.len(), 16);
        assert_eq!(b[0], 0x8a);
        assert_eq!(b[1], 0x18);
        assert_eq!(&b[2..10], &[0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(&b[10..14], &[0, 1, 0, 0]);
    }

    #[test]
    fn test_write12_layout() {
        let cdb = Cdb::read_write(12, Direction::Write, 70_000, 9, false, false).unwrap();
        assert_eq!(cdb.opcode(), 0xaa);
        assert_eq!(&cdb.as_bytes()[6..10], &70_000u32.to_be_bytes());
    }

    #[test]
    fn test_six_byte_limits() {
        let cdb = Cdb::read_write(6, Direction::Read, 256, 0x1f_ff00, false, false).unwrap();
        assert_eq!(cdb.as_bytes(), &[0x08, 0x1f, 0xff, 0x00, 0x00, 0]);

        assert_eq!(
            Cdb::read_write(6, Direction::Read, 257, 0, false, false),
            Err(CdbError::TooManyBlocks { size: 6, blocks: 257, max: 256 })
        );
        assert!(matches!(
            Cdb::read_write(6, Direction::Write, 2, 0x1f_ffff, false, false),
            Err(CdbError::AddressOutOfRange { .. })
        ));
        assert_eq!(
            Cdb::read_write(6, Direction::Write, 1, 0, true, false),
            Err(CdbError::NoCacheBits)
        );
        assert_eq!(
            Cdb::read_write(6, Direction::Read, 1, 0, false, true),
            Err(CdbError::NoCacheBits)
        );
    }

    #[test]
    fn test_ten_byte_limits() {
        assert!(Cdb::read_write(10, Direction::Read, 0xffff, 0, false, false).is_ok());
        assert!(matches!(
            Cdb::read_write(10, Direction::Read, 0x10000, 0, false, false),
            Err(CdbError::TooManyBlocks { size: 10, .. })
        ));
        assert!(matches!(
            Cdb::read_write(10, Direction::Read, 1, 1 << 32, false, false),
            Err(CdbError::AddressOutOfRange { size: 10, .. })
        ));
    }

    #[test]
    fn test_unsupported_size() {
        assert_eq!(
            Cdb::read_write(8, Direction::Read, 1, 0, false, false),
            Err(CdbError::UnsupportedSize(8))
        );
    }

    #[test]
    fn test_decode_matches_build() {
        for &(size, blocks, lba) in &[(6usize, 17u32, 300u64), (10, 128, 99), (12, 4, 7), (16, 9, 1 << 40)] {
            let cdb = Cdb::read_write(size, Direction::Write, blocks, lba, false, false).unwrap();
            let rw = Cdb::decode_read_write(cdb.as_bytes()).unwrap();
            assert_eq!(rw.direction, Direction::Write);
            assert_eq!(rw.size, size);
            assert_eq!(rw.lba, lba);
            assert_eq!(rw.blocks, blocks);
        }
        assert!(Cdb::decode_read_write(Cdb::sync_cache_10().as_bytes()).is_none());
    }

    #[test]
    fn test_debug_is_hex() {
        let cdb = Cdb::read_capacity_10();
        assert_eq!(format!("{:?}", cdb), "[25 00 00 00 00 00 00 00 00 00]");
    }
}
