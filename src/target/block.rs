//! Block device size detection
//!
//! A block device endpoint is read and written like a plain file; only its
//! capacity needs the block layer's ioctls.
//!
//! # Example
//!
//! ```no_run
//! use sgcopy::target::block::BlockGeometry;
//! use std::fs::File;
//!
//! // Note: Requires read permission on the device
//! let dev = File::open("/dev/sdb").unwrap();
//! let geo = BlockGeometry::detect(&dev, "/dev/sdb".as_ref()).unwrap();
//! println!("{} sectors of {} bytes", geo.sectors(), geo.sector_size);
//! ```

use crate::Result;
use anyhow::Context;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

// ioctl request code for getting block device size
const BLKGETSIZE64: libc::c_ulong = 0x80081272;
// ioctl request code for getting the logical sector size
const BLKSSZGET: libc::c_ulong = 0x1268;

/// Size of a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// Device size in bytes
    pub size: u64,
    /// Logical sector size in bytes
    pub sector_size: u32,
}

impl BlockGeometry {
    /// Query sector size and byte size of an open block device
    pub fn detect(file: &File, path: &Path) -> Result<Self> {
        let fd = file.as_raw_fd();

        let mut sector_size: libc::c_int = 0;
        let result = unsafe { libc::ioctl(fd, BLKSSZGET, &mut sector_size) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("ioctl(BLKSSZGET) failed: path={}", path.display()));
        }

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("ioctl(BLKGETSIZE64) failed: path={}", path.display()));
        }

        Ok(Self {
            size,
            sector_size: sector_size.max(0) as u32,
        })
    }

    pub fn sectors(&self) -> u64 {
        if self.sector_size == 0 {
            0
        } else {
            self.size / u64::from(self.sector_size)
        }
    }

    /// Blocks of `bs` bytes, if `bs` matches the sector size
    pub fn blocks_of(&self, bs: usize) -> Option<u64> {
        if self.sector_size as usize == bs {
            Some(self.sectors())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_blocks_of_requires_matching_sector_size() {
        let geo = BlockGeometry {
            size: 1 << 20,
            sector_size: 512,
        };
        assert_eq!(geo.sectors(), 2048);
        assert_eq!(geo.blocks_of(512), Some(2048));
        assert_eq!(geo.blocks_of(4096), None);
    }

    #[test]
    fn test_detect_on_regular_file_fails() {
        let tmp = NamedTempFile::new().unwrap();
        let err = BlockGeometry::detect(tmp.as_file(), tmp.path()).unwrap_err();
        assert!(err.to_string().contains("BLKSSZGET"));
    }
}
