//! SCSI generic device endpoints
//!
//! Opens sg handles and prepares them for the copy, and runs the few
//! housekeeping commands the copy needs outside the segment loop.
//!
//! # Preparation
//!
//! Every handle, whether the shared one or one a worker opens for itself,
//! goes through the same steps:
//!
//! 1. Open read/write, adding O_DIRECT / O_EXCL / O_SYNC per the flags
//! 2. Check the driver is at least version 4.0.00
//! 3. Set the scatter-gather element size when one was asked for
//! 4. Size the reserve buffer to one segment (unless `defres`)
//! 5. Optionally mmap the reserve buffer
//! 6. Turn on forced pack-id matching
//!
//! # Example
//!
//! ```no_run
//! use sgcopy::config::FlagSet;
//! use sgcopy::engine::Variant;
//! use sgcopy::target::device::{read_capacity, SgOpener};
//! use sgcopy::target::DeviceOpener;
//!
//! let opener = SgOpener::new("/dev/sg1".into(), FlagSet::default(), 512 * 128, 0, Variant::V3);
//! let dev = opener.open(None).unwrap();
//! let cap = read_capacity(dev.transport.as_ref(), 1).unwrap();
//! println!("{} blocks of {} bytes", cap.blocks, cap.block_size);
//! ```

use super::{DeviceOpener, OpenedDevice};
use crate::config::FlagSet;
use crate::engine::v3::V3Transport;
use crate::engine::v4::V4Transport;
use crate::engine::{Command, Transport, Variant};
use crate::error::CopyError;
use crate::scsi::sense::SenseCategory;
use crate::scsi::sg::{
    seim, SgExtendedInfo, DEF_TIMEOUT_MS, MIN_DRIVER_VERSION, SENSE_BUFF_LEN, SG_GET_VERSION_NUM,
    SG_SET_FORCE_PACK_ID, SG_SET_GET_EXTENDED, SG_SET_RESERVED_SIZE,
};
use crate::scsi::{Cdb, Direction};
use crate::util::buffer::MappedRegion;
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const RCAP10_REPLY_LEN: usize = 8;
const RCAP16_REPLY_LEN: usize = 32;

/// Opens handles onto one sg device
pub struct SgOpener {
    path: PathBuf,
    flags: FlagSet,
    reserve_len: usize,
    elem_sz: usize,
    variant: Variant,
}

impl SgOpener {
    pub fn new(path: PathBuf, flags: FlagSet, reserve_len: usize, elem_sz: usize, variant: Variant) -> Self {
        Self {
            path,
            flags,
            reserve_len,
            elem_sz,
            variant,
        }
    }

    fn ioctl_int(&self, file: &File, request: libc::c_ulong, value: &mut libc::c_int, what: &str) -> Result<()> {
        // SAFETY: request takes a pointer to an int
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, value as *mut libc::c_int) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(err).context(format!("ioctl({}) failed: path={}", what, self.path.display()));
        }
        Ok(())
    }

    fn prepare_resbuf(&self, file: &File) -> Result<()> {
        let mut version: libc::c_int = 0;
        if let Err(e) = self.ioctl_int(file, SG_GET_VERSION_NUM, &mut version, "SG_GET_VERSION_NUM") {
            let errno = e
                .downcast_ref::<io::Error>()
                .and_then(io::Error::raw_os_error)
                .unwrap_or(libc::ENOTTY);
            return Err(CopyError::file(&self.path, io::Error::from_raw_os_error(errno)))
                .context("not an sg device, unable to read the driver version");
        }
        if version < MIN_DRIVER_VERSION {
            return Err(CopyError::file(
                &self.path,
                io::Error::new(io::ErrorKind::Unsupported, "sg driver prior to 4.0.00"),
            )
            .into());
        }

        if self.elem_sz >= 4096 {
            let mut sei = SgExtendedInfo {
                sei_rd_mask: seim::SGAT_ELEM_SZ,
                ..Default::default()
            };
            self.extended(file, &mut sei, "SGAT_ELEM_SZ")?;
            if sei.sgat_elem_sz as usize != self.elem_sz {
                let mut sei = SgExtendedInfo {
                    sei_wr_mask: seim::SGAT_ELEM_SZ,
                    sgat_elem_sz: self.elem_sz as u32,
                    ..Default::default()
                };
                self.extended(file, &mut sei, "SGAT_ELEM_SZ")?;
                debug!(path = %self.path.display(), elem_sz = self.elem_sz, "scatter-gather element size set");
            }
        }

        if !self.flags.defres {
            let mut len = libc::c_int::try_from(self.reserve_len)
                .map_err(|_| CopyError::Other(format!("reserve buffer of {} bytes too large", self.reserve_len)))?;
            self.ioctl_int(file, SG_SET_RESERVED_SIZE, &mut len, "SG_SET_RESERVED_SIZE")?;
        }

        let mut one: libc::c_int = 1;
        self.ioctl_int(file, SG_SET_FORCE_PACK_ID, &mut one, "SG_SET_FORCE_PACK_ID")?;
        Ok(())
    }

    fn extended(&self, file: &File, sei: &mut SgExtendedInfo, what: &str) -> Result<()> {
        // SAFETY: sei is a valid, fully initialised sg_extended_info
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), SG_SET_GET_EXTENDED, sei as *mut SgExtendedInfo) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(err).context(format!("ioctl(EXTENDED({})) failed: path={}", what, self.path.display()));
        }
        Ok(())
    }
}

impl DeviceOpener for SgOpener {
    fn open(&self, mmap_len: Option<usize>) -> Result<OpenedDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(self.flags.open_flags())
            .open(&self.path)
            .map_err(|e| CopyError::file(&self.path, e))?;
        self.prepare_resbuf(&file)?;

        let mapping = match mmap_len {
            Some(len) => Some(
                MappedRegion::map_fd(file.as_raw_fd(), len)
                    .map_err(|e| CopyError::file(&self.path, e))
                    .context("mmap() of the reserve buffer failed")?,
            ),
            None => None,
        };

        let file = Arc::new(file);
        let transport: Arc<dyn Transport> = match self.variant {
            Variant::V3 => Arc::new(V3Transport::new(file)),
            Variant::V4 => Arc::new(V4Transport::new(file)),
        };
        debug!(
            path = %self.path.display(),
            fd = transport.handle(),
            variant = self.variant.as_str(),
            mmap = mapping.is_some(),
            "sg handle opened"
        );
        Ok(OpenedDevice { transport, mapping })
    }

    fn describe(&self) -> String {
        format!("{} (sg {})", self.path.display(), self.variant.as_str())
    }
}

/// Size reported by READ CAPACITY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub blocks: u64,
    pub block_size: u32,
}

/// Run a data-in housekeeping command, retrying once on unit attention
fn data_in(t: &dyn Transport, cdb: &Cdb, reply: &mut [u8], pack_id: i32) -> Result<()> {
    let mut sense = [0u8; SENSE_BUFF_LEN];
    let mut attempts = 0;
    loop {
        attempts += 1;
        let cmd = Command {
            cdb,
            direction: Direction::Read,
            data: if reply.is_empty() { std::ptr::null_mut() } else { reply.as_mut_ptr() },
            data_len: reply.len(),
            sense: sense.as_mut_ptr(),
            sense_cap: sense.len(),
            pack_id,
            tag: pack_id as u64,
            flags: 0,
            timeout_ms: DEF_TIMEOUT_MS,
            abort_probe: false,
        };
        let done = t.execute(&cmd).context(format!("{:?} failed", cdb))?;
        match done.category(&sense) {
            SenseCategory::Clean | SenseCategory::Recovered => return Ok(()),
            SenseCategory::UnitAttention if attempts == 1 => {
                info!("unit attention on {:?}, trying again", cdb);
            }
            cat => return Err(CopyError::Device(cat).into()),
        }
    }
}

/// READ CAPACITY(10), falling back to (16) for devices too big for it
pub fn read_capacity(t: &dyn Transport, pack_id: i32) -> Result<Capacity> {
    let mut reply = [0u8; RCAP10_REPLY_LEN];
    data_in(t, &Cdb::read_capacity_10(), &mut reply, pack_id)?;
    let last_lba = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
    let block_size = u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]]);
    if last_lba != u32::MAX {
        return Ok(Capacity {
            blocks: u64::from(last_lba) + 1,
            block_size,
        });
    }

    let mut reply = [0u8; RCAP16_REPLY_LEN];
    data_in(t, &Cdb::read_capacity_16(RCAP16_REPLY_LEN as u32), &mut reply, pack_id)?;
    let mut lba = [0u8; 8];
    lba.copy_from_slice(&reply[0..8]);
    Ok(Capacity {
        blocks: u64::from_be_bytes(lba) + 1,
        block_size: u32::from_be_bytes([reply[8], reply[9], reply[10], reply[11]]),
    })
}

/// SYNCHRONIZE CACHE(10) over the whole device
pub fn sync_cache(t: &dyn Transport, pack_id: i32) -> Result<()> {
    data_in(t, &Cdb::sync_cache_10(), &mut [], pack_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBus, MockMedia};

    #[test]
    fn test_read_capacity_10() {
        let bus = MockBus::new(Variant::V3);
        let dev = bus.open(Arc::new(MockMedia::new(512, 2048)));
        let cap = read_capacity(dev.as_ref(), 1).unwrap();
        assert_eq!(cap, Capacity { blocks: 2048, block_size: 512 });
    }

    #[test]
    fn test_sync_cache() {
        let bus = MockBus::new(Variant::V3);
        let dev = bus.open(Arc::new(MockMedia::new(512, 8)));
        sync_cache(dev.as_ref(), 3).unwrap();
        assert_eq!(bus.commands()[0].opcode, 0x35);
    }

    #[test]
    fn test_missing_device_is_file_error() {
        let opener = SgOpener::new(
            PathBuf::from("/nonexistent/sg99"),
            FlagSet::default(),
            65536,
            0,
            Variant::V3,
        );
        let err = match opener.open(None) {
            Ok(_) => panic!("opened a device that doesn't exist"),
            Err(e) => e,
        };
        assert_eq!(crate::error::exit_status_of(&err), 15);
        assert!(opener.describe().contains("sg v3"));
    }

    #[test]
    fn test_version_ioctl_failure_keeps_errno() {
        let plain = tempfile::NamedTempFile::new().unwrap();
        let opener = SgOpener::new(plain.path().to_path_buf(), FlagSet::default(), 65536, 0, Variant::V3);
        let err = match opener.open(None) {
            Ok(_) => panic!("a regular file passed as an sg device"),
            Err(e) => e,
        };
        assert_eq!(crate::error::exit_status_of(&err), 15);
        let errno = err
            .chain()
            .find_map(|e| e.downcast_ref::<io::Error>())
            .and_then(io::Error::raw_os_error);
        assert_eq!(errno, Some(libc::ENOTTY));
        assert!(!format!("{:#}", err).contains("prior to 4.0.00"));
    }
}
