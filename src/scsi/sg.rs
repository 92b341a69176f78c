//! Linux sg driver kernel ABI
//!
//! `repr(C)` mirrors of the headers and control structures exchanged with
//! `/dev/sg*`, plus the ioctl request numbers and flag bits the copy uses.
//! Layouts match `<scsi/sg.h>` and `<linux/bsg.h>` on 64-bit Linux.

use libc::{c_int, c_uchar, c_uint, c_ulong, c_ushort, c_void};

/// Default command timeout in milliseconds
pub const DEF_TIMEOUT_MS: u32 = 60_000;

/// Sense buffer handed to every command
pub const SENSE_BUFF_LEN: usize = 64;

pub const SG_DXFER_TO_DEV: c_int = -2;
pub const SG_DXFER_FROM_DEV: c_int = -3;

// Classic ioctls
pub const SG_SET_RESERVED_SIZE: c_ulong = 0x2275;
pub const SG_SET_FORCE_PACK_ID: c_ulong = 0x227b;
pub const SG_GET_VERSION_NUM: c_ulong = 0x2282;
pub const SG_IO: c_ulong = 0x2285;

// sg v4 driver ioctls
pub const SG_IOSUBMIT: c_ulong = 0xc0a0_5341;
pub const SG_IORECEIVE: c_ulong = 0xc0a0_5342;
pub const SG_IOABORT: c_ulong = 0x40a0_5343;
pub const SG_SET_GET_EXTENDED: c_ulong = 0xc060_5351;

/// Request flag bits, shared by the v3 and v4 headers
pub mod flag {
    pub const DIRECT_IO: u32 = 0x1;
    pub const MMAP_IO: u32 = 0x4;
    pub const SHARE: u32 = 0x4000;
    pub const NO_DXFER: u32 = 0x10000;
}

/// Completion `info` bits
pub mod info {
    pub const CHECK: u32 = 0x1;
    pub const DIRECT_IO_MASK: u32 = 0x6;
    pub const DIRECT_IO: u32 = 0x2;
    pub const DEVICE_DETACHING: u32 = 0x8;
    pub const ABORTED: u32 = 0x10;
}

/// `sei_wr_mask` / `sei_rd_mask` bits of [`SgExtendedInfo`]
pub mod seim {
    pub const CTL_FLAGS: u32 = 0x1;
    pub const RESERVED_SIZE: u32 = 0x4;
    pub const SHARE_FD: u32 = 0x20;
    pub const CHG_SHARE_FD: u32 = 0x40;
    pub const SGAT_ELEM_SZ: u32 = 0x80;
}

/// `ctl_flags` bits of [`SgExtendedInfo`]
pub mod ctl_flag {
    pub const MASTER_FINI: u32 = 0x100;
}

/// Oldest driver the copy talks to (4.0.00)
pub const MIN_DRIVER_VERSION: c_int = 40_000;

/// `struct sg_io_hdr`: written to submit, read back to complete
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgIoHdr {
    pub interface_id: c_int,
    pub dxfer_direction: c_int,
    pub cmd_len: c_uchar,
    pub mx_sb_len: c_uchar,
    pub iovec_count: c_ushort,
    pub dxfer_len: c_uint,
    pub dxferp: *mut c_void,
    pub cmdp: *const c_uchar,
    pub sbp: *mut c_uchar,
    pub timeout: c_uint,
    pub flags: c_uint,
    pub pack_id: c_int,
    pub usr_ptr: *mut c_void,
    pub status: c_uchar,
    pub masked_status: c_uchar,
    pub msg_status: c_uchar,
    pub sb_len_wr: c_uchar,
    pub host_status: c_ushort,
    pub driver_status: c_ushort,
    pub resid: c_int,
    pub duration: c_uint,
    pub info: c_uint,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        Self {
            interface_id: b'S' as c_int,
            dxfer_direction: 0,
            cmd_len: 0,
            mx_sb_len: 0,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: std::ptr::null_mut(),
            cmdp: std::ptr::null(),
            sbp: std::ptr::null_mut(),
            timeout: 0,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }
}

/// `struct sg_io_v4`: passed to SG_IOSUBMIT / SG_IORECEIVE / SG_IOABORT
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SgIoV4 {
    pub guard: i32,
    pub protocol: u32,
    pub subprotocol: u32,
    pub request_len: u32,
    pub request: u64,
    pub request_tag: u64,
    pub request_attr: u32,
    pub request_priority: u32,
    /// Carries the pack id on the sg v4 driver
    pub request_extra: u32,
    pub max_response_len: u32,
    pub response: u64,
    pub dout_iovec_count: u32,
    pub dout_xfer_len: u32,
    pub din_iovec_count: u32,
    pub din_xfer_len: u32,
    pub dout_xferp: u64,
    pub din_xferp: u64,
    pub timeout: u32,
    pub flags: u32,
    pub usr_ptr: u64,
    pub spare_in: u32,
    pub driver_status: u32,
    pub transport_status: u32,
    pub device_status: u32,
    pub retry_delay: u32,
    pub info: u32,
    pub duration: u32,
    pub response_len: u32,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub generated_tag: u64,
    pub spare_out: u32,
    pub padding: u32,
}

impl SgIoV4 {
    pub fn new() -> Self {
        Self {
            guard: b'Q' as i32,
            ..Default::default()
        }
    }
}

/// `struct sg_extended_info`: SG_SET_GET_EXTENDED payload
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgExtendedInfo {
    pub sei_wr_mask: u32,
    pub sei_rd_mask: u32,
    pub ctl_flags_wr_mask: u32,
    pub ctl_flags_rd_mask: u32,
    pub ctl_flags: u32,
    pub read_value: u32,
    pub reserved_sz: u32,
    pub tot_fd_thresh: u32,
    pub minor_index: u32,
    pub share_fd: u32,
    pub sgat_elem_sz: u32,
    pub pad_to_96: [u8; 52],
}

impl Default for SgExtendedInfo {
    fn default() -> Self {
        Self {
            sei_wr_mask: 0,
            sei_rd_mask: 0,
            ctl_flags_wr_mask: 0,
            ctl_flags_rd_mask: 0,
            ctl_flags: 0,
            read_value: 0,
            reserved_sz: 0,
            tot_fd_thresh: 0,
            minor_index: 0,
            share_fd: 0,
            sgat_elem_sz: 0,
            pad_to_96: [0; 52],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_abi_sizes() {
        assert_eq!(size_of::<SgIoV4>(), 160);
        assert_eq!(size_of::<SgExtendedInfo>(), 96);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(size_of::<SgIoHdr>(), 88);
    }

    #[test]
    fn test_ioctl_sizes_encoded() {
        // _IOC size field lives in bits 16..30
        assert_eq!((SG_IOSUBMIT >> 16) & 0x3fff, 160);
        assert_eq!((SG_SET_GET_EXTENDED >> 16) & 0x3fff, 96);
    }

    #[test]
    fn test_headers_carry_guards() {
        assert_eq!(SgIoHdr::default().interface_id, b'S' as c_int);
        assert_eq!(SgIoV4::new().guard, b'Q' as i32);
    }
}
