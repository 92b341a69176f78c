//! Command transports
//!
//! A [`Transport`] carries one SCSI command to an sg device and brings its
//! completion back. The Linux sg driver offers two ways to do that:
//!
//! - **v3**: `write(2)` an `sg_io_hdr` to submit, `read(2)` one back to
//!   complete ([`v3::V3Transport`])
//! - **v4**: `SG_IOSUBMIT` / `SG_IORECEIVE` ioctls carrying an `sg_io_v4`,
//!   with an `SG_IOABORT` path ([`v4::V4Transport`])
//!
//! Workers pick a transport per direction when they open their handles and
//! from then on only talk to the trait. The [`mock`] transport stands in for
//! a real device in tests.
//!
//! # Correlation
//!
//! Every submission carries a pack id from the process-wide generator and an
//! opaque tag. Handles are opened with forced pack-id matching so the
//! driver hands back the completion for the pack id asked for; the tag is
//! checked on top of that and a mismatch is a protocol violation.
//!
//! # Thread Safety
//!
//! Transports are `Send + Sync`. A handle opened once and shared by every
//! worker (`same_fds`) is used concurrently, each worker receiving only its
//! own pack id.

pub mod mock;
pub mod share;
pub mod sync;
pub mod v3;
pub mod v4;

use crate::scsi::sense::{categorize, SenseCategory};
use crate::scsi::sg::info;
use crate::scsi::{Cdb, Direction};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Identifies a device handle to the sharing ioctls
pub type HandleId = RawFd;

/// Which sg interface a transport speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    V3,
    V4,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::V3 => "v3",
            Variant::V4 => "v4",
        }
    }
}

/// How long the v4 abort probe waits for a completion before aborting
pub const ABORT_PROBE_WAIT: Duration = Duration::from_millis(1);

/// One command ready for submission
///
/// The pointers belong to the submitting worker and must stay valid until
/// the matching [`Transport::receive`] returns.
#[derive(Debug)]
pub struct Command<'a> {
    pub cdb: &'a Cdb,
    pub direction: Direction,
    /// Data buffer; ignored by the driver when `flags` has NO_DXFER
    pub data: *mut u8,
    pub data_len: usize,
    /// Sense buffer the driver fills on CHECK CONDITION
    pub sense: *mut u8,
    pub sense_cap: usize,
    pub pack_id: i32,
    pub tag: u64,
    /// `sg::flag` bits
    pub flags: u32,
    pub timeout_ms: u32,
    /// Poll briefly after submission and abort if still in flight (v4 only)
    pub abort_probe: bool,
}

/// What the driver reported for a completed command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub pack_id: i32,
    pub tag: u64,
    pub device_status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    /// Bytes of sense data written
    pub sense_len: usize,
    /// Bytes requested but not transferred
    pub resid: i32,
    /// `sg::info` bits
    pub info: u32,
    pub duration_ms: u32,
}

impl Completion {
    /// Classify against the sense bytes the driver wrote
    pub fn category(&self, sense: &[u8]) -> SenseCategory {
        let len = self.sense_len.min(sense.len());
        categorize(self.device_status, self.host_status, self.driver_status, &sense[..len])
    }

    /// True when direct IO was asked for but the driver fell back to indirect
    pub fn direct_io_incomplete(&self) -> bool {
        (self.info & info::DIRECT_IO_MASK) != info::DIRECT_IO
    }
}

/// A device handle that accepts SCSI commands
pub trait Transport: Send + Sync {
    fn variant(&self) -> Variant;

    /// Handle id other handles name when sharing with this one
    fn handle(&self) -> HandleId;

    /// Queue a command
    ///
    /// Transient interruptions (EINTR, EAGAIN) are retried internally. An
    /// `ENOMEM` error means the driver couldn't allocate for the request.
    fn submit(&self, cmd: &Command<'_>) -> io::Result<()>;

    /// Wait for the completion of the command with `cmd.pack_id`
    fn receive(&self, cmd: &Command<'_>) -> io::Result<Completion>;

    /// Make this (write side) handle take its data from `master`'s reserve
    /// buffer
    fn share_from(&self, master: HandleId) -> io::Result<()>;

    /// Re-point this (read side, master) handle's share at `to`
    ///
    /// `master_fini_clear` puts the master in the swap state used before a
    /// mirror write. Returns `EBUSY` while a transfer is in progress.
    fn swap_share(&self, to: HandleId, master_fini_clear: bool) -> io::Result<()>;

    /// Submit and wait
    fn execute(&self, cmd: &Command<'_>) -> io::Result<Completion> {
        self.submit(cmd)?;
        self.receive(cmd)
    }
}

/// Retry a syscall while it reports EINTR or EAGAIN, yielding in between
pub(crate) fn retry_transient<F>(mut call: F) -> io::Result<libc::c_long>
where
    F: FnMut() -> libc::c_long,
{
    loop {
        let res = call();
        if res >= 0 {
            return Ok(res);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => std::thread::yield_now(),
            _ => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sense::{key, status, SenseData};

    #[test]
    fn test_completion_category_honours_sense_len() {
        let sb = SenseData::fixed(key::MEDIUM_ERROR, 0x11, 0);
        let mut c = Completion {
            device_status: status::CHECK_CONDITION,
            sense_len: sb.len(),
            ..Default::default()
        };
        assert_eq!(c.category(&sb), SenseCategory::MediumHard);
        c.sense_len = 0;
        assert_eq!(c.category(&sb), SenseCategory::UnknownSense);
    }

    #[test]
    fn test_direct_io_incomplete() {
        let mut c = Completion::default();
        assert!(c.direct_io_incomplete());
        c.info = info::DIRECT_IO;
        assert!(!c.direct_io_incomplete());
        c.info = info::DIRECT_IO_MASK;
        assert!(c.direct_io_incomplete());
    }

    #[test]
    fn test_retry_transient_passes_through_errors() {
        let mut calls = 0;
        let res = retry_transient(|| {
            calls += 1;
            unsafe { *libc::__errno_location() = if calls < 3 { libc::EINTR } else { libc::EBADF } };
            -1
        });
        assert_eq!(calls, 3);
        assert_eq!(res.unwrap_err().raw_os_error(), Some(libc::EBADF));
    }
}
