//! sg v3 transport: `write(2)` to submit, `read(2)` to complete

use super::{retry_transient, share, Command, Completion, HandleId, Transport, Variant};
use crate::scsi::sg::{SgIoHdr, SG_DXFER_FROM_DEV, SG_DXFER_TO_DEV};
use crate::scsi::Direction;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// Talks to an sg device through the asynchronous v3 write/read interface
pub struct V3Transport {
    file: Arc<File>,
}

impl V3Transport {
    pub fn new(file: Arc<File>) -> Self {
        Self { file }
    }

    fn direction(d: Direction) -> libc::c_int {
        match d {
            Direction::Read => SG_DXFER_FROM_DEV,
            Direction::Write => SG_DXFER_TO_DEV,
        }
    }
}

impl Transport for V3Transport {
    fn variant(&self) -> Variant {
        Variant::V3
    }

    fn handle(&self) -> HandleId {
        self.file.as_raw_fd()
    }

    fn submit(&self, cmd: &Command<'_>) -> io::Result<()> {
        let hdr = SgIoHdr {
            dxfer_direction: Self::direction(cmd.direction),
            cmd_len: cmd.cdb.len() as u8,
            mx_sb_len: cmd.sense_cap.min(u8::MAX as usize) as u8,
            dxfer_len: cmd.data_len as u32,
            dxferp: cmd.data as *mut libc::c_void,
            cmdp: cmd.cdb.as_bytes().as_ptr(),
            sbp: cmd.sense,
            timeout: cmd.timeout_ms,
            flags: cmd.flags,
            pack_id: cmd.pack_id,
            usr_ptr: cmd.tag as usize as *mut libc::c_void,
            ..Default::default()
        };
        let fd = self.handle();
        // SAFETY: hdr is a valid sg_io_hdr; the driver copies it during the call
        retry_transient(|| unsafe {
            libc::write(
                fd,
                &hdr as *const SgIoHdr as *const libc::c_void,
                std::mem::size_of::<SgIoHdr>(),
            ) as libc::c_long
        })?;
        Ok(())
    }

    fn receive(&self, cmd: &Command<'_>) -> io::Result<Completion> {
        let mut hdr = SgIoHdr {
            dxfer_direction: Self::direction(cmd.direction),
            pack_id: cmd.pack_id,
            ..Default::default()
        };
        let fd = self.handle();
        // SAFETY: hdr is sized for the driver to fill in
        retry_transient(|| unsafe {
            libc::read(
                fd,
                &mut hdr as *mut SgIoHdr as *mut libc::c_void,
                std::mem::size_of::<SgIoHdr>(),
            ) as libc::c_long
        })?;
        Ok(Completion {
            pack_id: hdr.pack_id,
            tag: hdr.usr_ptr as usize as u64,
            device_status: hdr.status,
            host_status: hdr.host_status,
            driver_status: hdr.driver_status,
            sense_len: usize::from(hdr.sb_len_wr),
            resid: hdr.resid,
            info: hdr.info,
            duration_ms: hdr.duration,
        })
    }

    fn share_from(&self, master: HandleId) -> io::Result<()> {
        share::set_share_fd(self.handle(), master)
    }

    fn swap_share(&self, to: HandleId, master_fini_clear: bool) -> io::Result<()> {
        share::change_share_fd(self.handle(), to, master_fini_clear)
    }
}
