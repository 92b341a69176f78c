//! sg v4 transport: SG_IOSUBMIT / SG_IORECEIVE ioctls

use super::{retry_transient, share, Command, Completion, HandleId, Transport, Variant, ABORT_PROBE_WAIT};
use crate::scsi::sg::{SgIoV4, SG_IOABORT, SG_IORECEIVE, SG_IOSUBMIT};
use crate::scsi::Direction;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{trace, warn};

/// Talks to an sg device through the v4 submit/receive ioctls
pub struct V4Transport {
    file: Arc<File>,
}

impl V4Transport {
    pub fn new(file: Arc<File>) -> Self {
        Self { file }
    }

    fn header(cmd: &Command<'_>) -> SgIoV4 {
        let mut h = SgIoV4::new();
        h.request_len = cmd.cdb.len() as u32;
        h.request = cmd.cdb.as_bytes().as_ptr() as u64;
        match cmd.direction {
            Direction::Write => {
                h.dout_xfer_len = cmd.data_len as u32;
                h.dout_xferp = cmd.data as u64;
            }
            Direction::Read if cmd.data_len > 0 => {
                h.din_xfer_len = cmd.data_len as u32;
                h.din_xferp = cmd.data as u64;
            }
            Direction::Read => {}
        }
        h.max_response_len = cmd.sense_cap as u32;
        h.response = cmd.sense as u64;
        h.timeout = cmd.timeout_ms;
        h.usr_ptr = cmd.tag;
        h.request_extra = cmd.pack_id as u32;
        h.flags = cmd.flags;
        h
    }

    /// Give the command a millisecond; abort it if it's still in flight
    fn abort_probe(&self, h: &mut SgIoV4, pack_id: i32) {
        let mut pfd = libc::pollfd {
            fd: self.handle(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd
        let res = unsafe { libc::poll(&mut pfd, 1, ABORT_PROBE_WAIT.as_millis() as libc::c_int) };
        if res < 0 {
            warn!("poll() before abort failed: {}", io::Error::last_os_error());
        } else if res == 0 {
            // SAFETY: h is the header the command was submitted with
            let rc = unsafe { libc::ioctl(self.handle(), SG_IOABORT, h as *mut SgIoV4) };
            if rc < 0 {
                warn!("ioctl(SG_IOABORT) failed: {}", io::Error::last_os_error());
            } else {
                trace!(pack_id, "sent SG_IOABORT");
            }
        }
    }
}

impl Transport for V4Transport {
    fn variant(&self) -> Variant {
        Variant::V4
    }

    fn handle(&self) -> HandleId {
        self.file.as_raw_fd()
    }

    fn submit(&self, cmd: &Command<'_>) -> io::Result<()> {
        let mut h = Self::header(cmd);
        let fd = self.handle();
        // SAFETY: h is a valid sg_io_v4 for the duration of the call
        retry_transient(|| unsafe { libc::ioctl(fd, SG_IOSUBMIT, &mut h as *mut SgIoV4) as libc::c_long })?;
        if cmd.abort_probe {
            self.abort_probe(&mut h, cmd.pack_id);
        }
        Ok(())
    }

    fn receive(&self, cmd: &Command<'_>) -> io::Result<Completion> {
        let mut h = Self::header(cmd);
        let fd = self.handle();
        // SAFETY: h is a valid sg_io_v4 the driver fills in
        retry_transient(|| unsafe { libc::ioctl(fd, SG_IORECEIVE, &mut h as *mut SgIoV4) as libc::c_long })?;
        Ok(Completion {
            pack_id: h.request_extra as i32,
            tag: h.usr_ptr,
            device_status: h.device_status as u8,
            host_status: h.transport_status as u16,
            driver_status: h.driver_status as u16,
            sense_len: h.response_len as usize,
            resid: match cmd.direction {
                Direction::Read => h.din_resid,
                Direction::Write => h.dout_resid,
            },
            info: h.info,
            duration_ms: h.duration,
        })
    }

    fn share_from(&self, master: HandleId) -> io::Result<()> {
        share::set_share_fd(self.handle(), master)
    }

    fn swap_share(&self, to: HandleId, master_fini_clear: bool) -> io::Result<()> {
        share::change_share_fd(self.handle(), to, master_fini_clear)
    }
}
