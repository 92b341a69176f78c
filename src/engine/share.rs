//! Kernel buffer sharing between a read handle and a write handle
//!
//! When both ends of a copy are sg devices the write handle can be told to
//! take its data straight from the read handle's reserve buffer. The read
//! side is the *master*, the write side the *slave*. Reads still complete
//! into the master's reserve buffer; writes are submitted with `NO_DXFER`
//! and the driver moves the data across without a trip through user space.
//!
//! A mirror output (`of2`) gets the same data by swapping the master's share
//! over to the mirror's handle for one write and back again afterwards.

use super::{HandleId, Transport};
use crate::scsi::sg::{ctl_flag, seim, SgExtendedInfo, SG_SET_GET_EXTENDED};
use std::io;
use tracing::{debug, trace, warn};

fn set_get_extended(fd: HandleId, sei: &mut SgExtendedInfo) -> io::Result<()> {
    // SAFETY: sei is a valid, fully initialised sg_extended_info
    let rc = unsafe { libc::ioctl(fd, SG_SET_GET_EXTENDED, sei as *mut SgExtendedInfo) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// SHARE_FD: make `slave_fd` take its data from `master_fd`
pub(crate) fn set_share_fd(slave_fd: HandleId, master_fd: HandleId) -> io::Result<()> {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: seim::SHARE_FD,
        sei_rd_mask: seim::SHARE_FD,
        share_fd: master_fd as u32,
        ..Default::default()
    };
    set_get_extended(slave_fd, &mut sei)
}

/// CHG_SHARE_FD: re-point `master_fd`'s share at `to_fd`
pub(crate) fn change_share_fd(master_fd: HandleId, to_fd: HandleId, master_fini_clear: bool) -> io::Result<()> {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: seim::CHG_SHARE_FD,
        sei_rd_mask: seim::CHG_SHARE_FD,
        share_fd: to_fd as u32,
        ..Default::default()
    };
    if master_fini_clear {
        sei.sei_wr_mask |= seim::CTL_FLAGS;
        sei.sei_rd_mask |= seim::CTL_FLAGS;
        sei.ctl_flags_wr_mask |= ctl_flag::MASTER_FINI;
        sei.ctl_flags &= !ctl_flag::MASTER_FINI;
    }
    set_get_extended(master_fd, &mut sei)
}

/// Set up sharing for a worker's read/write handle pair
///
/// Returns whether sharing is active. Failure isn't fatal: the worker just
/// copies through its own buffer.
pub fn prepare(write_side: &dyn Transport, read_side: &dyn Transport, worker: usize) -> bool {
    match write_side.share_from(read_side.handle()) {
        Ok(()) => {
            debug!(
                worker,
                master_fd = read_side.handle(),
                slave_fd = write_side.handle(),
                "buffer sharing established"
            );
            true
        }
        Err(e) => {
            warn!(
                worker,
                "ioctl(EXTENDED(share_fd={})) failed, not sharing: {}",
                read_side.handle(),
                e
            );
            false
        }
    }
}

/// Swap the master's share to `to`, spinning while the driver says busy
///
/// `before` marks the swap made ahead of a mirror write. Returns false when
/// the swap failed for any other reason; the caller then writes without
/// sharing.
pub fn swap(master: &dyn Transport, to: HandleId, before: bool, worker: usize) -> bool {
    let mut reported = false;
    loop {
        match master.swap_share(to, before) {
            Ok(()) => {
                trace!(worker, master_fd = master.handle(), to_fd = to, before, "share swapped");
                return true;
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                if !reported {
                    trace!(worker, "share swap busy, yielding");
                    reported = true;
                }
                std::thread::yield_now();
            }
            Err(e) => {
                warn!(
                    worker,
                    "ioctl(EXTENDED(change_shared_fd={})) failed: {}",
                    master.handle(),
                    e
                );
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBus, MockMedia};
    use std::sync::Arc;

    #[test]
    fn test_prepare_links_peers() {
        let bus = MockBus::new(crate::engine::Variant::V4);
        let a = bus.open(Arc::new(MockMedia::new(512, 8)));
        let b = bus.open(Arc::new(MockMedia::new(512, 8)));
        assert!(prepare(b.as_ref(), a.as_ref(), 0));
        assert_eq!(bus.share_peer(b.handle()), Some(a.handle()));
        assert_eq!(bus.share_peer(a.handle()), Some(b.handle()));
    }

    #[test]
    fn test_prepare_failure_is_not_fatal() {
        let bus = MockBus::new(crate::engine::Variant::V4);
        let a = bus.open(Arc::new(MockMedia::new(512, 8)));
        let b = bus.open(Arc::new(MockMedia::new(512, 8)));
        bus.close(a.handle());
        assert!(!prepare(b.as_ref(), a.as_ref(), 0));
    }

    #[test]
    fn test_swap_retries_while_busy() {
        let bus = MockBus::new(crate::engine::Variant::V4);
        let master = bus.open(Arc::new(MockMedia::new(512, 8)));
        let primary = bus.open(Arc::new(MockMedia::new(512, 8)));
        let mirror = bus.open(Arc::new(MockMedia::new(512, 8)));
        assert!(prepare(primary.as_ref(), master.as_ref(), 0));

        bus.set_swap_busy(3);
        assert!(swap(master.as_ref(), mirror.handle(), true, 0));
        assert_eq!(bus.share_peer(master.handle()), Some(mirror.handle()));
        assert_eq!(bus.swap_attempts(), 4);

        assert!(swap(master.as_ref(), primary.handle(), false, 0));
        assert_eq!(bus.share_peer(master.handle()), Some(primary.handle()));
    }
}
