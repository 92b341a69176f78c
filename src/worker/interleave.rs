//! Interleaved device copy (`oflag=swait`)
//!
//! The read and the write of a segment are both queued while the read lock
//! is held, the lock is dropped and the write is completed before the
//! read. The shared reserve buffer lets the driver hold the write until the
//! read's data is there, so the write doesn't wait out the read's
//! completion latency in user space.
//!
//! A retry resubmits only the side that failed. A read that has to be
//! retried, or whose data is replaced by zeros, leaves whatever the write
//! already took stale, so the write is queued once more after the read
//! finally completes. A rewrite of zeros goes from the user buffer.

use super::segment::{Outcome, SegmentState};
use super::{Pending, Side, Worker};
use crate::coordinator::ReadSide;
use crate::error::CopyError;
use crate::scsi::Disposition;
use std::sync::MutexGuard;
use tracing::{debug, warn};

/// Entered holding the read lock with the segment claimed
pub(super) fn run<'a>(w: &mut Worker<'a>, rd: MutexGuard<'a, ReadSide>) -> Result<(), CopyError> {
    let coll = w.coll;
    let in_coe = coll.cfg.in_flags.coe;
    let out_coe = coll.cfg.out_flags.coe;
    let share = w.has_share;
    let blocks = u64::from(w.num_blks);

    let mut read_state = SegmentState::Allocated;
    let mut write_state = SegmentState::ReadDone;
    let mut read: Option<Pending> = Some(w.start_io(Side::In, share)?);
    read_state = read_state.submit();
    let mut write: Option<Pending> = Some(w.start_io(Side::Out, share)?);
    write_state = write_state.submit();
    drop(rd);

    let mut write_stale = false;
    let mut write_counted = false;
    loop {
        if let Some(p) = write.take() {
            let disposition = w.finish_io(&p)?;
            let (next, outcome) = write_state.complete(disposition, out_coe);
            write_state = next;
            match outcome {
                Outcome::Resubmit => {
                    let _rd = coll.lock_read();
                    write = Some(w.start_io(Side::Out, w.write_shares())?);
                    write_state = write_state.submit();
                }
                Outcome::Done { .. } => {
                    if disposition == Disposition::MediumHard {
                        warn!(worker = w.id, ">> ignored error for out blk={} for {} bytes", w.oblk, w.data_len());
                    }
                    if !write_counted {
                        let mut wr = coll.lock_write();
                        wr.rem_count = wr.rem_count.saturating_sub(blocks);
                        write_counted = true;
                    }
                }
                Outcome::Abort(cat) => return Err(CopyError::Device(cat)),
            }
        }

        if let Some(p) = read.take() {
            let disposition = w.finish_io(&p)?;
            let (next, outcome) = read_state.complete(disposition, in_coe);
            read_state = next;
            match outcome {
                Outcome::Resubmit => {
                    let _rd = coll.lock_read();
                    read = Some(w.start_io(Side::In, share)?);
                    read_state = read_state.submit();
                    write_stale = true;
                }
                Outcome::Done { zero_fill, .. } => {
                    if zero_fill {
                        w.zero_fill();
                        write_stale = true;
                    }
                    let mut rd = coll.lock_read();
                    rd.rem_count = rd.rem_count.saturating_sub(blocks);
                }
                Outcome::Abort(cat) => return Err(CopyError::Device(cat)),
            }
        }

        if read.is_none() && write.is_none() {
            if !write_stale {
                break;
            }
            debug!(worker = w.id, oblk = w.oblk, "segment data changed after its write, writing again");
            write_stale = false;
            let _rd = coll.lock_read();
            write = Some(w.start_io(Side::Out, w.write_shares())?);
            write_state = SegmentState::WriteSubmitted;
        }
    }
    w.state = SegmentState::WriteDone;
    Ok(())
}
