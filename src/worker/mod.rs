//! Copy workers
//!
//! A [`Worker`] moves one segment at a time from the input to the outputs.
//! Each segment is read while holding the read lock only as long as it
//! takes to claim the segment and submit the command, so reads from
//! several workers overlap. The write half then waits on the write
//! condition variable until the write cursor reaches the segment, which
//! puts the outputs back into address order.
//!
//! # Handles
//!
//! Unless `same_fds` is given every worker opens its own handles onto each
//! sg device. When both ends are sg devices the write handle shares the
//! read handle's reserve buffer, so the data never passes through user
//! space. With `mmap` the worker's buffer is the mapped reserve buffer of
//! the side that asked for it.
//!
//! # Failure
//!
//! Errors don't unwind past the segment loop. The worker records the exit
//! status, stops both directions, wakes everyone waiting on the write
//! cursor and leaves.

pub mod interleave;
pub mod pool;
pub mod segment;

use crate::coordinator::{Collection, ReadSide, WriteSide};
use crate::engine::sync::{write_full, Position};
use crate::engine::{share, Command, Transport, Variant};
use crate::error::{exit, CopyError};
use crate::scsi::sg::flag;
use crate::scsi::{Cdb, Direction, Disposition};
use crate::target::file::FileEndpoint;
use crate::target::{DeviceEndpoint, Endpoint};
use crate::util::buffer::{AlignedBuffer, MappedRegion, SegmentBuffer};
use crate::Result;
use anyhow::Context;
use segment::{Outcome, SegmentState};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, error, trace, warn};

/// Sense bytes kept per command
const SENSE_LEN: usize = 64;

/// Command timeout handed to the driver
const DEF_TIMEOUT_MS: u32 = 60_000;

/// Which handle a command goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    In,
    Out,
    Mirror,
}

/// A submitted command awaiting completion
#[derive(Debug)]
struct Pending {
    cdb: Cdb,
    side: Side,
    direction: Direction,
    lba: u64,
    pack_id: i32,
    tag: u64,
    flags: u32,
    data_len: usize,
    abort_probe: bool,
}

/// What the segment loop does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Stops the whole copy if a worker panics
struct StopOnPanic<'a>(&'a Collection);

impl Drop for StopOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.exit.record(exit::OTHER);
            self.0.stop_both();
            self.0.settle();
        }
    }
}

/// One copy thread and the handles and buffer it owns
pub struct Worker<'a> {
    id: usize,
    coll: &'a Collection,
    input: Option<Arc<dyn Transport>>,
    output: Option<Arc<dyn Transport>>,
    mirror: Option<Arc<dyn Transport>>,
    buffer: SegmentBuffer,
    sense_rd: [u8; SENSE_LEN],
    sense_wr: [u8; SENSE_LEN],
    /// Absolute input block of the current segment
    iblk: u64,
    /// Absolute output block of the current segment
    oblk: u64,
    num_blks: u32,
    state: SegmentState,
    has_share: bool,
    swait: bool,
    /// The segment's data was replaced in the user buffer, so the shared
    /// reserve buffer no longer holds what must be written
    substituted: bool,
    /// Commands completed so far; the abort probe leaves the first alone
    rep_count: u32,
    tag: u64,
}

fn open_side(
    dev: &DeviceEndpoint,
    worker: usize,
    same_fds: bool,
    mmap_len: Option<usize>,
    mapping: &mut Option<MappedRegion>,
) -> Result<Arc<dyn Transport>> {
    if same_fds {
        debug!(worker, "using global handle for {}", dev.name());
        return Ok(dev.shared().clone());
    }
    let opened = dev
        .open_handle(mmap_len)
        .with_context(|| format!("worker {} opening {}", worker, dev.name()))?;
    if let Some(m) = opened.mapping {
        *mapping = Some(m);
    }
    debug!(worker, handle = opened.transport.handle(), "opened local handle for {}", dev.name());
    Ok(opened.transport)
}

impl<'a> Worker<'a> {
    /// Open the worker's handles and buffer and set up sharing
    pub fn new(id: usize, coll: &'a Collection) -> Result<Self> {
        let cfg = &coll.cfg;
        let endpoints = &coll.endpoints;
        let same_fds = cfg.in_flags.same_fds || cfg.out_flags.same_fds;
        let seg_len = cfg.segment_bytes();
        let mut mapping = None;

        let input = match endpoints.input.as_device() {
            Some(dev) => Some(open_side(dev, id, same_fds, cfg.in_flags.mmap.then_some(seg_len), &mut mapping)?),
            None => None,
        };
        let output = match endpoints.output.as_device() {
            Some(dev) => Some(open_side(dev, id, same_fds, cfg.out_flags.mmap.then_some(seg_len), &mut mapping)?),
            None => None,
        };
        let mirror = match endpoints.mirror.as_ref().and_then(Endpoint::as_device) {
            Some(dev) => Some(open_side(dev, id, same_fds, None, &mut None)?),
            None => None,
        };

        let buffer = match mapping {
            Some(m) => SegmentBuffer::Mapped(m),
            None => SegmentBuffer::Owned(
                AlignedBuffer::new(seg_len, page_size()).context("out of memory creating user buffers")?,
            ),
        };

        let noshare = cfg.in_flags.noshare || cfg.out_flags.noshare;
        let has_share = match (&input, &output) {
            (Some(_), Some(_)) if noshare => {
                debug!(worker = id, "skipping share on both sides");
                false
            }
            (Some(_), Some(_)) if same_fds => {
                debug!(worker = id, "global handles in use, not sharing");
                false
            }
            (Some(i), Some(o)) => share::prepare(o.as_ref(), i.as_ref(), id),
            _ => false,
        };

        let mut swait = false;
        if cfg.out_flags.swait {
            let why = if same_fds {
                Some("because same_fds flag given")
            } else if input.is_none() || output.is_none() {
                Some("since need both IFILE and OFILE to be sg devices")
            } else if endpoints.mirror.is_some() {
                Some("when of2 is given")
            } else if !has_share {
                Some("without buffer sharing")
            } else {
                None
            };
            match why {
                Some(why) if id == 0 => warn!("oflag=swait ignored {}", why),
                Some(_) => {}
                None => swait = true,
            }
        }
        debug!(worker = id, has_share, swait, mapped = buffer.is_mapped(), "worker ready");

        Ok(Self {
            id,
            coll,
            input,
            output,
            mirror,
            buffer,
            sense_rd: [0; SENSE_LEN],
            sense_wr: [0; SENSE_LEN],
            iblk: 0,
            oblk: 0,
            num_blks: 0,
            state: SegmentState::Allocated,
            has_share,
            swait,
            substituted: false,
            rep_count: 0,
            tag: id as u64 + 1,
        })
    }

    /// Copy segments until the work runs out or the copy stops
    pub fn run(mut self) {
        let coll = self.coll;
        let _stop_on_panic = StopOnPanic(coll);
        let mut settled = false;
        loop {
            let flow = self.segment();
            if !settled && self.id == 0 {
                coll.settle();
                settled = true;
            }
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    error!(worker = self.id, "tid={}: {}", self.id, e);
                    coll.fail(&e);
                    break;
                }
            }
        }
        coll.stop_read();
        coll.settle();

        let id = self.id;
        if let Err(e) = self.buffer.release() {
            warn!(worker = id, "releasing segment buffer failed: {}", e);
        }
    }

    /// Read then write one segment
    fn segment(&mut self) -> std::result::Result<Flow, CopyError> {
        let coll = self.coll;
        let cfg = &coll.cfg;
        let bpt = u32::try_from(cfg.bpt).unwrap_or(u32::MAX);

        let mut rd = coll.lock_read();
        if rd.stop || rd.count == 0 {
            return Ok(Flow::Stop);
        }
        let seg = match coll.cursor.acquire(bpt) {
            Some(seg) => seg,
            None => return Ok(Flow::Stop),
        };
        let blocks = u64::from(seg.blocks);
        self.iblk = cfg.skip + seg.index;
        self.oblk = cfg.seek + seg.index;
        self.num_blks = seg.blocks;
        self.state = SegmentState::Allocated;
        self.substituted = false;
        rd.count = rd.count.saturating_sub(blocks);
        trace!(worker = self.id, iblk = self.iblk, oblk = self.oblk, blocks, "segment claimed");

        let mut stop_after_write = false;
        match &coll.endpoints.input {
            Endpoint::Device(_) if self.swait => interleave::run(self, rd)?,
            Endpoint::Device(_) => self.read_device(rd)?,
            Endpoint::File(f) => {
                stop_after_write = self.read_file(&mut rd, f)?;
                drop(rd);
                self.state = SegmentState::ReadDone;
            }
            Endpoint::Discard => {
                self.buffer.zero(self.data_len());
                rd.rem_count = rd.rem_count.saturating_sub(blocks);
                drop(rd);
                self.state = SegmentState::ReadDone;
            }
        }
        self.rep_count += 1;

        let flow = self.write_half(blocks, stop_after_write)?;
        if flow == Flow::Continue {
            self.write_mirror()?;
        }
        coll.broadcast();
        if stop_after_write {
            return Ok(Flow::Stop);
        }
        Ok(flow)
    }

    fn data_len(&self) -> usize {
        self.num_blks as usize * self.coll.cfg.bs
    }

    /// Writes take their data from the peer's reserve buffer
    fn write_shares(&self) -> bool {
        self.has_share && !self.substituted
    }

    /// The read must land in user space as well as the reserve buffer
    fn keeps_user_copy(&self) -> bool {
        let e = &self.coll.endpoints;
        e.record.is_some() || matches!(e.mirror, Some(Endpoint::File(_)))
    }

    fn transport(&self, side: Side) -> std::result::Result<Arc<dyn Transport>, CopyError> {
        let t = match side {
            Side::In => self.input.as_ref(),
            Side::Out => self.output.as_ref(),
            Side::Mirror => self.mirror.as_ref(),
        };
        t.cloned()
            .ok_or_else(|| CopyError::Other(format!("tid={}: no sg handle for {:?} side", self.id, side)))
    }

    fn command_flags(&self, side: Side, share: bool) -> u32 {
        let cfg = &self.coll.cfg;
        let flags = if side == Side::In { &cfg.in_flags } else { &cfg.out_flags };
        let mut f = 0;
        if flags.mmap && side != Side::Mirror {
            f |= flag::MMAP_IO;
        }
        if flags.noxfer {
            f |= flag::NO_DXFER;
        }
        if flags.dio {
            f |= flag::DIRECT_IO;
        }
        if share {
            f |= flag::SHARE;
            if side != Side::In || !self.keeps_user_copy() {
                f |= flag::NO_DXFER;
            }
        }
        f
    }

    fn command<'p>(&mut self, p: &'p Pending) -> Command<'p> {
        let sense = match p.side {
            Side::In => self.sense_rd.as_mut_ptr(),
            Side::Out | Side::Mirror => self.sense_wr.as_mut_ptr(),
        };
        Command {
            cdb: &p.cdb,
            direction: p.direction,
            data: self.buffer.as_mut_ptr(),
            data_len: p.data_len,
            sense,
            sense_cap: SENSE_LEN,
            pack_id: p.pack_id,
            tag: p.tag,
            flags: p.flags,
            timeout_ms: DEF_TIMEOUT_MS,
            abort_probe: p.abort_probe,
        }
    }

    /// Build and submit the current segment's command on one side
    fn start_io(&mut self, side: Side, share: bool) -> std::result::Result<Pending, CopyError> {
        let coll = self.coll;
        let cfg = &coll.cfg;
        let t = self.transport(side)?;
        let (direction, cdbsz, lba, flags) = match side {
            Side::In => (Direction::Read, cfg.cdbsz_in, self.iblk, &cfg.in_flags),
            Side::Out | Side::Mirror => (Direction::Write, cfg.cdbsz_out, self.oblk, &cfg.out_flags),
        };
        let cdb = Cdb::read_write(cdbsz, direction, self.num_blks, lba, flags.fua, flags.dpo)
            .map_err(|e| CopyError::Syntax(format!("{} cdb: {}", direction.as_str(), e)))?;
        let pack_id = coll.pack_ids.next();
        let aen = cfg.aen;
        let pending = Pending {
            cdb,
            side,
            direction,
            lba,
            pack_id,
            tag: self.tag,
            flags: self.command_flags(side, share),
            data_len: self.data_len(),
            abort_probe: t.variant() == Variant::V4 && aen > 0 && self.rep_count > 0 && pack_id as u32 % aen == 0,
        };
        trace!(
            worker = self.id,
            pack_id,
            cdb = ?pending.cdb,
            flags = format_args!("{:#x}", pending.flags),
            abort_probe = pending.abort_probe,
            "{} submit",
            direction.as_str()
        );

        let cmd = self.command(&pending);
        t.submit(&cmd).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOMEM) {
                CopyError::OutOfMemory(format!("sg starting {} command", direction.as_str()))
            } else {
                CopyError::Other(format!("{} to sg failed, blk={}: {}", direction.as_str(), lba, e))
            }
        })?;
        Ok(pending)
    }

    /// Wait for a submitted command and classify its completion
    fn finish_io(&mut self, p: &Pending) -> std::result::Result<Disposition, CopyError> {
        let t = self.transport(p.side)?;
        let cmd = self.command(p);
        let done = t.receive(&cmd).map_err(|e| {
            CopyError::Other(format!("finishing {} command, blk={}: {}", p.direction.as_str(), p.lba, e))
        })?;
        if done.pack_id != p.pack_id || done.tag != p.tag {
            return Err(CopyError::ProtocolMismatch {
                expected: p.pack_id,
                got: done.pack_id,
            });
        }

        let sense = match p.side {
            Side::In => &self.sense_rd[..],
            Side::Out | Side::Mirror => &self.sense_wr[..],
        };
        let category = done.category(sense);
        let disposition = Disposition::from(category);
        match disposition {
            Disposition::ProceedWithWarning => {
                warn!(worker = self.id, "recovered error on {} blk={}, continuing", p.direction.as_str(), p.lba)
            }
            Disposition::Retry => debug!(worker = self.id, pack_id = p.pack_id, "{}, resubmitting", category),
            _ => {}
        }
        if matches!(
            disposition,
            Disposition::Proceed | Disposition::ProceedWithWarning | Disposition::MediumHard
        ) {
            let dio_incomplete = p.flags & flag::DIRECT_IO != 0 && done.direct_io_incomplete();
            self.coll.add_diagnostics(dio_incomplete, done.resid);
        }
        trace!(
            worker = self.id,
            pack_id = done.pack_id,
            duration_ms = done.duration_ms,
            resid = done.resid,
            "{} completed: {}",
            p.direction.as_str(),
            category
        );
        Ok(disposition)
    }

    fn zero_fill(&mut self) {
        let len = self.data_len();
        self.buffer.zero(len);
        self.substituted = true;
        warn!(
            worker = self.id,
            ">> substituted zeros for in blk={} for {} bytes", self.iblk, len
        );
    }

    /// Device read; releases the read lock once the command is queued
    fn read_device(&mut self, rd: MutexGuard<'a, ReadSide>) -> std::result::Result<(), CopyError> {
        let coll = self.coll;
        let coe = coll.cfg.in_flags.coe;
        let mut rd = Some(rd);
        loop {
            let pending = self.start_io(Side::In, self.has_share)?;
            self.state = self.state.submit();
            drop(rd.take());

            let disposition = self.finish_io(&pending)?;
            let (next, outcome) = self.state.complete(disposition, coe);
            self.state = next;
            match outcome {
                Outcome::Resubmit => rd = Some(coll.lock_read()),
                Outcome::Done { zero_fill, .. } => {
                    if zero_fill {
                        self.zero_fill();
                    }
                    let mut rd = coll.lock_read();
                    rd.rem_count = rd.rem_count.saturating_sub(u64::from(self.num_blks));
                    return Ok(());
                }
                Outcome::Abort(cat) => return Err(CopyError::Device(cat)),
            }
        }
    }

    /// File read, entered and left holding the read lock
    ///
    /// Returns true when the input ran short and the copy ends after this
    /// segment's write.
    fn read_file(&mut self, rd: &mut ReadSide, f: &FileEndpoint) -> std::result::Result<bool, CopyError> {
        let bs = self.coll.cfg.bs;
        let len = self.data_len();
        let got = match f.read_blocks(self.buffer.bytes_mut(len), self.iblk, bs) {
            Ok(n) => n,
            Err(e) if self.coll.cfg.in_flags.coe => {
                self.buffer.zero(len);
                warn!(
                    worker = self.id,
                    ">> substituted zeros for in blk={} for {} bytes, {:#}", self.iblk, len, e
                );
                len
            }
            Err(e) => return Err(CopyError::Other(format!("error in normal read, {:#}", e))),
        };

        let mut stop_after_write = false;
        if got < len {
            stop_after_write = true;
            let mut blocks = got / bs;
            if got % bs > 0 {
                blocks += 1;
                rd.partial += 1;
            }
            let blocks = blocks as u32;
            rd.count += u64::from(self.num_blks - blocks);
            self.num_blks = blocks;
            debug!(worker = self.id, got, blocks, "short read, stopping after this segment");
        }
        rd.rem_count = rd.rem_count.saturating_sub(u64::from(self.num_blks));
        Ok(stop_after_write)
    }

    /// Gate, account and write the segment to the primary output
    fn write_half(&mut self, blocks: u64, stop_after_write: bool) -> std::result::Result<Flow, CopyError> {
        let coll = self.coll;
        let mut wr = coll.lock_write();
        let ordered = coll.needs_write_ordering(self.has_share);
        if ordered {
            self.state = self.state.gate();
            wr = coll.wait_for_turn(wr, self.oblk);
        }
        if wr.stop || wr.count == 0 {
            wr.stop = true;
            return Ok(Flow::Stop);
        }
        if stop_after_write {
            wr.stop = true;
        }
        wr.next_block += blocks;
        wr.count = wr.count.saturating_sub(blocks);
        if self.num_blks == 0 {
            wr.stop = true;
            return Ok(Flow::Stop);
        }

        if let Some(rec) = &coll.endpoints.record {
            let len = self.data_len();
            if let Err(e) = write_full(rec.file.as_raw_fd(), self.buffer.bytes(len), Position::Stream) {
                warn!(worker = self.id, "write(ofreg={}) failed: {:#}", rec.name, e);
            }
        }

        match &coll.endpoints.output {
            Endpoint::Device(_) if self.swait => {}
            Endpoint::Device(_) => self.write_device(wr, ordered)?,
            Endpoint::Discard => wr.rem_count = wr.rem_count.saturating_sub(blocks),
            Endpoint::File(f) => self.write_file(&mut wr, f)?,
        }
        self.state = self.state.commit();
        self.rep_count += 1;
        Ok(Flow::Continue)
    }

    /// Device write
    ///
    /// With `hold` the write lock is kept until the command completes, so
    /// the next segment's write can't start before this one has landed.
    fn write_device(&mut self, wr: MutexGuard<'a, WriteSide>, hold: bool) -> std::result::Result<(), CopyError> {
        let mut wr = Some(wr);
        let res = self.write_device_locked(&mut wr, hold);
        if res.is_err() {
            // the cursor already moved past this segment
            let mut wr = wr.take().unwrap_or_else(|| self.coll.lock_write());
            wr.stop = true;
        }
        res
    }

    fn write_device_locked(
        &mut self,
        wr: &mut Option<MutexGuard<'a, WriteSide>>,
        hold: bool,
    ) -> std::result::Result<(), CopyError> {
        let coll = self.coll;
        let coe = coll.cfg.out_flags.coe;
        self.state = self.state.gate();
        loop {
            let pending = self.start_io(Side::Out, self.write_shares())?;
            self.state = self.state.submit();
            if !hold {
                drop(wr.take());
            }

            let disposition = self.finish_io(&pending)?;
            let (next, outcome) = self.state.complete(disposition, coe);
            self.state = next;
            match outcome {
                Outcome::Resubmit => {
                    if wr.is_none() {
                        *wr = Some(coll.lock_write());
                    }
                }
                Outcome::Done { .. } => {
                    if disposition == Disposition::MediumHard {
                        warn!(
                            worker = self.id,
                            ">> ignored error for out blk={} for {} bytes",
                            self.oblk,
                            self.data_len()
                        );
                    }
                    let mut wr = wr.take().unwrap_or_else(|| coll.lock_write());
                    wr.rem_count = wr.rem_count.saturating_sub(u64::from(self.num_blks));
                    return Ok(());
                }
                Outcome::Abort(cat) => return Err(CopyError::Device(cat)),
            }
        }
    }

    /// File write, under the write lock
    fn write_file(&mut self, wr: &mut WriteSide, f: &FileEndpoint) -> std::result::Result<(), CopyError> {
        let bs = self.coll.cfg.bs;
        let len = self.data_len();
        let mut blocks = self.num_blks as usize;
        match f.write_blocks(self.buffer.bytes(len), self.oblk, bs) {
            Ok(n) if n < len => {
                blocks = n / bs;
                if n % bs > 0 {
                    blocks += 1;
                    wr.partial += 1;
                }
            }
            Ok(_) => {}
            Err(e) if self.coll.cfg.out_flags.coe => {
                warn!(
                    worker = self.id,
                    ">> ignored error for out blk={} for {} bytes, {:#}", self.oblk, len, e
                );
            }
            Err(e) => return Err(CopyError::Other(format!("error normal write, {:#}", e))),
        }
        wr.rem_count = wr.rem_count.saturating_sub(blocks as u64);
        Ok(())
    }

    /// Copy the segment to the secondary output, if there is one
    fn write_mirror(&mut self) -> std::result::Result<(), CopyError> {
        let coll = self.coll;
        match &coll.endpoints.mirror {
            None | Some(Endpoint::Discard) => Ok(()),
            Some(Endpoint::File(f)) => {
                let _guard = coll.lock_mirror();
                let len = self.data_len();
                match f.write_blocks(self.buffer.bytes(len), self.oblk, coll.cfg.bs) {
                    Ok(_) => Ok(()),
                    Err(e) if coll.cfg.out_flags.coe => {
                        warn!(worker = self.id, ">> ignored error for of2 blk={}, {:#}", self.oblk, e);
                        Ok(())
                    }
                    Err(e) => Err(CopyError::Other(format!("error writing of2={}, {:#}", f.name(), e))),
                }
            }
            Some(Endpoint::Device(_)) => {
                let _guard = coll.lock_mirror();
                let master = self.transport(Side::In).ok();
                let swapped = match (&master, self.write_shares()) {
                    (Some(m), true) => {
                        let to = self.transport(Side::Mirror)?.handle();
                        share::swap(m.as_ref(), to, true, self.id)
                    }
                    _ => false,
                };
                let res = self.mirror_device(swapped);
                if swapped {
                    if let (Some(m), Ok(out)) = (&master, self.transport(Side::Out)) {
                        share::swap(m.as_ref(), out.handle(), false, self.id);
                    }
                }
                res
            }
        }
    }

    fn mirror_device(&mut self, share: bool) -> std::result::Result<(), CopyError> {
        let coe = self.coll.cfg.out_flags.coe;
        let mut state = SegmentState::WriteGated;
        loop {
            let pending = self.start_io(Side::Mirror, share)?;
            state = state.submit();
            let disposition = self.finish_io(&pending)?;
            let (next, outcome) = state.complete(disposition, coe);
            state = next;
            match outcome {
                Outcome::Resubmit => {}
                Outcome::Done { .. } => {
                    if disposition == Disposition::MediumHard {
                        warn!(worker = self.id, ">> ignored error for of2 blk={}", self.oblk);
                    }
                    return Ok(());
                }
                Outcome::Abort(cat) => return Err(CopyError::Device(cat)),
            }
        }
    }
}
