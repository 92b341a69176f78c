//! Mock sg devices for testing
//!
//! An in-memory stand-in for the sg driver. A [`MockBus`] hands out
//! [`MockHandle`]s over shared [`MockMedia`], completes READ/WRITE and the
//! housekeeping commands the copy sends, and lets tests inject faults and
//! inspect every command submitted.
//!
//! # Features
//!
//! - READ/WRITE 6/10/12/16, READ CAPACITY 10/16, SYNCHRONIZE CACHE 10
//! - Per-handle reserve buffers and SHARE / NO_DXFER semantics, including
//!   share swaps with a configurable run of EBUSY replies
//! - Fault rules by direction and LBA: sense data, submit errnos, delays
//!   and corrupted correlation fields
//! - Completion matching by pack id, like a handle opened with forced
//!   pack-id matching
//!
//! # Example
//!
//! ```
//! use sgcopy::engine::mock::{MockBus, MockMedia};
//! use sgcopy::engine::{Command, Transport, Variant};
//! use sgcopy::scsi::{Cdb, Direction};
//! use std::sync::Arc;
//!
//! let bus = MockBus::new(Variant::V3);
//! let media = Arc::new(MockMedia::patterned(512, 16));
//! let dev = bus.open(media.clone());
//!
//! let cdb = Cdb::read_write(10, Direction::Read, 2, 4, false, false).unwrap();
//! let mut data = vec![0u8; 1024];
//! let mut sense = [0u8; 64];
//! let cmd = Command {
//!     cdb: &cdb,
//!     direction: Direction::Read,
//!     data: data.as_mut_ptr(),
//!     data_len: data.len(),
//!     sense: sense.as_mut_ptr(),
//!     sense_cap: sense.len(),
//!     pack_id: 7,
//!     tag: 1,
//!     flags: 0,
//!     timeout_ms: 1000,
//!     abort_probe: false,
//! };
//! let done = dev.execute(&cmd).unwrap();
//! assert_eq!(done.pack_id, 7);
//! assert_eq!(data, media.read(4, 2));
//! ```

use super::{Command, Completion, HandleId, Transport, Variant};
use crate::scsi::cdb::{ReadWrite, READ_CAPACITY_10, SAI_READ_CAPACITY_16, SERVICE_ACTION_IN_16, SYNCHRONIZE_CACHE_10};
use crate::scsi::sense::{key, status, SenseData};
use crate::scsi::sg::{flag, info};
use crate::scsi::{Cdb, Direction};
use crate::target::{DeviceOpener, OpenedDevice};
use crate::util::buffer::MappedRegion;
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed-size block storage behind one or more mock handles
pub struct MockMedia {
    block_size: usize,
    data: Mutex<Vec<u8>>,
}

impl MockMedia {
    /// Zero-filled media of `blocks` blocks
    pub fn new(block_size: usize, blocks: u64) -> Self {
        Self {
            block_size,
            data: Mutex::new(vec![0u8; block_size * blocks as usize]),
        }
    }

    /// Media whose every block is distinguishable from every other
    pub fn patterned(block_size: usize, blocks: u64) -> Self {
        let media = Self::new(block_size, blocks);
        {
            let mut data = lock(&media.data);
            for (i, b) in data.iter_mut().enumerate() {
                let lba = i / block_size;
                *b = (lba as u8).wrapping_mul(31) ^ (i % block_size) as u8 ^ (lba >> 8) as u8;
            }
        }
        media
    }

    /// Media initialised from `bytes`, which must be whole blocks
    pub fn from_bytes(block_size: usize, bytes: Vec<u8>) -> Self {
        assert_eq!(bytes.len() % block_size, 0, "media must be whole blocks");
        Self {
            block_size,
            data: Mutex::new(bytes),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks(&self) -> u64 {
        (lock(&self.data).len() / self.block_size) as u64
    }

    /// Copy of `blocks` blocks starting at `lba`
    pub fn read(&self, lba: u64, blocks: u64) -> Vec<u8> {
        let data = lock(&self.data);
        let start = lba as usize * self.block_size;
        data[start..start + blocks as usize * self.block_size].to_vec()
    }

    /// Copy of the whole medium
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }
}

/// What a fault rule does to a matching command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Complete with CHECK CONDITION and this sense; no data moves unless
    /// the key is RECOVERED ERROR
    Sense { key: u8, asc: u8, ascq: u8 },
    /// Fail submission with this errno
    SubmitErrno(i32),
    /// Complete normally, holding the completion back this long
    Delay(Duration),
    /// Complete with a tag that doesn't match the submission
    WrongTag,
}

impl Fault {
    pub fn medium_error() -> Self {
        Fault::Sense { key: key::MEDIUM_ERROR, asc: 0x11, ascq: 0 }
    }

    pub fn unit_attention() -> Self {
        Fault::Sense { key: key::UNIT_ATTENTION, asc: 0x29, ascq: 0 }
    }

    pub fn aborted_command() -> Self {
        Fault::Sense { key: key::ABORTED_COMMAND, asc: 0x47, ascq: 0 }
    }

    pub fn recovered() -> Self {
        Fault::Sense { key: key::RECOVERED_ERROR, asc: 0x17, ascq: 0 }
    }

    pub fn not_ready() -> Self {
        Fault::Sense { key: key::NOT_READY, asc: 0x04, ascq: 0x01 }
    }
}

/// Applies a [`Fault`] to commands of one direction touching one LBA
#[derive(Clone)]
pub struct FaultRule {
    direction: Direction,
    lba: u64,
    media: Option<Arc<MockMedia>>,
    fault: Fault,
    remaining: usize,
}

impl FaultRule {
    /// Fault the next read whose range covers `lba`
    pub fn on_read(lba: u64, fault: Fault) -> Self {
        Self {
            direction: Direction::Read,
            lba,
            media: None,
            fault,
            remaining: 1,
        }
    }

    /// Fault the next write whose range covers `lba`
    pub fn on_write(lba: u64, fault: Fault) -> Self {
        Self {
            direction: Direction::Write,
            ..Self::on_read(lba, fault)
        }
    }

    /// Fire this many times (default once)
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    /// Only match commands on this medium
    pub fn on_media(mut self, media: &Arc<MockMedia>) -> Self {
        self.media = Some(media.clone());
        self
    }

    fn matches(&self, rw: &ReadWrite, media: &Arc<MockMedia>) -> bool {
        self.remaining > 0
            && self.direction == rw.direction
            && self.lba >= rw.lba
            && self.lba < rw.lba + u64::from(rw.blocks)
            && self.media.as_ref().map_or(true, |m| Arc::ptr_eq(m, media))
    }
}

/// One command as the mock saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRecord {
    pub handle: HandleId,
    pub opcode: u8,
    /// Set for READ/WRITE commands
    pub direction: Option<Direction>,
    pub lba: u64,
    pub blocks: u32,
    pub pack_id: i32,
    pub flags: u32,
    pub fault: Option<Fault>,
    pub aborted: bool,
}

struct HandleState {
    media: Arc<MockMedia>,
    reserve: Mutex<Vec<u8>>,
    peer: Mutex<Option<HandleId>>,
    /// Completions not yet received, with the latency to apply on receive
    pending: Mutex<HashMap<i32, (Completion, Option<Duration>)>>,
}

/// A set of mock sg handles that can share buffers with each other
pub struct MockBus {
    variant: Variant,
    next_id: AtomicI32,
    handles: Mutex<HashMap<HandleId, Arc<HandleState>>>,
    faults: Mutex<Vec<FaultRule>>,
    log: Mutex<Vec<MockRecord>>,
    swap_busy: AtomicUsize,
    swap_attempts: AtomicUsize,
    probe_misses: AtomicBool,
    dio_falls_back: AtomicBool,
}

impl MockBus {
    pub fn new(variant: Variant) -> Arc<Self> {
        Arc::new(Self {
            variant,
            next_id: AtomicI32::new(1000),
            handles: Mutex::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            swap_busy: AtomicUsize::new(0),
            swap_attempts: AtomicUsize::new(0),
            probe_misses: AtomicBool::new(false),
            dio_falls_back: AtomicBool::new(false),
        })
    }

    /// Open a new handle onto `media`
    pub fn open(self: &Arc<Self>, media: Arc<MockMedia>) -> Arc<MockHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handles).insert(
            id,
            Arc::new(HandleState {
                media,
                reserve: Mutex::new(Vec::new()),
                peer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
            }),
        );
        Arc::new(MockHandle { id, bus: self.clone() })
    }

    /// Forget a handle, as if its file descriptor were closed
    pub fn close(&self, id: HandleId) {
        lock(&self.handles).remove(&id);
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn inject(&self, rule: FaultRule) {
        lock(&self.faults).push(rule);
    }

    /// Make the next `n` share swaps report EBUSY
    pub fn set_swap_busy(&self, n: usize) {
        self.swap_busy.store(n, Ordering::SeqCst);
    }

    pub fn swap_attempts(&self) -> usize {
        self.swap_attempts.load(Ordering::SeqCst)
    }

    /// Make the v4 abort probe always find the command still in flight
    pub fn set_probe_misses(&self, misses: bool) {
        self.probe_misses.store(misses, Ordering::SeqCst);
    }

    /// Report direct IO requests as done indirectly
    pub fn set_dio_falls_back(&self, falls_back: bool) {
        self.dio_falls_back.store(falls_back, Ordering::SeqCst);
    }

    /// The handle `id` currently shares with
    pub fn share_peer(&self, id: HandleId) -> Option<HandleId> {
        let state = self.state(id).ok()?;
        let peer = *lock(&state.peer);
        peer
    }

    /// Every command submitted so far, in submission order
    pub fn commands(&self) -> Vec<MockRecord> {
        lock(&self.log).clone()
    }

    /// READ/WRITE commands of one direction
    pub fn transfers(&self, direction: Direction) -> Vec<MockRecord> {
        lock(&self.log)
            .iter()
            .filter(|r| r.direction == Some(direction))
            .cloned()
            .collect()
    }

    fn state(&self, id: HandleId) -> io::Result<Arc<HandleState>> {
        lock(&self.handles)
            .get(&id)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn take_fault(&self, rw: &ReadWrite, media: &Arc<MockMedia>) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        let rule = faults.iter_mut().find(|r| r.matches(rw, media))?;
        rule.remaining -= 1;
        Some(rule.fault)
    }
}

/// One open mock sg handle
pub struct MockHandle {
    id: HandleId,
    bus: Arc<MockBus>,
}

impl MockHandle {
    pub fn bus(&self) -> &Arc<MockBus> {
        &self.bus
    }

    fn check_condition(cmd: &Command<'_>, c: &mut Completion, key: u8, asc: u8, ascq: u8) {
        let sb = SenseData::fixed(key, asc, ascq);
        let n = sb.len().min(cmd.sense_cap);
        if n > 0 && !cmd.sense.is_null() {
            // SAFETY: the submitter owns sense_cap bytes at cmd.sense
            unsafe { std::ptr::copy_nonoverlapping(sb.as_ptr(), cmd.sense, n) };
        }
        c.device_status = status::CHECK_CONDITION;
        c.sense_len = n;
        c.info |= info::CHECK;
    }

    fn transfer(
        &self,
        state: &HandleState,
        cmd: &Command<'_>,
        rw: &ReadWrite,
        fault: Option<Fault>,
        c: &mut Completion,
    ) -> io::Result<()> {
        let media = &state.media;
        let bs = media.block_size();
        if rw.lba + u64::from(rw.blocks) > media.blocks() {
            Self::check_condition(cmd, c, key::ILLEGAL_REQUEST, 0x21, 0);
            return Ok(());
        }
        if let Some(Fault::Sense { key: k, asc, ascq }) = fault {
            Self::check_condition(cmd, c, k, asc, ascq);
            if k != key::RECOVERED_ERROR {
                c.resid = cmd.data_len as i32;
                return Ok(());
            }
        }

        let len = rw.blocks as usize * bs;
        let start = rw.lba as usize * bs;
        let no_dxfer = cmd.flags & flag::NO_DXFER != 0;
        let share = cmd.flags & flag::SHARE != 0;
        match rw.direction {
            Direction::Read => {
                let bytes = media.read(rw.lba, u64::from(rw.blocks));
                if share || no_dxfer {
                    *lock(&state.reserve) = bytes.clone();
                }
                if !no_dxfer && !cmd.data.is_null() {
                    let n = len.min(cmd.data_len);
                    // SAFETY: the submitter owns data_len bytes at cmd.data
                    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), cmd.data, n) };
                    c.resid = (cmd.data_len - n) as i32;
                }
            }
            Direction::Write => {
                let src = if no_dxfer && share {
                    let peer = (*lock(&state.peer)).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
                    let peer_state = self.bus.state(peer)?;
                    let reserve = lock(&peer_state.reserve).clone();
                    reserve
                } else if no_dxfer {
                    lock(&state.reserve).clone()
                } else {
                    let n = len.min(cmd.data_len);
                    let mut v = vec![0u8; n];
                    // SAFETY: the submitter owns data_len bytes at cmd.data
                    unsafe { std::ptr::copy_nonoverlapping(cmd.data, v.as_mut_ptr(), n) };
                    v
                };
                let n = len.min(src.len());
                lock(&media.data)[start..start + n].copy_from_slice(&src[..n]);
                c.resid = (len - n) as i32;
            }
        }
        if cmd.flags & flag::DIRECT_IO != 0 && !self.bus.dio_falls_back.load(Ordering::SeqCst) {
            c.info |= info::DIRECT_IO;
        }
        Ok(())
    }

    fn housekeeping(&self, state: &HandleState, cmd: &Command<'_>, c: &mut Completion) {
        let media = &state.media;
        let last_lba = media.blocks().saturating_sub(1);
        let bytes = cmd.cdb.as_bytes();
        let reply: Vec<u8> = match bytes[0] {
            READ_CAPACITY_10 => {
                let mut r = Vec::with_capacity(8);
                r.extend_from_slice(&(last_lba.min(u64::from(u32::MAX)) as u32).to_be_bytes());
                r.extend_from_slice(&(media.block_size() as u32).to_be_bytes());
                r
            }
            SERVICE_ACTION_IN_16 if bytes[1] & 0x1f == SAI_READ_CAPACITY_16 => {
                let mut r = vec![0u8; 32];
                r[0..8].copy_from_slice(&last_lba.to_be_bytes());
                r[8..12].copy_from_slice(&(media.block_size() as u32).to_be_bytes());
                r
            }
            SYNCHRONIZE_CACHE_10 => Vec::new(),
            _ => {
                Self::check_condition(cmd, c, key::ILLEGAL_REQUEST, 0x20, 0);
                return;
            }
        };
        let n = reply.len().min(cmd.data_len);
        if n > 0 && !cmd.data.is_null() {
            // SAFETY: the submitter owns data_len bytes at cmd.data
            unsafe { std::ptr::copy_nonoverlapping(reply.as_ptr(), cmd.data, n) };
        }
        c.resid = (cmd.data_len - n) as i32;
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.bus.close(self.id);
    }
}

impl Transport for MockHandle {
    fn variant(&self) -> Variant {
        self.bus.variant
    }

    fn handle(&self) -> HandleId {
        self.id
    }

    fn submit(&self, cmd: &Command<'_>) -> io::Result<()> {
        let state = self.bus.state(self.id)?;
        let rw = Cdb::decode_read_write(cmd.cdb.as_bytes());
        let fault = rw.as_ref().and_then(|rw| self.bus.take_fault(rw, &state.media));
        let mut record = MockRecord {
            handle: self.id,
            opcode: cmd.cdb.opcode(),
            direction: rw.map(|r| r.direction),
            lba: rw.map_or(0, |r| r.lba),
            blocks: rw.map_or(0, |r| r.blocks),
            pack_id: cmd.pack_id,
            flags: cmd.flags,
            fault,
            aborted: false,
        };

        if let Some(Fault::SubmitErrno(errno)) = fault {
            lock(&self.bus.log).push(record);
            return Err(io::Error::from_raw_os_error(errno));
        }

        let mut completion = Completion {
            pack_id: cmd.pack_id,
            tag: cmd.tag,
            ..Default::default()
        };
        match rw {
            Some(rw) => self.transfer(&state, cmd, &rw, fault, &mut completion)?,
            None => self.housekeeping(&state, cmd, &mut completion),
        }
        if fault == Some(Fault::WrongTag) {
            completion.tag ^= 0x5a5a;
        }
        if cmd.abort_probe && self.bus.variant == Variant::V4 && self.bus.probe_misses.load(Ordering::SeqCst) {
            // the command already finished; a late completion is accepted
            record.aborted = true;
        }

        lock(&self.bus.log).push(record);
        let latency = match fault {
            Some(Fault::Delay(d)) => Some(d),
            _ => None,
        };
        lock(&state.pending).insert(cmd.pack_id, (completion, latency));
        Ok(())
    }

    fn receive(&self, cmd: &Command<'_>) -> io::Result<Completion> {
        let state = self.bus.state(self.id)?;
        let done = lock(&state.pending).remove(&cmd.pack_id);
        let (completion, latency) = done.ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;
        if let Some(d) = latency {
            std::thread::sleep(d);
        }
        Ok(completion)
    }

    fn share_from(&self, master: HandleId) -> io::Result<()> {
        let me = self.bus.state(self.id)?;
        let them = self.bus.state(master)?;
        *lock(&me.peer) = Some(master);
        *lock(&them.peer) = Some(self.id);
        Ok(())
    }

    fn swap_share(&self, to: HandleId, _master_fini_clear: bool) -> io::Result<()> {
        self.bus.swap_attempts.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .bus
            .swap_busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if busy.is_ok() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let me = self.bus.state(self.id)?;
        let them = self.bus.state(to)?;
        *lock(&me.peer) = Some(to);
        *lock(&them.peer) = Some(self.id);
        Ok(())
    }
}

/// Opens mock handles onto one medium, standing in for an sg device path
pub struct MockOpener {
    bus: Arc<MockBus>,
    media: Arc<MockMedia>,
}

impl MockOpener {
    pub fn new(bus: Arc<MockBus>, media: Arc<MockMedia>) -> Self {
        Self { bus, media }
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, mmap_len: Option<usize>) -> Result<OpenedDevice> {
        let handle = self.bus.open(self.media.clone());
        let mapping = match mmap_len {
            Some(len) => Some(MappedRegion::anonymous(len).context("mapping mock reserve buffer")?),
            None => None,
        };
        Ok(OpenedDevice {
            transport: handle,
            mapping,
        })
    }

    fn describe(&self) -> String {
        format!("mock sg device ({} blocks)", self.media.blocks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command<'a>(cdb: &'a Cdb, dir: Direction, data: &mut [u8], sense: &mut [u8], pack_id: i32, flags: u32) -> Command<'a> {
        Command {
            cdb,
            direction: dir,
            data: data.as_mut_ptr(),
            data_len: data.len(),
            sense: sense.as_mut_ptr(),
            sense_cap: sense.len(),
            pack_id,
            tag: pack_id as u64,
            flags,
            timeout_ms: 1000,
            abort_probe: false,
        }
    }

    #[test]
    fn test_write_then_read() {
        let bus = MockBus::new(Variant::V3);
        let media = Arc::new(MockMedia::new(512, 8));
        let dev = bus.open(media.clone());
        let mut sense = [0u8; 64];

        let wr = Cdb::read_write(10, Direction::Write, 1, 3, false, false).unwrap();
        let mut data = vec![0xabu8; 512];
        let c = dev.execute(&command(&wr, Direction::Write, &mut data, &mut sense, 1, 0)).unwrap();
        assert_eq!(c.device_status, 0);
        assert_eq!(media.read(3, 1), vec![0xab; 512]);
        assert_eq!(bus.transfers(Direction::Write).len(), 1);
    }

    #[test]
    fn test_medium_error_moves_no_data() {
        let bus = MockBus::new(Variant::V3);
        let media = Arc::new(MockMedia::patterned(512, 8));
        let dev = bus.open(media);
        bus.inject(FaultRule::on_read(2, Fault::medium_error()));

        let rd = Cdb::read_write(10, Direction::Read, 4, 0, false, false).unwrap();
        let mut data = vec![0x11u8; 2048];
        let mut sense = [0u8; 64];
        let cmd = command(&rd, Direction::Read, &mut data, &mut sense, 5, 0);
        let c = dev.execute(&cmd).unwrap();
        assert_eq!(c.category(&sense), crate::scsi::SenseCategory::MediumHard);
        assert!(data.iter().all(|&b| b == 0x11));

        // fault fired once; the retry is clean
        let c = dev.execute(&cmd).unwrap();
        assert_eq!(c.category(&sense), crate::scsi::SenseCategory::Clean);
    }

    #[test]
    fn test_shared_write_uses_master_reserve() {
        let bus = MockBus::new(Variant::V4);
        let src = Arc::new(MockMedia::patterned(512, 4));
        let dst = Arc::new(MockMedia::new(512, 4));
        let rd = bus.open(src.clone());
        let wr = bus.open(dst.clone());
        wr.share_from(rd.handle()).unwrap();

        let mut data = vec![0u8; 1024];
        let mut sense = [0u8; 64];
        let flags = flag::SHARE | flag::NO_DXFER;
        let rcdb = Cdb::read_write(16, Direction::Read, 2, 1, false, false).unwrap();
        rd.execute(&command(&rcdb, Direction::Read, &mut data, &mut sense, 1, flags)).unwrap();
        assert!(data.iter().all(|&b| b == 0), "no user-space transfer");

        let wcdb = Cdb::read_write(16, Direction::Write, 2, 1, false, false).unwrap();
        wr.execute(&command(&wcdb, Direction::Write, &mut data, &mut sense, 2, flags)).unwrap();
        assert_eq!(dst.read(1, 2), src.read(1, 2));
    }

    #[test]
    fn test_out_of_range_is_illegal_request() {
        let bus = MockBus::new(Variant::V3);
        let dev = bus.open(Arc::new(MockMedia::new(512, 4)));
        let rd = Cdb::read_write(10, Direction::Read, 2, 3, false, false).unwrap();
        let mut data = vec![0u8; 1024];
        let mut sense = [0u8; 64];
        let c = dev.execute(&command(&rd, Direction::Read, &mut data, &mut sense, 1, 0)).unwrap();
        assert_eq!(c.category(&sense), crate::scsi::SenseCategory::IllegalRequest);
    }

    #[test]
    fn test_receive_without_submit() {
        let bus = MockBus::new(Variant::V3);
        let dev = bus.open(Arc::new(MockMedia::new(512, 4)));
        let rd = Cdb::read_write(10, Direction::Read, 1, 0, false, false).unwrap();
        let mut data = vec![0u8; 512];
        let mut sense = [0u8; 64];
        let err = dev.receive(&command(&rd, Direction::Read, &mut data, &mut sense, 9, 0)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
    }

    #[test]
    fn test_drop_closes_handle() {
        let bus = MockBus::new(Variant::V3);
        let dev = bus.open(Arc::new(MockMedia::new(512, 4)));
        assert_eq!(bus.open_handles(), 1);
        drop(dev);
        assert_eq!(bus.open_handles(), 0);
    }
}
