//! Copy coordination
//!
//! The [`Collection`] is the state every worker shares: the read side and
//! the write side, each behind its own mutex, the condition variable that
//! puts writes back into address order, the lock-free segment cursor and
//! the pack-id generator. [`copy`] derives the block count, builds the
//! collection, runs the worker pool and reports.
//!
//! # Lock Order
//!
//! A thread holds at most one of the read and write locks, except in
//! interleaved mode where the read lock may be held while taking the write
//! lock. Never the other way round. The mirror lock is only ever taken with
//! neither of the others held.
//!
//! # Example
//!
//! ```no_run
//! use sgcopy::config::{CopyConfig, Location};
//! use sgcopy::coordinator::{copy, RunOptions};
//! use sgcopy::target::Endpoints;
//!
//! let mut cfg = CopyConfig {
//!     input: Location::Path("/dev/sg1".into()),
//!     output: Some(Location::Path("/dev/sg2".into())),
//!     ..CopyConfig::default()
//! };
//! let endpoints = Endpoints::open(&mut cfg)?;
//! let report = copy(cfg, endpoints, RunOptions::default())?;
//! std::process::exit(report.exit_status);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod signals;

use crate::config::{CopyConfig, FlagSet};
use crate::error::{exit, CopyError, ExitStatus};
use crate::scsi::cdb::MAX_CDB_LEN;
use crate::scsi::{Cdb, Direction};
use crate::stats::CopyReport;
use crate::target::device::sync_cache;
use crate::target::{Endpoint, Endpoints};
use crate::worker::pool;
use crate::Result;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Read-side counters, guarded by the read lock
#[derive(Debug, Default)]
pub struct ReadSide {
    /// Blocks not yet claimed by a reader
    pub count: u64,
    /// Blocks not yet read
    pub rem_count: u64,
    pub partial: u64,
    pub stop: bool,
}

/// Write-side counters, guarded by the write lock
#[derive(Debug, Default)]
pub struct WriteSide {
    /// Absolute block address the next write must start at
    pub next_block: u64,
    /// Blocks not yet claimed by a writer
    pub count: u64,
    /// Blocks not yet written
    pub rem_count: u64,
    pub partial: u64,
    pub stop: bool,
    /// A worker finished its first segment (or gave up)
    pub settled: bool,
}

/// A claimed range of blocks, relative to skip/seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: u64,
    pub blocks: u32,
}

/// Hands out disjoint segments in increasing order
#[derive(Debug)]
pub struct SegmentCursor {
    next: CachePadded<AtomicU64>,
    limit: u64,
}

impl SegmentCursor {
    pub fn new(limit: u64) -> Self {
        Self {
            next: CachePadded::new(AtomicU64::new(0)),
            limit,
        }
    }

    /// Claim the next `size` blocks, clipped to the limit
    pub fn acquire(&self, size: u32) -> Option<Segment> {
        let index = self.next.fetch_add(u64::from(size), Ordering::AcqRel);
        if index >= self.limit {
            return None;
        }
        let blocks = (self.limit - index).min(u64::from(size)) as u32;
        Some(Segment { index, blocks })
    }

    /// Blocks handed out so far
    pub fn position(&self) -> u64 {
        self.next.load(Ordering::Acquire).min(self.limit)
    }
}

/// Process-wide source of command pack ids
#[derive(Debug)]
pub struct PackIdGen(CachePadded<AtomicI32>);

impl PackIdGen {
    pub fn new() -> Self {
        Self(CachePadded::new(AtomicI32::new(1)))
    }

    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PackIdGen {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every worker of one copy
pub struct Collection {
    pub cfg: CopyConfig,
    pub endpoints: Endpoints,
    /// Blocks to copy
    pub count: u64,
    read: Mutex<ReadSide>,
    write: Mutex<WriteSide>,
    write_cv: Condvar,
    mirror_lock: Mutex<()>,
    pub cursor: SegmentCursor,
    pub pack_ids: PackIdGen,
    pub exit: ExitStatus,
    dio_incomplete: AtomicU64,
    sum_resid: AtomicI64,
}

impl Collection {
    pub fn new(cfg: CopyConfig, endpoints: Endpoints, count: u64) -> Self {
        let seek = cfg.seek;
        Self {
            cfg,
            endpoints,
            count,
            read: Mutex::new(ReadSide {
                count,
                rem_count: count,
                ..Default::default()
            }),
            write: Mutex::new(WriteSide {
                next_block: seek,
                count,
                rem_count: count,
                ..Default::default()
            }),
            write_cv: Condvar::new(),
            mirror_lock: Mutex::new(()),
            cursor: SegmentCursor::new(count),
            pack_ids: PackIdGen::new(),
            exit: ExitStatus::new(),
            dio_incomplete: AtomicU64::new(0),
            sum_resid: AtomicI64::new(0),
        }
    }

    pub fn lock_read(&self) -> MutexGuard<'_, ReadSide> {
        lock(&self.read)
    }

    pub fn lock_write(&self) -> MutexGuard<'_, WriteSide> {
        lock(&self.write)
    }

    pub fn lock_mirror(&self) -> MutexGuard<'_, ()> {
        lock(&self.mirror_lock)
    }

    /// Block until the write cursor reaches `oblk` or the write side stops
    pub fn wait_for_turn<'a>(&'a self, guard: MutexGuard<'a, WriteSide>, oblk: u64) -> MutexGuard<'a, WriteSide> {
        self.write_cv
            .wait_while(guard, |w| !w.stop && w.next_block != oblk)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until some worker has settled
    pub fn wait_settled<'a>(&'a self, guard: MutexGuard<'a, WriteSide>) -> MutexGuard<'a, WriteSide> {
        self.write_cv
            .wait_while(guard, |w| !w.settled)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn broadcast(&self) {
        self.write_cv.notify_all();
    }

    /// Mark progress for the shakedown barrier and wake all waiters
    pub fn settle(&self) {
        self.lock_write().settled = true;
        self.broadcast();
    }

    /// Stop both directions; must be called with no lock held
    pub fn stop_both(&self) {
        self.lock_read().stop = true;
        self.lock_write().stop = true;
        self.broadcast();
    }

    pub fn stop_read(&self) {
        self.lock_read().stop = true;
    }

    /// Record a failure and stop the copy; must be called with no lock held
    pub fn fail(&self, err: &CopyError) {
        self.exit.record(err.exit_status());
        self.stop_both();
    }

    /// Whether a segment's write must wait for the write cursor
    ///
    /// Device-to-device copies without a record sink are ordered by the
    /// read lock already; discarded output needs no order unless shared
    /// data also goes to the record sink.
    pub fn needs_write_ordering(&self, has_share: bool) -> bool {
        let e = &self.endpoints;
        let record = e.record.is_some();
        if !record && e.both_devices() {
            return false;
        }
        (has_share && record) || !e.output.is_discard()
    }

    pub fn add_diagnostics(&self, dio_incomplete: bool, resid: i32) {
        if dio_incomplete {
            self.dio_incomplete.fetch_add(1, Ordering::Relaxed);
        }
        if resid != 0 {
            self.sum_resid.fetch_add(i64::from(resid), Ordering::Relaxed);
        }
    }

    /// Snapshot of the counters
    pub fn snapshot(&self, elapsed: Option<Duration>) -> CopyReport {
        let (in_remaining, in_partial) = {
            let rd = self.lock_read();
            (rd.rem_count, rd.partial)
        };
        let (out_remaining, out_partial, out_unclaimed, next_block) = {
            let wr = self.lock_write();
            (wr.rem_count, wr.partial, wr.count, wr.next_block)
        };
        CopyReport {
            count: self.count,
            bs: self.cfg.bs,
            in_remaining,
            in_partial,
            out_remaining,
            out_partial,
            out_unclaimed,
            write_cursor: next_block.saturating_sub(self.cfg.seek),
            dio_incomplete: self.dio_incomplete.load(Ordering::Relaxed),
            sum_resid: self.sum_resid.load(Ordering::Relaxed),
            elapsed,
            exit_status: self.exit.get(),
        }
    }
}

/// How [`copy`] runs
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Install the signal listener (SIGINT, SIGUSR1, ...)
    pub listen_signals: bool,
}

/// Blocks to copy when no count was given
fn derive_count(cfg: &CopyConfig, endpoints: &Endpoints, probe_pack_id: i32) -> Result<u64> {
    let in_cap = endpoints
        .input
        .capacity(cfg.bs, true, probe_pack_id)
        .map(|c| c.saturating_sub(cfg.skip));
    let out_cap = endpoints
        .output
        .capacity(cfg.bs, false, probe_pack_id + 1)
        .map(|c| c.saturating_sub(cfg.seek));
    debug!(?in_cap, ?out_cap, "endpoint capacities");
    match (in_cap, out_cap) {
        (Some(i), Some(o)) => Ok(i.min(o)),
        (Some(n), None) | (None, Some(n)) => Ok(n),
        (None, None) => Err(CopyError::Other("Couldn't calculate count, please give one".to_string()).into()),
    }
}

/// Switch a device side to 16 byte cdbs when addresses or lengths need it
fn grow_cdb_sizes(cfg: &mut CopyConfig, endpoints: &Endpoints, count: u64) {
    if cfg.cdbsz_given {
        return;
    }
    let too_long = cfg.bpt > usize::from(u16::MAX);
    if endpoints.input.is_device()
        && cfg.cdbsz_in != MAX_CDB_LEN
        && (count + cfg.skip > u64::from(u32::MAX) || too_long)
    {
        info!("SCSI command size increased to 16 bytes (for 'if')");
        cfg.cdbsz_in = MAX_CDB_LEN;
    }
    if endpoints.output.is_device()
        && cfg.cdbsz_out != MAX_CDB_LEN
        && (count + cfg.seek > u64::from(u32::MAX) || too_long)
    {
        info!("SCSI command size increased to 16 bytes (for 'of')");
        cfg.cdbsz_out = MAX_CDB_LEN;
    }
}

/// Check the cdb size on each device side can express the whole copy
fn check_cdb_limits(cfg: &CopyConfig, endpoints: &Endpoints, count: u64) -> std::result::Result<(), CopyError> {
    if count == 0 {
        return Ok(());
    }
    let blocks = u32::try_from(cfg.bpt.min(count as usize))
        .map_err(|_| CopyError::Syntax(format!("bpt={} too large", cfg.bpt)))?;
    let sides: [(bool, usize, Direction, u64, &FlagSet); 2] = [
        (endpoints.input.is_device(), cfg.cdbsz_in, Direction::Read, cfg.skip, &cfg.in_flags),
        (endpoints.output.is_device(), cfg.cdbsz_out, Direction::Write, cfg.seek, &cfg.out_flags),
    ];
    for (is_device, size, direction, offset, flags) in sides {
        if !is_device {
            continue;
        }
        let last_lba = offset + count - u64::from(blocks);
        Cdb::read_write(size, direction, blocks, last_lba, flags.fua, flags.dpo)
            .map_err(|e| CopyError::Syntax(format!("{} cdb: {}", direction.as_str(), e)))?;
    }
    Ok(())
}

fn sync_device(endpoint: Option<&Endpoint>, coll: &Collection, what: &str) {
    if let Some(dev) = endpoint.and_then(Endpoint::as_device) {
        eprintln!(">> Synchronizing cache on {}", dev.name());
        if let Err(e) = sync_cache(dev.shared().as_ref(), coll.pack_ids.next()) {
            debug!("sync cache on {}: {:#}", dev.name(), e);
            eprintln!("Unable to synchronize cache{}", what);
        }
    }
}

/// Run a copy to completion and report on it
///
/// Configuration and setup failures come back as errors. Failures once
/// workers are running end up in the report's exit status.
pub fn copy(mut cfg: CopyConfig, endpoints: Endpoints, opts: RunOptions) -> Result<CopyReport> {
    let probe_ids = PackIdGen::new();
    let count = match cfg.count {
        Some(n) => n,
        None => derive_count(&cfg, &endpoints, probe_ids.next())?,
    };
    grow_cdb_sizes(&mut cfg, &endpoints, count);
    check_cdb_limits(&cfg, &endpoints, count)?;
    info!(count, "{}", cfg.summary());

    let dry_run = cfg.dry_run;
    let do_time = cfg.do_time;
    let do_sync = cfg.do_sync;
    let threads = cfg.threads;
    let coll = Collection::new(cfg, endpoints, count);

    let mut elapsed = None;
    if dry_run > 0 {
        eprintln!("Due to --dry-run option, bypass copy/read");
    } else {
        let start = Instant::now();
        if count > 0 {
            let result = crossbeam::thread::scope(|scope| {
                let listener = if opts.listen_signals {
                    signals::spawn(scope, &coll, start)
                } else {
                    None
                };
                pool::run(scope, &coll, threads);
                if let Some(listener) = listener {
                    listener.close();
                }
            });
            if result.is_err() {
                coll.exit.record(exit::OTHER);
            }
        }
        elapsed = Some(start.elapsed());
        if do_time {
            coll.snapshot(elapsed).print_throughput(false);
        }
        if do_sync {
            sync_device(Some(&coll.endpoints.output), &coll, "");
            sync_device(coll.endpoints.mirror.as_ref(), &coll, " (of2)");
        }
    }

    let mut report = coll.snapshot(elapsed);
    if report.out_unclaimed != 0 && dry_run == 0 {
        eprintln!(">>>> Some error occurred, remaining blocks={}", report.out_unclaimed);
        if report.exit_status == exit::OK {
            report.exit_status = exit::OTHER;
        }
    }
    report.print_stats("");
    report.print_diagnostics();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_cursor_clips_last_segment() {
        let cursor = SegmentCursor::new(10);
        let segs: Vec<Segment> = std::iter::from_fn(|| cursor.acquire(4)).collect();
        assert_eq!(
            segs,
            vec![
                Segment { index: 0, blocks: 4 },
                Segment { index: 4, blocks: 4 },
                Segment { index: 8, blocks: 2 },
            ]
        );
        assert_eq!(cursor.acquire(4), None);
        assert_eq!(cursor.position(), 10);
    }

    #[test]
    fn test_cursor_covers_range_across_threads() {
        for threads in [1usize, 2, 3, 7, 16] {
            let cursor = SegmentCursor::new(1000);
            let claimed = Mutex::new(Vec::new());
            crossbeam::thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|_| {
                        while let Some(seg) = cursor.acquire(7) {
                            claimed.lock().unwrap().push(seg);
                        }
                    });
                }
            })
            .unwrap();
            let mut segs = claimed.into_inner().unwrap();
            segs.sort_by_key(|s| s.index);
            let mut next = 0;
            for seg in &segs {
                assert_eq!(seg.index, next, "gap or overlap with {} threads", threads);
                next += u64::from(seg.blocks);
            }
            assert_eq!(next, 1000);
        }
    }

    #[test]
    fn test_pack_ids_unique() {
        let ids = PackIdGen::new();
        let seen = Mutex::new(HashSet::new());
        crossbeam::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..100 {
                        assert!(seen.lock().unwrap().insert(ids.next()));
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(seen.into_inner().unwrap().len(), 400);
    }
}
