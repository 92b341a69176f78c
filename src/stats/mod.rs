//! Copy statistics and the dd-style report
//!
//! A [`CopyReport`] is a snapshot of the shared counters. It is taken at
//! the end of a copy and, on SIGUSR1/SIGUSR2, while one is running. The
//! report lines go to stderr the way dd prints them:
//!
//! ```text
//! time to transfer data was 0.412345 secs, 81.37 MB/sec
//!   remaining block count=12
//! 65524+0 records in
//! 65524+0 records out
//! ```

use std::path::Path;
use std::time::Duration;

const PROC_ALLOW_DIO: &str = "/proc/scsi/sg/allow_dio";

/// Counters of a finished (or running) copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Blocks the copy set out to move
    pub count: u64,
    pub bs: usize,
    /// Blocks not yet read
    pub in_remaining: u64,
    pub in_partial: u64,
    /// Blocks not yet written
    pub out_remaining: u64,
    pub out_partial: u64,
    /// Blocks the write side never got to (non-zero after an error)
    pub out_unclaimed: u64,
    /// Write cursor relative to `seek`
    pub write_cursor: u64,
    pub dio_incomplete: u64,
    pub sum_resid: i64,
    pub elapsed: Option<Duration>,
    pub exit_status: i32,
}

impl CopyReport {
    /// Whole and partial records read
    pub fn records_in(&self) -> (u64, u64) {
        let full = self.count.saturating_sub(self.in_remaining);
        (full.saturating_sub(self.in_partial), self.in_partial)
    }

    /// Whole and partial records written
    pub fn records_out(&self) -> (u64, u64) {
        let full = self.count.saturating_sub(self.out_remaining);
        (full.saturating_sub(self.out_partial), self.out_partial)
    }

    /// Bytes written so far
    pub fn bytes_out(&self) -> u64 {
        self.bs as u64 * self.count.saturating_sub(self.out_remaining)
    }

    /// Remaining count and records in/out, each line starting with `prefix`
    pub fn stats_lines(&self, prefix: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if self.out_remaining != 0 {
            lines.push(format!("  remaining block count={}", self.out_remaining));
        }
        let (full, partial) = self.records_in();
        lines.push(format!("{}{}+{} records in", prefix, full, partial));
        let (full, partial) = self.records_out();
        lines.push(format!("{}{}+{} records out", prefix, full, partial));
        lines
    }

    /// Elapsed time and throughput; `None` before the clock started
    pub fn throughput_line(&self, so_far: bool) -> Option<String> {
        let elapsed = self.elapsed?;
        let mut line = format!(
            "time to transfer data {} {}.{:06} secs",
            if so_far { "so far" } else { "was" },
            elapsed.as_secs(),
            elapsed.subsec_micros()
        );
        let secs = elapsed.as_secs_f64();
        let bytes = self.bytes_out() as f64;
        if secs > 0.00001 && bytes > 511.0 {
            line.push_str(&format!(", {:.2} MB/sec", bytes / (secs * 1_000_000.0)));
        }
        Some(line)
    }

    pub fn print_stats(&self, prefix: &str) {
        for line in self.stats_lines(prefix) {
            eprintln!("{}", line);
        }
    }

    pub fn print_throughput(&self, so_far: bool) {
        if let Some(line) = self.throughput_line(so_far) {
            eprintln!("{}", line);
        }
    }

    /// Direct IO and residual diagnostics, if any
    pub fn print_diagnostics(&self) {
        if self.dio_incomplete > 0 {
            eprintln!(">> Direct IO requested but incomplete {} times", self.dio_incomplete);
            if allow_dio_disabled(Path::new(PROC_ALLOW_DIO)) {
                eprintln!(
                    ">>> {} set to '0' but should be set to '1' for direct IO",
                    PROC_ALLOW_DIO
                );
            }
        }
        if self.sum_resid != 0 {
            eprintln!(">> Non-zero sum of residual counts={}", self.sum_resid);
        }
    }
}

fn allow_dio_disabled(path: &Path) -> bool {
    std::fs::read(path)
        .map(|b| b.first() == Some(&b'0'))
        .unwrap_or(false)
}
