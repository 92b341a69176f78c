//! Configuration module
//!
//! Handles dd-style operand parsing and validation. The result is a
//! [`CopyConfig`] that the endpoint layer opens and the coordinator runs.

pub mod cli;
pub mod cli_convert;
pub mod flags;
pub mod validator;

pub use flags::FlagSet;

use std::fmt;
use std::path::PathBuf;

pub const DEF_BLOCK_SIZE: usize = 512;
pub const DEF_BLOCKS_PER_TRANSFER: usize = 128;
/// Blocks per transfer when `bs` is 2048 or more and `bpt` wasn't given
pub const DEF_BPT_LARGE_BS: usize = 32;
pub const DEF_CDB_SIZE: usize = 10;
pub const DEF_NUM_THREADS: usize = 4;
pub const MAX_NUM_THREADS: usize = 16;

/// Where a copy reads from or writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// stdin for input, stdout for output (`-`)
    Std,
    Path(PathBuf),
}

impl Location {
    pub fn parse(s: &str) -> Self {
        if s == "-" {
            Location::Std
        } else {
            Location::Path(PathBuf::from(s))
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Std => write!(f, "-"),
            Location::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Complete copy configuration
#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub input: Location,
    /// `None` discards everything read
    pub output: Option<Location>,
    /// Secondary output (`of2=`)
    pub mirror: Option<PathBuf>,
    /// File receiving each segment's user-space buffer (`ofreg=`)
    pub record: Option<PathBuf>,

    /// Logical block size in bytes
    pub bs: usize,
    /// Blocks per transfer (segment size)
    pub bpt: usize,
    pub bpt_given: bool,
    pub cdbsz_in: usize,
    pub cdbsz_out: usize,
    pub cdbsz_given: bool,
    /// Blocks to copy; `None` derives it from the endpoint capacities
    pub count: Option<u64>,
    /// Blocks skipped at the start of the input
    pub skip: u64,
    /// Blocks skipped at the start of the output
    pub seek: u64,
    pub threads: usize,
    /// Abort every Nth v4 command (0 = never)
    pub aen: u32,
    /// Scatter-gather element size in bytes (0 = driver default)
    pub elem_sz: usize,

    pub in_flags: FlagSet,
    pub out_flags: FlagSet,

    pub verbose: u8,
    pub dry_run: u8,
    /// SYNCHRONIZE CACHE on device outputs when done
    pub do_sync: bool,
    /// Report elapsed time and throughput
    pub do_time: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            input: Location::Std,
            output: None,
            mirror: None,
            record: None,
            bs: DEF_BLOCK_SIZE,
            bpt: DEF_BLOCKS_PER_TRANSFER,
            bpt_given: false,
            cdbsz_in: DEF_CDB_SIZE,
            cdbsz_out: DEF_CDB_SIZE,
            cdbsz_given: false,
            count: None,
            skip: 0,
            seek: 0,
            threads: DEF_NUM_THREADS,
            aen: 0,
            elem_sz: 0,
            in_flags: FlagSet::default(),
            out_flags: FlagSet::default(),
            verbose: 0,
            dry_run: 0,
            do_sync: false,
            do_time: true,
        }
    }
}

impl CopyConfig {
    /// Bytes moved by one full segment
    pub fn segment_bytes(&self) -> usize {
        self.bs * self.bpt
    }

    pub fn summary(&self) -> String {
        format!(
            "if={} of={} bs={} bpt={} thr={} iflag={} oflag={}",
            self.input,
            self.output.as_ref().map_or_else(|| "<discard>".to_string(), |o| o.to_string()),
            self.bs,
            self.bpt,
            self.threads,
            self.in_flags,
            self.out_flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_parse() {
        assert_eq!(Location::parse("-"), Location::Std);
        assert_eq!(Location::parse("/dev/sg1"), Location::Path(PathBuf::from("/dev/sg1")));
        assert_eq!(Location::parse("/tmp/x").to_string(), "/tmp/x");
    }

    #[test]
    fn test_defaults() {
        let c = CopyConfig::default();
        assert_eq!(c.bs, 512);
        assert_eq!(c.bpt, 128);
        assert_eq!(c.threads, 4);
        assert_eq!(c.segment_bytes(), 65536);
        assert!(c.do_time && !c.do_sync);
        assert!(c.summary().contains("of=<discard>"));
    }
}
