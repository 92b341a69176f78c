//! sgcopy - multi-threaded block copy over SCSI generic devices
//!
//! sgcopy copies a range of logical blocks from an input to an output the
//! way `dd` does, but with a pool of worker threads. Reads from several
//! workers overlap; writes are put back into address order before they
//! reach the output.
//!
//! # Architecture
//!
//! - **SCSI layer**: READ/WRITE cdb encoding, sense classification and the
//!   sg driver ABI
//! - **Transports**: v3 (`write`/`read`) and v4 (`SG_IOSUBMIT`/`SG_IORECEIVE`)
//!   submission behind one trait, plus an in-memory mock
//! - **Targets**: sg devices, block devices, regular files, pipes and the
//!   discard sink
//! - **Coordinator**: shared read/write state, the segment cursor and the
//!   copy driver
//! - **Workers**: the per-segment read/write loop, buffer sharing, mirror
//!   and record outputs

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod scsi;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

pub use config::CopyConfig;
pub use coordinator::{copy, RunOptions};
pub use error::CopyError;
pub use stats::CopyReport;

/// Result type used throughout sgcopy
pub type Result<T> = anyhow::Result<T>;
