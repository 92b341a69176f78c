//! Error taxonomy and process exit status
//!
//! Every failure that can end a copy is folded into a [`CopyError`] whose
//! [`CopyError::exit_status`] gives the number the process exits with.
//! Workers don't unwind on device errors; they record the status in the
//! shared [`ExitStatus`] and stop the copy instead.

use crate::scsi::SenseCategory;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

/// Process exit statuses that aren't device categories
pub mod exit {
    pub const OK: i32 = 0;
    pub const SYNTAX_ERROR: i32 = 1;
    pub const FILE_ERROR: i32 = 15;
    pub const CONTRADICT: i32 = 31;
    pub const OTHER: i32 = 99;
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("contradictory options: {0}")]
    Contradiction(String),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device error: {0}")]
    Device(SenseCategory),

    #[error("request-response mismatch: expected pack_id={expected}, got {got}")]
    ProtocolMismatch { expected: i32, got: i32 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("{0}")]
    Other(String),
}

impl CopyError {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CopyError::File {
            path: path.into(),
            source,
        }
    }

    pub fn exit_status(&self) -> i32 {
        match self {
            CopyError::Syntax(_) => exit::SYNTAX_ERROR,
            CopyError::Contradiction(_) => exit::CONTRADICT,
            CopyError::File { .. } => exit::FILE_ERROR,
            CopyError::Device(cat) => cat.code(),
            CopyError::ProtocolMismatch { .. } | CopyError::OutOfMemory(_) | CopyError::Other(_) => {
                exit::OTHER
            }
        }
    }
}

/// Exit status for an error chain; the innermost `CopyError` wins
pub fn exit_status_of(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<CopyError>())
        .map_or(exit::OTHER, CopyError::exit_status)
}

/// First non-zero status recorded by any thread
#[derive(Debug, Default)]
pub struct ExitStatus(AtomicI32);

impl ExitStatus {
    pub fn new() -> Self {
        Self(AtomicI32::new(exit::OK))
    }

    /// Record `code` unless an earlier failure already set the status
    pub fn record(&self, code: i32) {
        if code != exit::OK {
            let _ = self
                .0
                .compare_exchange(exit::OK, code, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CopyError::Syntax("x".into()).exit_status(), 1);
        assert_eq!(CopyError::Contradiction("x".into()).exit_status(), 31);
        assert_eq!(
            CopyError::file("/nope", std::io::Error::from_raw_os_error(libc::ENOENT)).exit_status(),
            15
        );
        assert_eq!(CopyError::Device(SenseCategory::MediumHard).exit_status(), 3);
        assert_eq!(CopyError::ProtocolMismatch { expected: 1, got: 2 }.exit_status(), 99);
    }

    #[test]
    fn test_exit_status_through_context() {
        let err = Err::<(), _>(CopyError::Contradiction("both mmap".into()))
            .context("building configuration")
            .unwrap_err();
        assert_eq!(exit_status_of(&err), 31);
        assert_eq!(exit_status_of(&anyhow::anyhow!("plain")), 99);
    }

    #[test]
    fn test_first_failure_wins() {
        let status = ExitStatus::new();
        status.record(0);
        assert_eq!(status.get(), 0);
        status.record(3);
        status.record(6);
        assert_eq!(status.get(), 3);
    }
}
