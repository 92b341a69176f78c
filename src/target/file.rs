//! File endpoints
//!
//! Regular files, block devices, raw devices, pipes and the standard
//! streams. All of them move data with blocking `read`/`write` calls (see
//! [`crate::engine::sync`]); the only difference between them is whether
//! an operation can name its offset.
//!
//! # Positioning
//!
//! Seekable endpoints are accessed with `pread`/`pwrite` at
//! `(skip|seek + block) * bs`, so workers never share a file position.
//! Streams and append-mode outputs rely on the copy's ordering: reads are
//! claimed in order under the read lock and writes commit in order under
//! the write lock.

use super::block::BlockGeometry;
use super::FileKind;
use crate::config::FlagSet;
use crate::engine::sync::{read_full, write_full, Position};
use crate::error::CopyError;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use tracing::warn;

/// An open non-sg endpoint
#[derive(Debug)]
pub struct FileEndpoint {
    name: String,
    file: File,
    kind: FileKind,
    seekable: bool,
    append: bool,
}

fn dup_std(fd: RawFd, name: &str) -> Result<File> {
    // SAFETY: dup of a standard stream; the new fd is owned by the File
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        return Err(CopyError::file(name, io::Error::last_os_error()).into());
    }
    // SAFETY: new_fd is a fresh descriptor nobody else owns
    Ok(unsafe { File::from_raw_fd(new_fd) })
}

fn is_seekable(file: &File) -> bool {
    // SAFETY: plain lseek on an open descriptor
    unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_CUR) >= 0 }
}

impl FileEndpoint {
    fn new(name: String, file: File, kind: FileKind, append: bool) -> Self {
        let seekable = is_seekable(&file);
        Self {
            name,
            file,
            kind,
            seekable,
            append,
        }
    }

    /// Standard input
    pub fn stdin() -> Result<Self> {
        let file = dup_std(libc::STDIN_FILENO, "<stdin>")?;
        Ok(Self::new("<stdin>".to_string(), file, FileKind::Other, false))
    }

    /// Standard output
    pub fn stdout() -> Result<Self> {
        let file = dup_std(libc::STDOUT_FILENO, "<stdout>")?;
        Ok(Self::new("<stdout>".to_string(), file, FileKind::Other, false))
    }

    /// Open `path` for reading
    pub fn open_input(path: &Path, kind: FileKind, flags: &FlagSet) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(flags.open_flags())
            .open(path)
            .map_err(|e| CopyError::file(path, e))?;
        Ok(Self::new(path.display().to_string(), file, kind, false))
    }

    /// Open `path` for writing, creating a regular file if needed
    ///
    /// Raw devices are opened write-only without O_CREAT.
    pub fn open_output(path: &Path, kind: FileKind, flags: &FlagSet) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true);
        if kind != FileKind::Raw {
            options.create(true).mode(0o666);
        }
        if flags.append {
            options.append(true);
        }
        let custom_flags = flags.open_flags();
        if custom_flags != 0 {
            options.custom_flags(custom_flags);
        }
        let file = options.open(path).map_err(|e| CopyError::file(path, e))?;
        Ok(Self::new(path.display().to_string(), file, kind, flags.append))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Fail unless the endpoint can be positioned `blocks` blocks in
    pub fn require_offset(&self, blocks: u64, what: &str) -> Result<()> {
        if blocks > 0 && !self.seekable {
            let err = CopyError::file(&self.name, io::Error::from_raw_os_error(libc::ESPIPE));
            return Err(anyhow::Error::from(err).context(format!("couldn't {} to required position", what)));
        }
        Ok(())
    }

    fn position(&self, block: u64, bs: usize) -> Position {
        if self.seekable && !self.append {
            Position::At(block * bs as u64)
        } else {
            Position::Stream
        }
    }

    /// Read up to `buf.len()` bytes starting at block `block`
    pub fn read_blocks(&self, buf: &mut [u8], block: u64, bs: usize) -> Result<usize> {
        read_full(self.fd(), buf, self.position(block, bs))
    }

    /// Write `buf` starting at block `block`
    pub fn write_blocks(&self, buf: &[u8], block: u64, bs: usize) -> Result<usize> {
        write_full(self.fd(), buf, self.position(block, bs))
    }

    /// Capacity in `bs` blocks, when it can be known
    ///
    /// Regular input files count a trailing partial block as a whole one.
    /// Regular output files grow, so they have no capacity.
    pub fn capacity(&self, bs: usize, is_input: bool) -> Option<u64> {
        match self.kind {
            FileKind::Block => match BlockGeometry::detect(&self.file, Path::new(&self.name)) {
                Ok(geo) => {
                    let blocks = geo.blocks_of(bs);
                    if blocks.is_none() {
                        warn!(
                            "logical block size on {} confusion: bs={}, device claims={}",
                            self.name, bs, geo.sector_size
                        );
                    }
                    blocks
                }
                Err(e) => {
                    warn!("unable to read block capacity on {}: {:#}", self.name, e);
                    None
                }
            },
            FileKind::Regular if is_input => match self.file.metadata() {
                Ok(md) => Some(md.len().div_ceil(bs as u64)),
                Err(e) => {
                    warn!("unable to stat {}: {}", self.name, e);
                    None
                }
            },
            _ => None,
        }
    }
}
