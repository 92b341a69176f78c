//! Synchronous file IO
//!
//! Plain files, block devices, raw devices and pipes are read and written
//! with blocking syscalls. Seekable endpoints use `pread`/`pwrite` at an
//! explicit offset so workers never race on a shared file position;
//! streams (pipes, stdin, stdout) use `read`/`write` in whatever order the
//! copy's ordering gate lets them through.
//!
//! Partial transfers are continued until the full length is moved, end of
//! file is hit, or an error occurs. EINTR and EAGAIN are retried.

use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;

/// Where an operation lands in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Byte offset for pread/pwrite
    At(u64),
    /// Current file position (streams)
    Stream,
}

impl Position {
    fn advance(self, by: usize) -> Self {
        match self {
            Position::At(off) => Position::At(off + by as u64),
            Position::Stream => Position::Stream,
        }
    }
}

fn interrupted(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN))
}

/// Fill `buf` from `fd`, stopping early only at end of file
///
/// Returns the number of bytes read.
pub fn read_full(fd: RawFd, buf: &mut [u8], pos: Position) -> Result<usize> {
    let mut total = 0;
    let mut at = pos;

    while total < buf.len() {
        let remaining = &mut buf[total..];
        // SAFETY: remaining is a valid writable slice for the duration of the call
        let result = unsafe {
            match at {
                Position::At(off) => libc::pread(
                    fd,
                    remaining.as_mut_ptr() as *mut libc::c_void,
                    remaining.len(),
                    off as libc::off_t,
                ),
                Position::Stream => libc::read(fd, remaining.as_mut_ptr() as *mut libc::c_void, remaining.len()),
            }
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if interrupted(&err) {
                std::thread::yield_now();
                continue;
            }
            return Err(err).context(format!("read failed: fd={}, at={:?}, length={}", fd, at, remaining.len()));
        }
        if result == 0 {
            break;
        }

        let n = result as usize;
        total += n;
        at = at.advance(n);
    }

    Ok(total)
}

/// Write all of `buf` to `fd`
pub fn write_full(fd: RawFd, buf: &[u8], pos: Position) -> Result<usize> {
    let mut total = 0;
    let mut at = pos;

    while total < buf.len() {
        let remaining = &buf[total..];
        // SAFETY: remaining is a valid slice for the duration of the call
        let result = unsafe {
            match at {
                Position::At(off) => libc::pwrite(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                    off as libc::off_t,
                ),
                Position::Stream => libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len()),
            }
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if interrupted(&err) {
                std::thread::yield_now();
                continue;
            }
            return Err(err).context(format!("write failed: fd={}, at={:?}, length={}", fd, at, remaining.len()));
        }
        if result == 0 {
            anyhow::bail!("write made no progress: fd={}, at={:?}", fd, at);
        }

        let n = result as usize;
        total += n;
        at = at.advance(n);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    #[test]
    fn test_read_at_offset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("in.dat");
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = File::open(&path).unwrap();
        let mut buf = vec![0u8; 1024];
        let n = read_full(file.as_raw_fd(), &mut buf, Position::At(512)).unwrap();
        assert_eq!(n, 1024);
        assert_eq!(&buf[..], &data[512..1536]);
    }

    #[test]
    fn test_short_read_at_eof() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("short.dat");
        std::fs::write(&path, vec![7u8; 700]).unwrap();

        let file = File::open(&path).unwrap();
        let mut buf = vec![0u8; 1024];
        let n = read_full(file.as_raw_fd(), &mut buf, Position::At(0)).unwrap();
        assert_eq!(n, 700);
    }

    #[test]
    fn test_stream_read_from_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut writer = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fds[1]) };
        let reader = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fds[0]) };
        writer.write_all(&[1, 2, 3, 4]).unwrap();
        drop(writer);

        let mut buf = [0u8; 8];
        let n = read_full(reader.as_raw_fd(), &mut buf, Position::Stream).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_write_at_offset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.dat");
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();

        write_full(file.as_raw_fd(), &[9u8; 512], Position::At(1024)).unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 1536);
        assert!(on_disk[..1024].iter().all(|&b| b == 0));
        assert!(on_disk[1024..].iter().all(|&b| b == 9));
    }

    #[test]
    fn test_bad_fd_reports_context() {
        let mut buf = [0u8; 16];
        let err = read_full(-1, &mut buf, Position::At(0)).unwrap_err();
        assert!(err.to_string().contains("read failed"));
    }
}
