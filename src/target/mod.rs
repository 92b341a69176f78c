//! Copy endpoints
//!
//! An endpoint is what the copy reads from or writes to. There are three
//! kinds:
//!
//! - **Device**: an sg handle, driven through the command transports
//! - **File**: regular files, block and raw devices, pipes and the
//!   standard streams, driven with plain read/write
//! - **Discard**: output thrown away (`/dev/null`, `.` or no `of=`)
//!
//! [`Endpoints::open`] classifies each path given on the command line,
//! applies the rules that depend on what the endpoints turn out to be, and
//! opens them.
//!
//! # Example
//!
//! ```no_run
//! use sgcopy::config::{CopyConfig, Location};
//! use sgcopy::target::Endpoints;
//!
//! let mut cfg = CopyConfig {
//!     input: Location::Path("/dev/sg1".into()),
//!     output: Some(Location::Path("/tmp/copy.img".into())),
//!     ..CopyConfig::default()
//! };
//! let endpoints = Endpoints::open(&mut cfg).unwrap();
//! assert!(endpoints.input.is_device());
//! ```

pub mod block;
pub mod device;
pub mod file;

use crate::config::{CopyConfig, FlagSet, Location};
use crate::engine::{Transport, Variant};
use crate::error::CopyError;
use crate::util::buffer::MappedRegion;
use crate::Result;
use device::{read_capacity, SgOpener};
use file::FileEndpoint;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const MEM_MAJOR: u64 = 1;
const DEV_NULL_MINOR: u64 = 3;
const SCSI_TAPE_MAJOR: u64 = 9;
const SCSI_GENERIC_MAJOR: u64 = 21;
const RAW_MAJOR: u64 = 162;
const RAW_MAJOR_ALT: u64 = 255;

/// What a path designates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `/dev/null` or `.`
    Discard,
    /// SCSI generic character device
    Sg,
    /// Raw character device
    Raw,
    /// SCSI tape, not supported
    Tape,
    Block,
    Regular,
    /// Pipes, sockets and other character devices
    Other,
    /// stat() failed, usually because the path doesn't exist
    Error,
}

fn dev_major(rdev: u64) -> u64 {
    ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff)
}

fn dev_minor(rdev: u64) -> u64 {
    ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)
}

/// Classify `path` by what stat() says it is
pub fn classify(path: &Path) -> FileKind {
    if path == Path::new(".") {
        return FileKind::Discard;
    }
    let md = match std::fs::metadata(path) {
        Ok(md) => md,
        Err(_) => return FileKind::Error,
    };
    let ft = md.file_type();
    if ft.is_char_device() {
        let (major, minor) = (dev_major(md.rdev()), dev_minor(md.rdev()));
        match major {
            MEM_MAJOR if minor == DEV_NULL_MINOR => FileKind::Discard,
            SCSI_GENERIC_MAJOR => FileKind::Sg,
            RAW_MAJOR | RAW_MAJOR_ALT => FileKind::Raw,
            SCSI_TAPE_MAJOR => FileKind::Tape,
            _ => FileKind::Other,
        }
    } else if ft.is_block_device() {
        FileKind::Block
    } else if ft.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    }
}

/// A freshly opened sg handle
pub struct OpenedDevice {
    pub transport: Arc<dyn Transport>,
    /// The handle's reserve buffer, when opened with mmap
    pub mapping: Option<MappedRegion>,
}

/// Opens new handles onto one device
///
/// Workers that don't share handles open their own through this.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, mmap_len: Option<usize>) -> Result<OpenedDevice>;

    fn describe(&self) -> String;
}

/// A device endpoint: an opener plus the handle opened at setup
pub struct DeviceEndpoint {
    name: String,
    opener: Arc<dyn DeviceOpener>,
    shared: Arc<dyn Transport>,
}

impl DeviceEndpoint {
    /// Open the setup handle; later handles come from [`Self::open_handle`]
    pub fn open(name: impl Into<String>, opener: Arc<dyn DeviceOpener>) -> Result<Self> {
        let name = name.into();
        let dev = opener.open(None)?;
        info!("opened {}", opener.describe());
        Ok(Self {
            name,
            opener,
            shared: dev.transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle opened at setup, used for capacity, sync and `same_fds`
    pub fn shared(&self) -> &Arc<dyn Transport> {
        &self.shared
    }

    pub fn open_handle(&self, mmap_len: Option<usize>) -> Result<OpenedDevice> {
        self.opener.open(mmap_len)
    }

    pub fn variant(&self) -> Variant {
        self.shared.variant()
    }
}

pub enum Endpoint {
    Device(DeviceEndpoint),
    File(FileEndpoint),
    Discard,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        match self {
            Endpoint::Device(d) => d.name(),
            Endpoint::File(f) => f.name(),
            Endpoint::Discard => "<discard>",
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Endpoint::Device(_))
    }

    pub fn is_discard(&self) -> bool {
        matches!(self, Endpoint::Discard)
    }

    pub fn as_device(&self) -> Option<&DeviceEndpoint> {
        match self {
            Endpoint::Device(d) => Some(d),
            _ => None,
        }
    }

    /// Capacity in `bs` blocks; `None` when unknown
    pub fn capacity(&self, bs: usize, is_input: bool, pack_id: i32) -> Option<u64> {
        match self {
            Endpoint::Device(d) => match read_capacity(d.shared().as_ref(), pack_id) {
                Ok(cap) => {
                    if cap.block_size as usize != bs {
                        warn!(
                            "logical block size on {} confusion: bs={}, device claims={}",
                            d.name(),
                            bs,
                            cap.block_size
                        );
                    }
                    Some(cap.blocks)
                }
                Err(e) => {
                    warn!("unable to read capacity on {}: {:#}", d.name(), e);
                    None
                }
            },
            Endpoint::File(f) => f.capacity(bs, is_input),
            Endpoint::Discard => None,
        }
    }
}

/// File receiving each segment's user-space buffer (`ofreg=`)
#[derive(Debug)]
pub struct RecordSink {
    pub name: String,
    pub file: File,
}

impl RecordSink {
    /// Open the sink; it must be a regular file, a pipe, `/dev/null` or
    /// not exist yet
    pub fn open(path: &Path) -> Result<Self> {
        let acceptable = match std::fs::metadata(path) {
            Ok(md) => md.file_type().is_file() || md.file_type().is_fifo() || classify(path) == FileKind::Discard,
            Err(_) => true,
        };
        if !acceptable {
            return Err(CopyError::Syntax(format!(
                "ofreg={} must be a regular file, a pipe or /dev/null",
                path.display()
            ))
            .into());
        }
        let is_regular = std::fs::metadata(path).map(|md| md.is_file()).unwrap_or(true);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(is_regular)
            .mode(0o666)
            .open(path)
            .map_err(|e| CopyError::file(path, e))?;
        Ok(Self {
            name: path.display().to_string(),
            file,
        })
    }
}

/// Everything a copy reads from and writes to
pub struct Endpoints {
    pub input: Endpoint,
    pub output: Endpoint,
    /// Secondary output (`of2=`)
    pub mirror: Option<Endpoint>,
    pub record: Option<RecordSink>,
}

fn variant_of(flags: &FlagSet) -> Variant {
    if flags.v4 {
        Variant::V4
    } else {
        Variant::V3
    }
}

fn clear_version_flags(flags: &mut FlagSet, side: &str) {
    if flags.v3 || flags.v4 {
        warn!("{}flag v3/v4 only applies to sg devices, ignored", side);
        flags.v3 = false;
        flags.v4 = false;
    }
}

/// Promote both sg sides to v4 when one asks for it and the other doesn't
/// insist on v3
fn reconcile_versions(inf: &mut FlagSet, outf: &mut FlagSet) {
    if inf.v4 && !outf.v3 && !outf.v4 {
        info!("iflag=v4 given, promoting output to v4 as well");
        outf.v4 = true;
    }
    if outf.v4 && !inf.v3 && !inf.v4 {
        info!("oflag=v4 given, promoting input to v4 as well");
        inf.v4 = true;
    }
}

impl Endpoints {
    /// Classify and open every endpoint named in `cfg`
    ///
    /// Adjusts `cfg`'s flags for what the endpoints turn out to be.
    pub fn open(cfg: &mut CopyConfig) -> Result<Self> {
        let in_kind = match &cfg.input {
            Location::Std => FileKind::Other,
            Location::Path(p) => classify(p),
        };
        let out_kind = match &cfg.output {
            None => FileKind::Discard,
            Some(Location::Std) => FileKind::Other,
            Some(Location::Path(p)) => classify(p),
        };

        match in_kind {
            FileKind::Error => {
                let path = cfg.input.to_string();
                let err = std::fs::metadata(&path).err().unwrap_or_else(|| std::io::Error::from_raw_os_error(libc::ENOENT));
                return Err(CopyError::file(path, err).into());
            }
            FileKind::Tape => {
                return Err(CopyError::file(
                    cfg.input.to_string(),
                    std::io::Error::new(std::io::ErrorKind::Unsupported, "SCSI tape devices not supported"),
                )
                .into())
            }
            _ => {}
        }
        if out_kind == FileKind::Tape {
            return Err(CopyError::file(
                cfg.output.as_ref().map_or_else(String::new, |o| o.to_string()),
                std::io::Error::new(std::io::ErrorKind::Unsupported, "SCSI tape devices not supported"),
            )
            .into());
        }

        if in_kind != FileKind::Sg {
            clear_version_flags(&mut cfg.in_flags, "i");
        }
        if out_kind != FileKind::Sg {
            clear_version_flags(&mut cfg.out_flags, "o");
        }
        if in_kind == FileKind::Sg && out_kind == FileKind::Sg {
            reconcile_versions(&mut cfg.in_flags, &mut cfg.out_flags);
        }

        let reserve_len = cfg.segment_bytes();
        let input = match (&cfg.input, in_kind) {
            (Location::Std, _) => Endpoint::File(FileEndpoint::stdin()?),
            (Location::Path(p), FileKind::Sg) => {
                let opener = SgOpener::new(p.clone(), cfg.in_flags, reserve_len, cfg.elem_sz, variant_of(&cfg.in_flags));
                Endpoint::Device(DeviceEndpoint::open(p.display().to_string(), Arc::new(opener))?)
            }
            (Location::Path(p), FileKind::Discard) => {
                Endpoint::File(FileEndpoint::open_input(Path::new("/dev/null"), FileKind::Discard, &cfg.in_flags).map_err(
                    |e| e.context(format!("opening {} as input", p.display())),
                )?)
            }
            (Location::Path(p), kind) => Endpoint::File(FileEndpoint::open_input(p, kind, &cfg.in_flags)?),
        };
        if let Endpoint::File(f) = &input {
            f.require_offset(cfg.skip, "skip")?;
        }

        let output = match (&cfg.output, out_kind) {
            (None, _) | (_, FileKind::Discard) => Endpoint::Discard,
            (Some(Location::Std), _) => Endpoint::File(FileEndpoint::stdout()?),
            (Some(Location::Path(p)), FileKind::Sg) => {
                let opener = SgOpener::new(p.clone(), cfg.out_flags, reserve_len, cfg.elem_sz, variant_of(&cfg.out_flags));
                Endpoint::Device(DeviceEndpoint::open(p.display().to_string(), Arc::new(opener))?)
            }
            (Some(Location::Path(p)), kind) => Endpoint::File(FileEndpoint::open_output(p, kind, &cfg.out_flags)?),
        };
        if let Endpoint::File(f) = &output {
            f.require_offset(cfg.seek, "seek")?;
        }

        let mirror = match &cfg.mirror {
            None => None,
            Some(p) => match classify(p) {
                FileKind::Discard => None,
                FileKind::Sg => {
                    let opener =
                        SgOpener::new(p.clone(), cfg.out_flags, reserve_len, cfg.elem_sz, variant_of(&cfg.out_flags));
                    Some(Endpoint::Device(DeviceEndpoint::open(p.display().to_string(), Arc::new(opener))?))
                }
                kind => {
                    let f = FileEndpoint::open_output(p, kind, &FlagSet::default())?;
                    f.require_offset(cfg.seek, "seek")?;
                    Some(Endpoint::File(f))
                }
            },
        };

        let record = cfg.record.as_deref().map(RecordSink::open).transpose()?;

        Ok(Self {
            input,
            output,
            mirror,
            record,
        })
    }

    /// Both primary endpoints are sg devices
    pub fn both_devices(&self) -> bool {
        self.input.is_device() && self.output.is_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_classify() {
        assert_eq!(classify(Path::new(".")), FileKind::Discard);
        assert_eq!(classify(Path::new("/dev/null")), FileKind::Discard);
        assert_eq!(classify(Path::new("/definitely/not/here")), FileKind::Error);
        let tmp = NamedTempFile::new().unwrap();
        assert_eq!(classify(tmp.path()), FileKind::Regular);
        assert_eq!(classify(Path::new("/dev/zero")), FileKind::Other);
    }

    #[test]
    fn test_dev_numbers() {
        // makedev(21, 3) in the glibc encoding
        let rdev = (21u64 << 8) | 3;
        assert_eq!(dev_major(rdev), 21);
        assert_eq!(dev_minor(rdev), 3);
    }

    #[test]
    fn test_version_flags() {
        let mut inf = FlagSet::parse("v4").unwrap();
        let mut outf = FlagSet::default();
        reconcile_versions(&mut inf, &mut outf);
        assert!(outf.v4);

        let mut inf = FlagSet::parse("v4").unwrap();
        let mut outf = FlagSet::parse("v3").unwrap();
        reconcile_versions(&mut inf, &mut outf);
        assert!(outf.v3 && !outf.v4);

        let mut f = FlagSet::parse("v3,coe").unwrap();
        clear_version_flags(&mut f, "i");
        assert!(!f.v3 && f.coe);
    }

    #[test]
    fn test_open_file_to_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, vec![1u8; 4096]).unwrap();
        let mut cfg = CopyConfig {
            input: Location::Path(src),
            output: Some(Location::Path(dir.path().join("dst"))),
            in_flags: FlagSet::parse("v4").unwrap(),
            ..CopyConfig::default()
        };
        let ep = Endpoints::open(&mut cfg).unwrap();
        assert!(!cfg.in_flags.v4);
        assert_eq!(ep.input.capacity(512, true, 1), Some(8));
        assert_eq!(ep.output.capacity(512, false, 2), None);
        assert!(!ep.both_devices());
        assert!(dir.path().join("dst").exists());
    }

    #[test]
    fn test_missing_input_is_file_error() {
        let mut cfg = CopyConfig {
            input: Location::Path(PathBuf::from("/no/such/input")),
            output: None,
            ..CopyConfig::default()
        };
        let err = Endpoints::open(&mut cfg).err().unwrap();
        assert_eq!(crate::error::exit_status_of(&err), 15);
    }

    #[test]
    fn test_no_output_discards() {
        let tmp = NamedTempFile::new().unwrap();
        let mut cfg = CopyConfig {
            input: Location::Path(tmp.path().to_path_buf()),
            output: None,
            ..CopyConfig::default()
        };
        let ep = Endpoints::open(&mut cfg).unwrap();
        assert!(ep.output.is_discard());
    }

    #[test]
    fn test_record_sink_rules() {
        let dir = tempdir().unwrap();
        assert!(RecordSink::open(&dir.path().join("new.rec")).is_ok());
        assert!(RecordSink::open(Path::new("/dev/null")).is_ok());
        let err = RecordSink::open(dir.path()).unwrap_err();
        assert_eq!(crate::error::exit_status_of(&err), 1);
    }
}
