//! Per-direction behaviour flags (`iflag=` / `oflag=`)

use crate::error::CopyError;
use std::fmt;

/// Switches given as a comma separated list to `iflag=` or `oflag=`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSet {
    /// Open output with O_APPEND
    pub append: bool,
    /// Continue on error: zero-fill bad reads, ignore bad writes
    pub coe: bool,
    /// Leave the sg reserve buffer at its default size
    pub defres: bool,
    /// Ask the sg driver for direct IO
    pub dio: bool,
    /// Open with O_DIRECT
    pub direct: bool,
    /// Set DPO in READ/WRITE cdbs
    pub dpo: bool,
    /// Open with O_SYNC
    pub dsync: bool,
    /// Open with O_EXCL
    pub excl: bool,
    /// Set FUA in READ/WRITE cdbs
    pub fua: bool,
    /// mmap the sg reserve buffer and use it as the segment buffer
    pub mmap: bool,
    /// Don't share kernel buffers between input and output
    pub noshare: bool,
    /// Tell the sg driver not to transfer data to or from user space
    pub noxfer: bool,
    /// One pair of handles for all workers
    pub same_fds: bool,
    /// Interleave read and write submissions (output side)
    pub swait: bool,
    /// Use the sg v3 interface
    pub v3: bool,
    /// Use the sg v4 interface
    pub v4: bool,
}

impl FlagSet {
    /// Parse a comma separated list of flag tokens
    ///
    /// `null` is accepted and ignored. Anything unrecognised is a syntax
    /// error.
    pub fn parse(list: &str) -> Result<Self, CopyError> {
        let mut flags = Self::default();
        flags.merge(list)?;
        Ok(flags)
    }

    /// Add the tokens in `list` to this set
    pub fn merge(&mut self, list: &str) -> Result<(), CopyError> {
        if list.is_empty() {
            return Err(CopyError::Syntax("no flag found".to_string()));
        }
        for token in list.split(',') {
            match token {
                "append" => self.append = true,
                "coe" => self.coe = true,
                "defres" => self.defres = true,
                "dio" => self.dio = true,
                "direct" => self.direct = true,
                "dpo" => self.dpo = true,
                "dsync" => self.dsync = true,
                "excl" => self.excl = true,
                "fua" => self.fua = true,
                "mmap" => self.mmap = true,
                "noshare" => self.noshare = true,
                "noxfer" => self.noxfer = true,
                "null" => {}
                "same_fds" => self.same_fds = true,
                "swait" => self.swait = true,
                "v3" => self.v3 = true,
                "v4" => self.v4 = true,
                other => return Err(CopyError::Syntax(format!("unrecognised flag: {}", other))),
            }
        }
        Ok(())
    }

    /// O_* bits these flags add when opening
    pub fn open_flags(&self) -> libc::c_int {
        let mut bits = 0;
        if self.direct {
            bits |= libc::O_DIRECT;
        }
        if self.excl {
            bits |= libc::O_EXCL;
        }
        if self.dsync {
            bits |= libc::O_SYNC;
        }
        bits
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.append, "append"),
            (self.coe, "coe"),
            (self.defres, "defres"),
            (self.dio, "dio"),
            (self.direct, "direct"),
            (self.dpo, "dpo"),
            (self.dsync, "dsync"),
            (self.excl, "excl"),
            (self.fua, "fua"),
            (self.mmap, "mmap"),
            (self.noshare, "noshare"),
            (self.noxfer, "noxfer"),
            (self.same_fds, "same_fds"),
            (self.swait, "swait"),
            (self.v3, "v3"),
            (self.v4, "v4"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let f = FlagSet::parse("coe,dio,noshare,v4").unwrap();
        assert!(f.coe && f.dio && f.noshare && f.v4);
        assert!(!f.v3 && !f.mmap);
        assert_eq!(f.to_string(), "coe,dio,noshare,v4");
    }

    #[test]
    fn test_null_is_ignored() {
        assert_eq!(FlagSet::parse("null").unwrap(), FlagSet::default());
        assert_eq!(FlagSet::default().to_string(), "none");
    }

    #[test]
    fn test_unknown_token_is_syntax_error() {
        let err = FlagSet::parse("coe,bogus").unwrap_err();
        assert!(matches!(err, CopyError::Syntax(ref m) if m.contains("bogus")));
        assert_eq!(err.exit_status(), 1);
        assert!(FlagSet::parse("").is_err());
        assert!(FlagSet::parse("coe,").is_err());
    }

    #[test]
    fn test_merge_accumulates() {
        let mut f = FlagSet::parse("fua").unwrap();
        f.merge("dpo").unwrap();
        assert!(f.fua && f.dpo);
    }

    #[test]
    fn test_open_flags() {
        let f = FlagSet::parse("direct,excl,dsync").unwrap();
        let bits = f.open_flags();
        assert_ne!(bits & libc::O_DIRECT, 0);
        assert_ne!(bits & libc::O_EXCL, 0);
        assert_eq!(bits & libc::O_SYNC, libc::O_SYNC);
    }
}
