//! Configuration validation
//!
//! Cross-operand checks that don't need the endpoints opened. Rules that
//! depend on what an endpoint turns out to be live in [`crate::target`].

use super::*;
use crate::error::CopyError;

fn syntax(msg: &str) -> Result<(), CopyError> {
    Err(CopyError::Syntax(msg.to_string()))
}

/// Validate and normalize a configuration
///
/// Fills in defaults that depend on other operands (`bpt` for large block
/// sizes) and drops flags that have no effect.
pub fn validate(cfg: &mut CopyConfig) -> Result<(), CopyError> {
    validate_endpoints(cfg)?;
    validate_sizes(cfg)?;
    validate_flags(cfg)?;
    validate_threads(cfg)?;
    Ok(())
}

/// Validate input/output selection
pub fn validate_endpoints(cfg: &CopyConfig) -> Result<(), CopyError> {
    if cfg.input == Location::Std && matches!(cfg.output, None | Some(Location::Std)) {
        return syntax("can't have both 'if' as stdin and 'of' as stdout");
    }
    if cfg.output.is_none() {
        tracing::warn!("of=OFILE not given so only read from IFILE, to output to stdout use 'of=-'");
    }
    Ok(())
}

/// Validate block, transfer and cdb sizes
pub fn validate_sizes(cfg: &mut CopyConfig) -> Result<(), CopyError> {
    if cfg.bpt < 1 {
        return syntax("bpt must be greater than 0");
    }
    if cfg.bs >= 2048 && !cfg.bpt_given {
        cfg.bpt = DEF_BPT_LARGE_BS;
    }
    for size in [cfg.cdbsz_in, cfg.cdbsz_out] {
        if ![6, 10, 12, 16].contains(&size) {
            return Err(CopyError::Syntax(format!("cdbsz={} not supported, use 6, 10, 12 or 16", size)));
        }
    }
    if cfg.segment_bytes() == 0 || cfg.bs.checked_mul(cfg.bpt).is_none() {
        return syntax("bs * bpt is out of range");
    }
    Ok(())
}

/// Validate flag combinations within and across directions
pub fn validate_flags(cfg: &mut CopyConfig) -> Result<(), CopyError> {
    let (inf, outf) = (&cfg.in_flags, &cfg.out_flags);

    if outf.append && cfg.seek > 0 {
        return syntax("Can't use both append and seek switches");
    }
    if inf.mmap && outf.mmap {
        return syntax("mmap flag on both IFILE and OFILE doesn't work");
    }
    if outf.mmap && !(inf.noshare || outf.noshare) {
        return syntax("oflag=mmap needs either iflag=noshare or oflag=noshare");
    }
    if (inf.mmap || outf.mmap) && (inf.same_fds || outf.same_fds) {
        return syntax("can't have both 'mmap' and 'same_fds' flags");
    }
    if (inf.dio && !inf.noshare) || (outf.dio && !outf.noshare) {
        return syntax("dio flag can only be used with noshare flag");
    }
    if (inf.mmap && inf.defres) || (outf.mmap && outf.defres) {
        return Err(CopyError::Contradiction(
            "mmap needs a reserve buffer of bs*bpt, can't combine with defres".to_string(),
        ));
    }
    if inf.swait && !outf.swait {
        tracing::warn!("iflag=swait is ignored, it should be oflag=swait");
        cfg.in_flags.swait = false;
    }
    Ok(())
}

/// Validate worker thread count
pub fn validate_threads(cfg: &CopyConfig) -> Result<(), CopyError> {
    if cfg.threads < 1 || cfg.threads > MAX_NUM_THREADS {
        return Err(CopyError::Syntax(format!(
            "too few or too many threads requested, must be 1 to {}",
            MAX_NUM_THREADS
        )));
    }
    let cpus = num_cpus::get();
    if cfg.threads > cpus {
        tracing::info!("{} worker threads on {} CPUs", cfg.threads, cpus);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base() -> CopyConfig {
        CopyConfig {
            input: Location::Path(PathBuf::from("/dev/sg1")),
            output: Some(Location::Path(PathBuf::from("/dev/sg2"))),
            ..CopyConfig::default()
        }
    }

    fn with_flags(inf: &str, outf: &str) -> CopyConfig {
        let mut c = base();
        c.in_flags = FlagSet::parse(inf).unwrap();
        c.out_flags = FlagSet::parse(outf).unwrap();
        c
    }

    #[test]
    fn test_valid_config() {
        let mut c = base();
        assert!(validate(&mut c).is_ok());
        assert_eq!(c.bpt, DEF_BLOCKS_PER_TRANSFER);
    }

    #[test]
    fn test_large_bs_lowers_default_bpt() {
        let mut c = base();
        c.bs = 4096;
        validate(&mut c).unwrap();
        assert_eq!(c.bpt, DEF_BPT_LARGE_BS);

        let mut c = base();
        c.bs = 4096;
        c.bpt = 64;
        c.bpt_given = true;
        validate(&mut c).unwrap();
        assert_eq!(c.bpt, 64);
    }

    #[test]
    fn test_stdin_to_stdout_rejected() {
        let mut c = CopyConfig {
            output: Some(Location::Std),
            ..CopyConfig::default()
        };
        assert!(matches!(validate(&mut c), Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_missing_output_is_discard() {
        let mut c = base();
        c.output = None;
        assert!(validate(&mut c).is_ok());
    }

    #[test]
    fn test_append_with_seek() {
        let mut c = with_flags("null", "append");
        c.seek = 3;
        assert!(matches!(validate(&mut c), Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_mmap_rules() {
        assert!(validate(&mut with_flags("mmap", "mmap,noshare")).is_err());
        assert!(validate(&mut with_flags("null", "mmap")).is_err());
        assert!(validate(&mut with_flags("null", "mmap,noshare")).is_ok());
        assert!(validate(&mut with_flags("mmap", "null")).is_ok());
        assert!(validate(&mut with_flags("mmap,same_fds", "null")).is_err());
        assert!(matches!(
            validate(&mut with_flags("mmap,defres", "null")),
            Err(CopyError::Contradiction(_))
        ));
    }

    #[test]
    fn test_dio_needs_noshare() {
        assert!(validate(&mut with_flags("dio", "null")).is_err());
        assert!(validate(&mut with_flags("dio,noshare", "null")).is_ok());
    }

    #[test]
    fn test_swait_on_input_only_is_dropped() {
        let mut c = with_flags("swait", "null");
        validate(&mut c).unwrap();
        assert!(!c.in_flags.swait);
        let mut c = with_flags("swait", "swait");
        validate(&mut c).unwrap();
        assert!(c.in_flags.swait && c.out_flags.swait);
    }

    #[test]
    fn test_thread_range() {
        for (n, ok) in [(0, false), (1, true), (16, true), (17, false)] {
            let mut c = base();
            c.threads = n;
            assert_eq!(validate(&mut c).is_ok(), ok, "threads={}", n);
        }
    }

    #[test]
    fn test_cdb_size() {
        let mut c = base();
        c.cdbsz_in = 8;
        assert!(matches!(validate(&mut c), Err(CopyError::Syntax(_))));
    }
}
