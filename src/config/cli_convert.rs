//! Conversion of dd-style operands into a [`CopyConfig`]

use super::cli::Cli;
use super::{CopyConfig, Location, DEF_BLOCK_SIZE};
use crate::error::CopyError;
use std::path::PathBuf;

/// Parse a number with an optional multiplier suffix
///
/// Accepts decimal, hex (`0x1f` or `1fh`), the dd suffixes (`c` 1, `w` 2,
/// `b` 512, `k`/`K`/`KiB` 1024, `kB`/`KB` 1000, and likewise for m, g and
/// t) and one `x` multiplication such as `2x512`.
pub fn parse_num(s: &str) -> Result<i64, CopyError> {
    let bad = || CopyError::Syntax(format!("bad number: '{}'", s));
    let s = s.trim();
    if s.is_empty() {
        return Err(bad());
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_err(|_| bad());
    }
    if let Some(hex) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return i64::from_str_radix(hex, 16).map_err(|_| bad());
        }
    }
    if let Some((lhs, rhs)) = s.split_once('x') {
        let product = parse_num(lhs)?.checked_mul(parse_num(rhs)?);
        return product.ok_or_else(bad);
    }

    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let digits_end = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
    if digits_end == 0 {
        return Err(bad());
    }
    let value: i64 = body[..digits_end].parse().map_err(|_| bad())?;
    let multiplier = suffix_multiplier(&body[digits_end..]).ok_or_else(bad)?;
    let value = value.checked_mul(multiplier).ok_or_else(bad)?;
    Ok(if negative { -value } else { value })
}

fn suffix_multiplier(suffix: &str) -> Option<i64> {
    const KI: i64 = 1024;
    let m = match suffix {
        "" | "c" | "C" => 1,
        "w" | "W" => 2,
        "b" | "B" => 512,
        "k" | "K" | "KiB" | "kiB" => KI,
        "kB" | "KB" => 1000,
        "m" | "M" | "MiB" | "miB" => KI * KI,
        "mB" | "MB" => 1_000_000,
        "g" | "G" | "GiB" | "giB" => KI * KI * KI,
        "gB" | "GB" => 1_000_000_000,
        "t" | "T" | "TiB" | "tiB" => KI * KI * KI * KI,
        "tB" | "TB" => 1_000_000_000_000,
        _ => return None,
    };
    Some(m)
}

fn parse_non_negative(key: &str, value: &str) -> Result<u64, CopyError> {
    let n = parse_num(value)?;
    u64::try_from(n).map_err(|_| CopyError::Syntax(format!("{} cannot be negative", key)))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, CopyError> {
    let n = parse_non_negative(key, value)?;
    usize::try_from(n).map_err(|_| CopyError::Syntax(format!("{}={} is too large", key, value)))
}

fn parse_switch(key: &str, value: &str) -> Result<bool, CopyError> {
    Ok(parse_non_negative(key, value)? != 0)
}

/// Diagnostic level from `-v` and any `verbose=`/`deb=` operands, ahead
/// of the full conversion so logging can be set up first
pub fn verbosity(cli: &Cli) -> u8 {
    cli.operands
        .iter()
        .filter_map(|op| op.split_once('='))
        .filter(|(k, _)| k.starts_with("deb") || k.starts_with("verb"))
        .filter_map(|(_, v)| parse_num(v).ok())
        .map(|n| u8::try_from(n.max(0)).unwrap_or(u8::MAX))
        .fold(cli.verbose, u8::max)
}

/// Build a configuration from parsed command-line arguments
///
/// Interprets every operand; combinations across operands are checked
/// afterwards by [`super::validator::validate`].
pub fn build_config(cli: &Cli) -> Result<CopyConfig, CopyError> {
    let mut cfg = CopyConfig {
        verbose: cli.verbose,
        dry_run: cli.dry_run,
        ..CopyConfig::default()
    };
    let mut input_given = false;
    let mut ibs = None;
    let mut obs = None;
    let mut bs_given = None;

    for operand in &cli.operands {
        let (key, value) = operand
            .split_once('=')
            .ok_or_else(|| CopyError::Syntax(format!("unrecognized operand '{}'", operand)))?;
        match key {
            "ae" => {
                cfg.aen = u32::try_from(parse_non_negative(key, value)?)
                    .map_err(|_| CopyError::Syntax(format!("ae={} is too large", value)))?;
            }
            "bpt" => {
                let n = parse_num(value)?;
                if n < 1 {
                    return Err(CopyError::Syntax("bpt must be greater than 0".to_string()));
                }
                cfg.bpt = parse_usize(key, value)?;
                cfg.bpt_given = true;
            }
            "bs" => bs_given = Some(parse_num(value)?),
            "cdbsz" => {
                let n = parse_usize(key, value)?;
                cfg.cdbsz_in = n;
                cfg.cdbsz_out = n;
                cfg.cdbsz_given = true;
            }
            "coe" => {
                let on = parse_switch(key, value)?;
                cfg.in_flags.coe = on;
                cfg.out_flags.coe = on;
            }
            "count" => {
                cfg.count = if value == "-1" {
                    None
                } else {
                    Some(parse_non_negative(key, value)?)
                };
            }
            "dio" => {
                let on = parse_switch(key, value)?;
                cfg.in_flags.dio = on;
                cfg.out_flags.dio = on;
            }
            "elemsz_kb" => {
                let kb = parse_usize(key, value)?;
                let bytes = kb
                    .checked_mul(1024)
                    .ok_or_else(|| CopyError::Syntax(format!("elemsz_kb={} is too large", value)))?;
                if bytes > 0 && bytes < 4096 {
                    return Err(CopyError::Syntax("elemsz_kb cannot be less than 4 KiB".to_string()));
                }
                cfg.elem_sz = bytes;
            }
            "fua" => {
                let n = parse_non_negative(key, value)?;
                if n & 1 != 0 {
                    cfg.out_flags.fua = true;
                }
                if n & 2 != 0 {
                    cfg.in_flags.fua = true;
                }
            }
            "ibs" => ibs = Some(parse_num(value)?),
            "obs" => obs = Some(parse_num(value)?),
            "if" => {
                if input_given {
                    return Err(CopyError::Syntax("second IFILE argument".to_string()));
                }
                cfg.input = Location::parse(value);
                input_given = true;
            }
            "iflag" => cfg.in_flags.merge(value)?,
            "of" => {
                if cfg.output.is_some() {
                    return Err(CopyError::Syntax("second OFILE argument".to_string()));
                }
                cfg.output = Some(Location::parse(value));
            }
            "of2" => {
                if cfg.mirror.is_some() {
                    return Err(CopyError::Contradiction("second OFILE2 argument".to_string()));
                }
                if value != "-" {
                    cfg.mirror = Some(PathBuf::from(value));
                }
            }
            "ofreg" => {
                if cfg.record.is_some() {
                    return Err(CopyError::Contradiction("second OFREG argument".to_string()));
                }
                cfg.record = Some(PathBuf::from(value));
            }
            "oflag" => cfg.out_flags.merge(value)?,
            "seek" => cfg.seek = parse_non_negative(key, value)?,
            "skip" => cfg.skip = parse_non_negative(key, value)?,
            "sync" => cfg.do_sync = parse_switch(key, value)?,
            "thr" => cfg.threads = parse_usize(key, value)?,
            "time" => cfg.do_time = parse_switch(key, value)?,
            k if k.starts_with("deb") || k.starts_with("verb") => {
                let n = parse_non_negative(key, value)?;
                cfg.verbose = cfg.verbose.max(u8::try_from(n).unwrap_or(u8::MAX));
            }
            _ => return Err(CopyError::Syntax(format!("unrecognized operand '{}'", key))),
        }
    }

    if let Some(bs) = bs_given {
        if bs <= 0 {
            tracing::warn!("bs={} not valid, using default of {}", bs, DEF_BLOCK_SIZE);
        } else {
            cfg.bs = usize::try_from(bs).map_err(|_| CopyError::Syntax(format!("bs={} is too large", bs)))?;
        }
    }
    for (name, given) in [("ibs", ibs), ("obs", obs)] {
        if let Some(n) = given {
            if usize::try_from(n).ok() != Some(cfg.bs) {
                return Err(CopyError::Syntax(format!("{} must equal bs (bs={})", name, cfg.bs)));
            }
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cfg(args: &[&str]) -> Result<CopyConfig, CopyError> {
        let mut argv = vec!["sgcopy"];
        argv.extend_from_slice(args);
        build_config(&Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_verbosity_prescan() {
        let cli = Cli::try_parse_from(["sgcopy", "-v", "verbose=3", "bs=oops"]).unwrap();
        assert_eq!(verbosity(&cli), 3);
        let cli = Cli::try_parse_from(["sgcopy", "-vvvv", "deb=1"]).unwrap();
        assert_eq!(verbosity(&cli), 4);
    }

    #[test]
    fn test_parse_num_plain_and_hex() {
        assert_eq!(parse_num("123").unwrap(), 123);
        assert_eq!(parse_num("0x1f").unwrap(), 31);
        assert_eq!(parse_num("1fh").unwrap(), 31);
        assert_eq!(parse_num("-1").unwrap(), -1);
    }

    #[test]
    fn test_parse_num_suffixes() {
        assert_eq!(parse_num("2c").unwrap(), 2);
        assert_eq!(parse_num("2w").unwrap(), 4);
        assert_eq!(parse_num("2b").unwrap(), 1024);
        assert_eq!(parse_num("4k").unwrap(), 4096);
        assert_eq!(parse_num("4KiB").unwrap(), 4096);
        assert_eq!(parse_num("4kB").unwrap(), 4000);
        assert_eq!(parse_num("1M").unwrap(), 1 << 20);
        assert_eq!(parse_num("1MB").unwrap(), 1_000_000);
        assert_eq!(parse_num("1G").unwrap(), 1 << 30);
        assert_eq!(parse_num("1TB").unwrap(), 1_000_000_000_000);
    }

    #[test]
    fn test_parse_num_multiplication() {
        assert_eq!(parse_num("2x512").unwrap(), 1024);
        assert_eq!(parse_num("4x1k").unwrap(), 4096);
    }

    #[test]
    fn test_parse_num_rejects_garbage() {
        for s in ["", "abc", "12q", "k", "0xzz", "9999999999999999999"] {
            assert!(matches!(parse_num(s), Err(CopyError::Syntax(_))), "{}", s);
        }
    }

    #[test]
    fn test_build_basic() {
        let c = cfg(&["if=/dev/sg1", "of=/dev/sg2", "bs=4096", "bpt=64", "count=1000", "thr=8"]).unwrap();
        assert_eq!(c.input, Location::Path(PathBuf::from("/dev/sg1")));
        assert_eq!(c.output, Some(Location::Path(PathBuf::from("/dev/sg2"))));
        assert_eq!(c.bs, 4096);
        assert_eq!(c.bpt, 64);
        assert!(c.bpt_given);
        assert_eq!(c.count, Some(1000));
        assert_eq!(c.threads, 8);
    }

    #[test]
    fn test_count_minus_one_derives() {
        assert_eq!(cfg(&["count=-1"]).unwrap().count, None);
        assert!(cfg(&["count=-2"]).is_err());
    }

    #[test]
    fn test_both_side_switches() {
        let c = cfg(&["coe=1", "dio=1", "fua=3"]).unwrap();
        assert!(c.in_flags.coe && c.out_flags.coe);
        assert!(c.in_flags.dio && c.out_flags.dio);
        assert!(c.in_flags.fua && c.out_flags.fua);
        let c = cfg(&["fua=1"]).unwrap();
        assert!(c.out_flags.fua && !c.in_flags.fua);
    }

    #[test]
    fn test_duplicates() {
        assert!(matches!(cfg(&["if=a", "if=b"]), Err(CopyError::Syntax(_))));
        assert!(matches!(cfg(&["of=a", "of=b"]), Err(CopyError::Syntax(_))));
        assert!(matches!(cfg(&["of2=a", "of2=b"]), Err(CopyError::Contradiction(_))));
        assert!(matches!(cfg(&["ofreg=a", "ofreg=b"]), Err(CopyError::Contradiction(_))));
    }

    #[test]
    fn test_ibs_obs_must_match() {
        assert!(cfg(&["bs=4096", "ibs=4096", "obs=4k"]).is_ok());
        assert!(matches!(cfg(&["bs=4096", "ibs=512"]), Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_bad_bs_falls_back() {
        assert_eq!(cfg(&["bs=0"]).unwrap().bs, DEF_BLOCK_SIZE);
    }

    #[test]
    fn test_elemsz() {
        assert_eq!(cfg(&["elemsz_kb=8"]).unwrap().elem_sz, 8192);
        assert_eq!(cfg(&["elemsz_kb=0"]).unwrap().elem_sz, 0);
        assert!(matches!(cfg(&["elemsz_kb=2"]), Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_unknown_and_malformed_operands() {
        assert!(matches!(cfg(&["colour=blue"]), Err(CopyError::Syntax(_))));
        assert!(matches!(cfg(&["noequals"]), Err(CopyError::Syntax(_))));
        assert!(matches!(cfg(&["skip=-3"]), Err(CopyError::Syntax(_))));
        assert!(matches!(cfg(&["bpt=0"]), Err(CopyError::Syntax(_))));
        assert!(matches!(cfg(&["iflag=bogus"]), Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_verbosity_keys() {
        assert_eq!(cfg(&["verbose=3"]).unwrap().verbose, 3);
        assert_eq!(cfg(&["deb=2"]).unwrap().verbose, 2);
    }

    #[test]
    fn test_of2_dash_ignored() {
        assert_eq!(cfg(&["of2=-"]).unwrap().mirror, None);
    }
}
