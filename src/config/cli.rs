//! CLI argument parsing using clap
//!
//! The copy is driven by dd-style `key=value` operands, which clap collects
//! as positionals and [`super::cli_convert`] interprets. Only the few
//! conventional switches are real clap options.

use clap::Parser;

/// sgcopy - copy blocks between files and SCSI generic devices with a
/// thread pool
#[derive(Parser, Debug)]
#[command(name = "sgcopy")]
#[command(version, about, long_about = None)]
#[command(after_help = OPERANDS_HELP)]
pub struct Cli {
    /// dd-style operands (e.g. if=/dev/sg1 of=/dev/sg2 bs=512 thr=8)
    #[arg(value_name = "KEY=VALUE")]
    pub operands: Vec<String>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Set up everything but don't copy (repeat to skip worker setup too)
    #[arg(short = 'd', long = "dry-run", visible_alias = "dry_run", action = clap::ArgAction::Count)]
    pub dry_run: u8,
}

const OPERANDS_HELP: &str = "\
Operands:
  ae=AEN          abort every AEN-th v4 command (debug, default 0)
  bpt=BPT         blocks per transfer (default 128, 32 when BS >= 2048)
  bs=BS           logical block size (default 512)
  cdbsz=6|10|12|16  READ/WRITE cdb size (default 10)
  coe=0|1         continue on error on both sides
  count=COUNT     blocks to copy (default: derived from capacities)
  dio=0|1         direct IO on both sides
  elemsz_kb=EKB   scatter-gather element size in KiB (>= 4)
  fua=0|1|2|3     force unit access (1: output, 2: input, 3: both)
  ibs=BS / obs=BS must equal bs when given
  if=IFILE        input (default stdin)
  iflag=FLAGS     input flags, comma separated
  of=OFILE        output (default: discard, '-' for stdout)
  of2=OFILE2      secondary output
  ofreg=OFREG     file receiving each segment's data
  oflag=FLAGS     output flags, comma separated
  seek=SEEK       blocks to skip at start of output
  skip=SKIP       blocks to skip at start of input
  sync=0|1        SYNCHRONIZE CACHE on device outputs when done
  thr=THR         worker threads (default 4, max 16)
  time=0|1        report elapsed time and throughput (default 1)
  verbose=VERB    diagnostic level

Flags: append coe defres dio direct dpo dsync excl fua mmap noshare
       noxfer null same_fds swait v3 v4";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operands_and_switches() {
        let cli = Cli::try_parse_from(["sgcopy", "if=/dev/sg1", "of=-", "-vv", "--dry-run"]).unwrap();
        assert_eq!(cli.operands, vec!["if=/dev/sg1", "of=-"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.dry_run, 1);
    }

    #[test]
    fn test_short_dry_run_repeats() {
        let cli = Cli::try_parse_from(["sgcopy", "-dd", "if=a"]).unwrap();
        assert_eq!(cli.dry_run, 2);
    }

    #[test]
    fn test_unknown_switch_rejected() {
        assert!(Cli::try_parse_from(["sgcopy", "--frobnicate"]).is_err());
    }
}
