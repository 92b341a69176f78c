//! sgcopy CLI entry point

use clap::Parser;
use sgcopy::config::cli::Cli;
use sgcopy::config::{cli_convert, validator};
use sgcopy::coordinator::{copy, RunOptions};
use sgcopy::error::{exit, exit_status_of};
use sgcopy::target::Endpoints;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn level_for(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 | 3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose).as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    init_logging(cli_convert::verbosity(cli));
    let mut cfg = cli_convert::build_config(cli)?;
    validator::validate(&mut cfg)?;
    let endpoints = Endpoints::open(&mut cfg)?;
    let report = copy(cfg, endpoints, RunOptions { listen_signals: true })?;
    Ok(report.exit_status)
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(exit::SYNTAX_ERROR);
        }
        Err(e) => e.exit(),
    };

    let status = match run(&cli) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("sgcopy: {:#}", e);
            exit_status_of(&e)
        }
    };
    std::process::exit(status);
}
