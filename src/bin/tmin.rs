//! `tmin`: CLI front end. Parses arguments and environment into a
//! `tmin_core::Config`, installs the stop-signal handler, wires up
//! `tracing-subscriber`, runs the core, and prints the final summary.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tmin_core::config::{Config, ModeFlags, ProcessEnv};
use tmin_core::{driver, stats, Error};

#[derive(Parser, Debug)]
#[command(name = "tmin", about = "Minimize a test case against an instrumented target")]
struct Cli {
    /// Initial input file to minimize.
    #[arg(short = 'i', value_name = "PATH")]
    input: PathBuf,

    /// Where to write the minimized result.
    #[arg(short = 'o', value_name = "PATH")]
    output: PathBuf,

    /// Use this path instead of stdin / a temp file when delivering candidates.
    #[arg(short = 'f', value_name = "PATH")]
    file: Option<PathBuf>,

    /// Per-run timeout in milliseconds (minimum 10).
    #[arg(short = 't', value_name = "MSEC", default_value_t = 1000)]
    timeout_ms: u64,

    /// Memory limit: a number optionally suffixed with T/G/M/k, or "none".
    #[arg(short = 'm', value_name = "SIZE")]
    mem_limit: Option<String>,

    /// Edge-coverage mode (ignore hit counts, only edge presence).
    #[arg(short = 'e')]
    edges_only: bool,

    /// Treat any nonzero exit code as a crash.
    #[arg(short = 'x')]
    exit_crash: bool,

    /// Hang mode: minimize for a timeout instead of a crash/coverage trace.
    #[arg(short = 'H')]
    hang_mode: bool,

    /// Floor for the block-deletion stage's length, in bytes.
    #[arg(short = 'l', value_name = "N", default_value_t = 1)]
    del_len_limit: usize,

    /// Mask bitmap file: edges set here are excluded from comparison.
    #[arg(short = 'B', value_name = "PATH")]
    mask_bitmap: Option<PathBuf>,

    /// Target command, e.g. `-- ./target @@`.
    #[arg(last = true, required = true)]
    target: Vec<OsString>,
}

fn parse_mem_limit(raw: &str) -> Result<Option<u64>, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let (digits, mult) = match raw.chars().last() {
        Some('T') | Some('t') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&raw[..raw.len() - 1], 1024),
        Some('M') | Some('m') => (&raw[..raw.len() - 1], 1),
        Some('K') | Some('k') => (&raw[..raw.len() - 1], 1), // sub-MB rounds up to 1 MB
        _ => (raw, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory limit: {raw}"))?;
    Ok(Some((value * mult).max(1)))
}

fn build_config(cli: Cli) -> Result<Config, Error> {
    let mem_limit_mb = match &cli.mem_limit {
        Some(raw) => parse_mem_limit(raw).map_err(Error::InvalidConfig)?,
        None => None,
    };

    let mut config = Config::new(cli.input, cli.output, cli.target);
    config.file_input_path = cli.file;
    config.timeout_ms = cli.timeout_ms;
    config.mem_limit_mb = mem_limit_mb;
    config.mode_flags = ModeFlags {
        edges_only: cli.edges_only,
        exit_crash: cli.exit_crash,
        hang_mode: cli.hang_mode,
    };
    config.del_len_limit = cli.del_len_limit;
    config.mask_bitmap_path = cli.mask_bitmap;

    Config::from_env(config, &ProcessEnv)
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Interrupted => 1,
        Error::InvalidConfig(_) => 2,
        _ => 3,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match build_config(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tmin: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    init_tracing(config.debug);

    if let Err(e) = tmin_core::signal::unix::install() {
        tracing::warn!(%e, "failed to install signal handlers");
    }

    match driver::run(&config) {
        Ok(summary) => {
            print!("{}", stats::render_summary(&summary));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("tmin: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
