//! Merged CLI + environment configuration. Populated once, never
//! (de)serialized, so this is a plain struct rather than a `serde` type.

use std::ffi::OsString;
use std::path::PathBuf;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ModeFlags {
    pub edges_only: bool,
    pub exit_crash: bool,
    pub hang_mode: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub file_input_path: Option<PathBuf>,
    pub timeout_ms: u64,
    pub mem_limit_mb: Option<u64>,
    pub mode_flags: ModeFlags,
    pub del_len_limit: usize,
    pub mask_bitmap_path: Option<PathBuf>,
    pub target: Vec<OsString>,

    pub exact: bool,
    pub crash_exitcode: Option<i32>,
    pub kill_signal: Signal,
    pub fork_server_kill_signal: Signal,
    pub map_size: usize,
    pub forksrv_init_timeout_ms: u64,
    pub no_forkserver: bool,
    pub debug: bool,
}

impl Config {
    /// Sane defaults for everything environment variables and flags may
    /// override; callers populate the required fields (paths, target) by
    /// hand or via the CLI layer before calling [`Config::from_env`].
    pub fn new(input_path: PathBuf, output_path: PathBuf, target: Vec<OsString>) -> Self {
        Self {
            input_path,
            output_path,
            file_input_path: None,
            timeout_ms: 1000,
            mem_limit_mb: None,
            mode_flags: ModeFlags::default(),
            del_len_limit: 1,
            mask_bitmap_path: None,
            target,
            exact: false,
            crash_exitcode: None,
            kill_signal: Signal::SIGKILL,
            fork_server_kill_signal: Signal::SIGTERM,
            map_size: crate::bitmap::DEFAULT_MAP_SIZE,
            forksrv_init_timeout_ms: 10_000,
            no_forkserver: false,
            debug: false,
        }
    }
}

/// Abstracts environment-variable lookup so both the real process
/// environment and a fake map can drive [`Config::from_env`].
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

fn parse_signal(raw: &str, var: &str) -> Result<Signal> {
    let num: i32 = raw
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{var} is not a valid signal number: {raw}")))?;
    Signal::try_from(num).map_err(|_| Error::InvalidConfig(format!("{var} is not a valid signal number: {num}")))
}

impl Config {
    pub fn from_env(mut base: Config, env: &impl EnvSource) -> Result<Config> {
        if let Some(raw) = env.var("AFL_TMIN_EXACT") {
            base.exact = raw != "0" && !raw.is_empty();
        }

        if let Some(raw) = env.var("AFL_CRASH_EXITCODE") {
            let code: i32 = raw
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("AFL_CRASH_EXITCODE is not an integer: {raw}")))?;
            if !(-127..=128).contains(&code) {
                return Err(Error::InvalidConfig(format!(
                    "AFL_CRASH_EXITCODE must be within [-127, 128], got {code}"
                )));
            }
            base.crash_exitcode = Some(code);
        }

        if let Some(raw) = env.var("AFL_KILL_SIGNAL") {
            base.kill_signal = parse_signal(&raw, "AFL_KILL_SIGNAL")?;
        }

        if let Some(raw) = env.var("AFL_FORK_SERVER_KILL_SIGNAL") {
            base.fork_server_kill_signal = parse_signal(&raw, "AFL_FORK_SERVER_KILL_SIGNAL")?;
        } else if let Some(raw) = env.var("AFL_KILL_SIGNAL") {
            base.fork_server_kill_signal = parse_signal(&raw, "AFL_KILL_SIGNAL")?;
        }

        if let Some(raw) = env.var("AFL_MAP_SIZE") {
            base.map_size = raw
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("AFL_MAP_SIZE is not a valid size: {raw}")))?;
        }

        if let Some(raw) = env.var("AFL_FORKSRV_INIT_TMOUT") {
            let ms: u64 = raw.parse().map_err(|_| {
                Error::InvalidConfig(format!("AFL_FORKSRV_INIT_TMOUT is not an integer: {raw}"))
            })?;
            if ms < 1 {
                return Err(Error::InvalidConfig(
                    "AFL_FORKSRV_INIT_TMOUT must be >= 1".into(),
                ));
            }
            base.forksrv_init_timeout_ms = ms;
        }

        if let Some(raw) = env.var("AFL_NO_FORKSRV") {
            base.no_forkserver = raw != "0" && !raw.is_empty();
        }

        if let Some(raw) = env.var("AFL_DEBUG") {
            base.debug = raw != "0" && !raw.is_empty();
        }

        base.validate()?;
        Ok(base)
    }

    fn validate(&mut self) -> Result<()> {
        if self.timeout_ms < 10 {
            return Err(Error::InvalidConfig("-t must be at least 10ms".into()));
        }
        if self.del_len_limit < 1 || self.del_len_limit > crate::MAX_INPUT_LEN {
            return Err(Error::InvalidConfig(format!(
                "-l must be within [1, {}]",
                crate::MAX_INPUT_LEN
            )));
        }
        if self.mode_flags.hang_mode && self.mode_flags.edges_only {
            return Err(Error::InvalidConfig("-H and -e are mutually exclusive".into()));
        }
        if self.mode_flags.hang_mode && self.exact {
            tracing::warn!("AFL_TMIN_EXACT has no effect with -H (hangs are non-deterministic); clearing it");
            self.exact = false;
        }
        Ok(())
    }
}
