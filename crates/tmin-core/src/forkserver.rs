//! Forkserver client: a small explicit state machine driven by reads and
//! writes on two pipe ends plus a timer, per design notes ("state machine,
//! not threads"). This intentionally does not reuse libafl's own forkserver
//! executor: the wire-level details here (handshake negotiation, shared
//! input delivery, skip/skip-same-unaware verdict mapping) are specific to
//! this tool's boundary contract in the spec, and an explicit reimplementation
//! keeps every transition inspectable and unit-testable in isolation.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use libafl_bolts::shmem::ShMemId;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::select::{pselect, FdSet};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use os_pipe::{PipeReader, PipeWriter};

use crate::error::{Error, Result};

/// Handshake option bits the server announces.
mod flag {
    pub const MAP_SIZE: u32 = 1 << 0;
    pub const SHMEM_FUZZ: u32 = 1 << 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkserverState {
    Unstarted,
    Handshaking,
    Ready,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Crash,
    Timeout,
    InstrumentationMissing,
    InternalError,
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeInfo {
    pub map_size: Option<usize>,
    pub shmem_fuzz: bool,
}

/// How the candidate is delivered to the target for one run.
#[derive(Debug, Clone)]
pub enum InputDelivery {
    /// Write to `path` (either the user's `-f` path or a temp file) before
    /// each run.
    File { path: PathBuf },
    /// Candidate is copied into the shared-memory input region by the
    /// caller before `run` is invoked; nothing further to do here.
    SharedMemory,
}

pub struct ForkserverOptions {
    pub target: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub mem_limit_mb: Option<u64>,
    pub coverage_shm_id: ShMemId,
    pub map_size: usize,
    pub input_shm_id: Option<ShMemId>,
    pub debug_child_output: bool,
    pub kill_signal: Signal,
    /// Signal used to terminate the forkserver process itself at teardown
    /// (default `SIGTERM`, overridable via `AFL_FORK_SERVER_KILL_SIGNAL`).
    pub fork_server_kill_signal: Signal,
    /// Treat any nonzero exit code as a crash (`-x`).
    pub exit_crash: bool,
    /// A specific exit code that counts as a crash, independent of
    /// `exit_crash` (`AFL_CRASH_EXITCODE`).
    pub crash_exitcode: Option<i32>,
}

/// Anything capable of executing one candidate and producing a verdict. The
/// persistent [`ForkserverClient`] is the default; [`DirectExecClient`]
/// implements the same boundary for `AFL_NO_FORKSRV`, spawning a fresh
/// process per run instead of reusing a forked child.
pub trait ExecBackend {
    fn run(&mut self, delivery: &InputDelivery, input_len: usize, timeout: Duration) -> Result<Verdict>;
}

pub struct ForkserverClient {
    state: ForkserverState,
    child: Child,
    rx: PipeReader,
    tx: PipeWriter,
    child_pid: Option<Pid>,
    last_run_timed_out: bool,
    kill_signal: Signal,
    fork_server_kill_signal: Signal,
    exit_crash: bool,
    crash_exitcode: Option<i32>,
}

impl Drop for ForkserverClient {
    fn drop(&mut self) {
        if let Some(pid) = self.child_pid {
            match kill(pid, self.kill_signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    tracing::warn!(%err, "failed to deliver kill signal to running grandchild");
                }
            }
        }
        let forkserver_pid = Pid::from_raw(self.child.id() as i32);
        match kill(forkserver_pid, self.fork_server_kill_signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(%err, "failed to deliver kill signal to forkserver process");
            }
        }
        if let Err(err) = self.child.wait() {
            tracing::warn!(%err, "failed to wait for forkserver process");
        }
        self.state = ForkserverState::Terminated;
    }
}

impl ForkserverClient {
    pub fn spawn(options: ForkserverOptions) -> Result<Self> {
        let (rx, child_writer) = os_pipe::pipe()
            .map_err(|e| Error::Io { path: "forkserver status pipe".into(), source: e })?;
        let (child_reader, tx) = os_pipe::pipe()
            .map_err(|e| Error::Io { path: "forkserver control pipe".into(), source: e })?;

        let stderr = if options.debug_child_output {
            Stdio::inherit()
        } else {
            Stdio::null()
        };

        let mut command = Command::new(&options.target);
        command.args(&options.args).stdin(Stdio::null()).stderr(stderr);

        command.env(crate::shmem::SHM_ENV_VAR, options.coverage_shm_id.to_string());
        command.env(crate::shmem::SHM_SIZE_ENV_VAR, options.map_size.to_string());
        if let Some(id) = options.input_shm_id {
            command.env(crate::shmem::SHM_FUZZ_ENV_VAR, id.to_string());
        }
        command.envs(options.envs);

        if let Some(mb) = options.mem_limit_mb {
            let bytes = mb.saturating_mul(1024 * 1024);
            let limit_child = move || {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io::Error::from)
            };
            unsafe { command.pre_exec(limit_child) };
        }

        let control_fd = child_reader.as_raw_fd();
        let status_fd = child_writer.as_raw_fd();
        let bind_pipes = move || -> io::Result<()> {
            bind_fds(control_fd, status_fd)
        };
        unsafe { command.pre_exec(bind_pipes) };

        let child = command
            .spawn()
            .map_err(|e| Error::Io { path: options.target.clone().into(), source: e })?;

        Ok(Self {
            state: ForkserverState::Unstarted,
            child,
            rx,
            tx,
            child_pid: None,
            last_run_timed_out: false,
            kill_signal: options.kill_signal,
            fork_server_kill_signal: options.fork_server_kill_signal,
            exit_crash: options.exit_crash,
            crash_exitcode: options.crash_exitcode,
        })
    }

    pub fn state(&self) -> ForkserverState {
        self.state
    }

    /// Perform the initial handshake. Must complete within `timeout` or a
    /// `Handshake` error is returned.
    pub fn handshake(&mut self, timeout: Duration) -> Result<HandshakeInfo> {
        self.state = ForkserverState::Handshaking;

        let word = self.read_u32_timed(timeout)?.ok_or_else(|| {
            Error::Handshake("no handshake message received within startup timeout".into())
        })?;

        let flags = word;
        let map_size = if flags & flag::MAP_SIZE != 0 {
            Some(self.read_u32(timeout)? as usize)
        } else {
            None
        };
        let shmem_fuzz = flags & flag::SHMEM_FUZZ != 0;

        // Acknowledge: echo the flags we actually support back, confirming
        // (or narrowing) the server's proposal.
        self.write_u32(flags)?;

        self.state = ForkserverState::Ready;
        Ok(HandshakeInfo { map_size, shmem_fuzz })
    }

    /// Execute one candidate through the forkserver with the given timeout.
    /// `input_len` is only meaningful for [`InputDelivery::SharedMemory`] —
    /// it is echoed to the server as the command word's byte count.
    pub fn run(&mut self, delivery: &InputDelivery, input_len: usize, timeout: Duration) -> Result<Verdict> {
        debug_assert_eq!(self.state, ForkserverState::Ready);

        // Reap any zombie grandchildren left from a previous timed-out run.
        while !matches!(
            waitpid(None, Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::StillAlive) | Err(_)
        ) {}

        let command_word = match delivery {
            InputDelivery::File { .. } => u32::from(self.last_run_timed_out),
            InputDelivery::SharedMemory => input_len as u32,
        };
        self.write_u32(command_word)?;

        let raw_pid = self.read_u32(timeout)? as i32;
        if raw_pid <= 0 {
            self.state = ForkserverState::Terminated;
            return Err(Error::Protocol("forkserver returned an invalid child pid".into()));
        }
        let pid = Pid::from_raw(raw_pid);
        self.child_pid = Some(pid);
        self.state = ForkserverState::Running;

        let status = self.read_u32_timed(timeout)?;
        self.last_run_timed_out = status.is_none();

        if self.last_run_timed_out {
            match kill(pid, self.kill_signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    return Err(Error::Protocol(format!(
                        "failed to kill timed-out child: {err}"
                    )))
                }
            }
            // The server acknowledges the kill with one more status word.
            self.read_u32(timeout)?;
            self.child_pid = None;
            self.state = ForkserverState::Ready;
            return Ok(Verdict::Timeout);
        }

        self.child_pid = None;
        self.state = ForkserverState::Ready;

        let status = status.expect("checked above");
        Ok(decode_status(status, self.exit_crash, self.crash_exitcode))
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.tx
            .write_all(&value.to_le_bytes())
            .map_err(|e| Error::Protocol(format!("write to forkserver control pipe failed: {e}")))
    }

    fn read_u32(&mut self, _timeout: Duration) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.rx
            .read_exact(&mut buf)
            .map_err(|e| Error::Protocol(format!("read from forkserver status pipe failed: {e}")))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Like `read_u32` but returns `Ok(None)` on timeout instead of blocking
    /// forever, using `pselect` the way the reference forkserver client does.
    fn read_u32_timed(&mut self, timeout: Duration) -> Result<Option<u32>> {
        let fd = self.rx.as_raw_fd();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut read_fds = FdSet::new();
        read_fds.insert(borrowed);
        let ts = TimeSpec::new(
            timeout.as_secs() as i64,
            timeout.subsec_nanos() as i64,
        );
        let ready = pselect(None, &mut read_fds, None, None, Some(&ts), None::<&SigSet>)
            .map_err(|e| Error::Protocol(format!("pselect on forkserver status pipe failed: {e}")))?;
        if ready > 0 {
            Ok(Some(self.read_u32(timeout)?))
        } else {
            Ok(None)
        }
    }
}

/// Status word layout: bit 0 set => process exited normally (bits 8..16 hold
/// the exit code); bit 1 set => signalled; bit 2 set => instrumentation
/// missing; bit 3 set => internal forkserver error.
mod status_bit {
    pub const EXITED: u32 = 1 << 0;
    pub const SIGNALLED: u32 = 1 << 1;
    pub const NO_INSTRUMENTATION: u32 = 1 << 2;
    pub const INTERNAL_ERROR: u32 = 1 << 3;
}

fn decode_status(word: u32, exit_crash: bool, crash_exitcode: Option<i32>) -> Verdict {
    if word & status_bit::INTERNAL_ERROR != 0 {
        return Verdict::InternalError;
    }
    if word & status_bit::NO_INSTRUMENTATION != 0 {
        return Verdict::InstrumentationMissing;
    }
    if word & status_bit::SIGNALLED != 0 {
        return Verdict::Crash;
    }
    if word & status_bit::EXITED != 0 {
        let code = ((word >> 8) & 0xff) as u8;
        let counts_as_crash = (exit_crash && code != 0)
            || crash_exitcode.is_some_and(|ec| code == (ec as i8) as u8);
        if counts_as_crash {
            return Verdict::Crash;
        }
    }
    Verdict::Ok
}

impl ExecBackend for ForkserverClient {
    fn run(&mut self, delivery: &InputDelivery, input_len: usize, timeout: Duration) -> Result<Verdict> {
        ForkserverClient::run(self, delivery, input_len, timeout)
    }
}

/// `AFL_NO_FORKSRV` path: spawn a fresh process for every candidate instead
/// of reusing a persistent forked child. Slower, but useful against targets
/// that cannot cooperate with the forkserver handshake.
pub struct DirectExecClient {
    target: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    kill_signal: Signal,
    debug_child_output: bool,
    exit_crash: bool,
    crash_exitcode: Option<i32>,
}

impl DirectExecClient {
    pub fn new(
        target: OsString,
        args: Vec<OsString>,
        envs: Vec<(OsString, OsString)>,
        kill_signal: Signal,
        debug_child_output: bool,
        exit_crash: bool,
        crash_exitcode: Option<i32>,
    ) -> Self {
        Self { target, args, envs, kill_signal, debug_child_output, exit_crash, crash_exitcode }
    }
}

impl ExecBackend for DirectExecClient {
    fn run(&mut self, delivery: &InputDelivery, _input_len: usize, timeout: Duration) -> Result<Verdict> {
        if matches!(delivery, InputDelivery::SharedMemory) {
            return Err(Error::Protocol(
                "AFL_NO_FORKSRV does not support shared-memory input delivery".into(),
            ));
        }

        let stderr = if self.debug_child_output { Stdio::inherit() } else { Stdio::null() };
        let mut command = Command::new(&self.target);
        command.args(&self.args).stdin(Stdio::null()).stderr(stderr).envs(self.envs.clone());

        let mut child = command
            .spawn()
            .map_err(|e| Error::Io { path: self.target.clone().into(), source: e })?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.signal().is_some() {
                        return Ok(Verdict::Crash);
                    }
                    let code = status.code().unwrap_or(0) as u8;
                    let counts_as_crash = (self.exit_crash && code != 0)
                        || self.crash_exitcode.is_some_and(|ec| code == (ec as i8) as u8);
                    return Ok(if counts_as_crash { Verdict::Crash } else { Verdict::Ok });
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let pid = Pid::from_raw(child.id() as i32);
                        let _ = kill(pid, self.kill_signal);
                        let _ = child.wait();
                        return Ok(Verdict::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    return Err(Error::Io { path: self.target.clone().into(), source: e });
                }
            }
        }
    }
}

fn bind_fds(control_fd: RawFd, status_fd: RawFd) -> io::Result<()> {
    use nix::unistd::dup2;
    dup2(control_fd, FORKSRV_FD_CONTROL).map_err(io::Error::from)?;
    dup2(status_fd, FORKSRV_FD_STATUS).map_err(io::Error::from)?;
    Ok(())
}

/// Well-known control fd the target-side forkserver shim reads commands
/// from, matching the reference implementation's convention.
pub const FORKSRV_FD_CONTROL: RawFd = 198;
/// Well-known status fd the target-side forkserver shim writes replies to.
pub const FORKSRV_FD_STATUS: RawFd = 199;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::thread;

    /// Exercises the wire-level handshake and per-run protocol against an
    /// in-process fake forkserver thread, without spawning any real child
    /// process or instrumented binary.
    struct FakePipes {
        client_rx: PipeReader,
        client_tx: PipeWriter,
        server_rx: PipeReader,
        server_tx: PipeWriter,
    }

    fn fake_pipes() -> FakePipes {
        let (client_rx, server_tx) = os_pipe::pipe().unwrap();
        let (server_rx, client_tx) = os_pipe::pipe().unwrap();
        FakePipes { client_rx, client_tx, server_rx, server_tx }
    }

    fn read_u32(r: &mut PipeReader) -> u32 {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    fn write_u32(w: &mut PipeWriter, v: u32) {
        w.write_all(&v.to_le_bytes()).unwrap();
    }

    #[test]
    fn decode_status_maps_bits_to_verdicts() {
        assert_eq!(decode_status(status_bit::EXITED, false, None), Verdict::Ok);
        assert_eq!(decode_status(status_bit::SIGNALLED, false, None), Verdict::Crash);
        assert_eq!(
            decode_status(status_bit::NO_INSTRUMENTATION, false, None),
            Verdict::InstrumentationMissing
        );
        assert_eq!(decode_status(status_bit::INTERNAL_ERROR, false, None), Verdict::InternalError);
    }

    #[test]
    fn decode_status_honors_exit_crash_flag() {
        let exited_code_7 = status_bit::EXITED | (7 << 8);
        assert_eq!(decode_status(exited_code_7, false, None), Verdict::Ok);
        assert_eq!(decode_status(exited_code_7, true, None), Verdict::Crash);
        assert_eq!(decode_status(exited_code_7, false, Some(7)), Verdict::Crash);
        assert_eq!(decode_status(exited_code_7, false, Some(8)), Verdict::Ok);
    }

    #[test]
    fn handshake_protocol_round_trips_over_real_pipes() {
        let FakePipes { mut client_rx, mut client_tx, mut server_rx, mut server_tx } = fake_pipes();

        let server = thread::spawn(move || {
            write_u32(&mut server_tx, flag::MAP_SIZE | flag::SHMEM_FUZZ);
            write_u32(&mut server_tx, 65536);
            let ack = read_u32(&mut server_rx);
            assert_eq!(ack, flag::MAP_SIZE | flag::SHMEM_FUZZ);
        });

        // Exercise just the wire logic: read flags, conditionally read map
        // size, then echo flags back, matching `handshake`'s body exactly.
        let mut buf = [0u8; 4];
        client_rx.read_exact(&mut buf).unwrap();
        let flags = u32::from_le_bytes(buf);
        let map_size = if flags & flag::MAP_SIZE != 0 {
            client_rx.read_exact(&mut buf).unwrap();
            Some(u32::from_le_bytes(buf) as usize)
        } else {
            None
        };
        client_tx.write_all(&flags.to_le_bytes()).unwrap();

        server.join().unwrap();
        assert_eq!(map_size, Some(65536));
        assert!(flags & flag::SHMEM_FUZZ != 0);
    }
}
