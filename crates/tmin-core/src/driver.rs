//! Top-level orchestration: load the input, establish a baseline, run the
//! engine, write the result.
//!
//! Every resource this function allocates — the forkserver process, both
//! shared-memory regions, the temp file used for file-mode delivery — is a
//! local variable. `run` always returns normally (it never calls
//! `std::process::exit`), so plain `Drop` order gives every resource a
//! guaranteed release on every exit path: the success path, a propagated
//! oracle error, and a user-requested stop all unwind through the same
//! locals in the same order.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::bitmap::ClassifyMode;
use crate::config::Config;
use crate::engine::MinimizationEngine;
use crate::error::{Error, ErrorContext, Result};
use crate::forkserver::{DirectExecClient, ExecBackend, ForkserverClient, ForkserverOptions, InputDelivery};
use crate::oracle::{ForkserverOracle, Oracle};
use crate::shmem::{self, ShmemChannel};
use crate::stats::Stats;

fn read_input(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path).io_context(path.to_path_buf())?;
    if data.is_empty() {
        return Err(Error::EmptyInput);
    }
    if data.len() > crate::MAX_INPUT_LEN {
        return Err(Error::InputTooLarge { len: data.len(), max: crate::MAX_INPUT_LEN });
    }
    Ok(data)
}

fn read_mask(path: &Path, map_size: usize) -> Result<Vec<u8>> {
    let data = fs::read(path).io_context(path.to_path_buf())?;
    if data.len() != map_size {
        return Err(Error::InvalidMaskBitmap(format!(
            "mask file is {} bytes, expected {map_size} to match the coverage map",
            data.len()
        )));
    }
    Ok(data)
}

/// Writes `data` to `path` atomically: write to a sibling temp file, then
/// rename over the destination.
fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).io_context(dir.to_path_buf())?;
    tmp.write_all(data).io_context(path.to_path_buf())?;
    tmp.persist(path)
        .map_err(|e| Error::Io { path: path.to_path_buf(), source: e.error })?;
    Ok(())
}

/// Substitutes the literal token `@@` in `args` with `delivery_path`.
/// Returns whether any substitution happened.
fn substitute_at_marker(args: &mut [OsString], delivery_path: &Path) -> bool {
    let mut found = false;
    for arg in args.iter_mut() {
        if arg.as_os_str() == OsStr::new("@@") {
            *arg = delivery_path.as_os_str().to_owned();
            found = true;
        }
    }
    found
}

pub fn run(config: &Config) -> Result<Stats> {
    let start = Instant::now();

    let input = read_input(&config.input_path)?;
    let mask = match &config.mask_bitmap_path {
        Some(path) => Some(read_mask(path, config.map_size)?),
        None => None,
    };
    let classify_mode = if config.mode_flags.edges_only {
        ClassifyMode::EdgesOnly
    } else {
        ClassifyMode::HitCounts
    };

    if config.target.is_empty() {
        return Err(Error::InvalidConfig("target command must not be empty".into()));
    }
    let program = config.target[0].clone();
    let mut args: Vec<OsString> = config.target[1..].to_vec();

    let mut shmem = ShmemChannel::new(config.map_size)?;

    let (delivery_path, _delivery_tempfile): (PathBuf, Option<tempfile::NamedTempFile>) =
        match &config.file_input_path {
            Some(path) => (path.clone(), None),
            None => {
                let tmp = tempfile::NamedTempFile::new().io_context(PathBuf::from("<tmpdir>"))?;
                let path = tmp.path().to_path_buf();
                (path, Some(tmp))
            }
        };

    let used_at_marker = substitute_at_marker(&mut args, &delivery_path);
    if config.file_input_path.is_none() && !used_at_marker {
        // Without a configured path or an `@@` marker, file-mode delivery
        // would require reopening the target's stdin at a reset offset on
        // every fork; that fd-reuse trick isn't implemented here. Shared
        // memory input delivery, negotiated below when the forkserver
        // supports it, doesn't hit this restriction.
        tracing::debug!("no @@ marker and no -f path; relying on shared-memory input delivery");
    }

    // Allocate the shared-memory input region and export its id before the
    // forkserver is spawned, matching afl-tmin.c's ordering: a forked child
    // can only learn environment state that existed before it was exec'd,
    // so the region has to exist up front regardless of whether the
    // handshake ends up negotiating its use.
    if !config.no_forkserver {
        shmem.enable_shmem_input(crate::MAX_INPUT_LEN)?;
    }

    let mut envs: Vec<(OsString, OsString)> = vec![
        (shmem::SHM_ENV_VAR.into(), shmem.coverage_id().to_string().into()),
        (shmem::SHM_SIZE_ENV_VAR.into(), config.map_size.to_string().into()),
    ];
    if let Some(input_id) = shmem.input_id() {
        envs.push((shmem::SHM_FUZZ_ENV_VAR.into(), input_id.to_string().into()));
    }

    let forksrv_timeout = Duration::from_millis(config.forksrv_init_timeout_ms);
    let run_timeout = Duration::from_millis(config.timeout_ms);

    let mut forkserver_client: Option<ForkserverClient> = None;
    let mut direct_client: Option<DirectExecClient> = None;
    let delivery;

    if config.no_forkserver {
        if config.file_input_path.is_none() && !used_at_marker {
            return Err(Error::InvalidConfig(
                "AFL_NO_FORKSRV requires -f PATH or an @@ marker in the target command".into(),
            ));
        }
        direct_client = Some(DirectExecClient::new(
            program,
            args,
            envs,
            config.kill_signal,
            config.debug,
            config.mode_flags.exit_crash,
            config.crash_exitcode,
        ));
        delivery = InputDelivery::File { path: delivery_path };
    } else {
        let mut client = ForkserverClient::spawn(ForkserverOptions {
            target: program,
            args,
            envs,
            mem_limit_mb: config.mem_limit_mb,
            coverage_shm_id: shmem.coverage_id(),
            map_size: config.map_size,
            input_shm_id: shmem.input_id(),
            debug_child_output: config.debug,
            kill_signal: config.kill_signal,
            fork_server_kill_signal: config.fork_server_kill_signal,
            exit_crash: config.mode_flags.exit_crash,
            crash_exitcode: config.crash_exitcode,
        })?;
        let handshake = client.handshake(forksrv_timeout)?;
        if let Some(reported_size) = handshake.map_size {
            if reported_size != config.map_size {
                tracing::warn!(reported_size, configured = config.map_size, "forkserver reported a different map size than configured");
            }
        }
        if handshake.shmem_fuzz {
            delivery = InputDelivery::SharedMemory;
        } else {
            if config.file_input_path.is_none() && !used_at_marker {
                return Err(Error::InvalidConfig(
                    "forkserver did not negotiate shared-memory input; supply -f PATH or an @@ marker".into(),
                ));
            }
            delivery = InputDelivery::File { path: delivery_path };
        }
        forkserver_client = Some(client);
    }

    let backend: &mut dyn ExecBackend = if let Some(client) = forkserver_client.as_mut() {
        client
    } else {
        direct_client.as_mut().expect("one backend is always constructed")
    };

    let mut oracle = ForkserverOracle::new(
        backend,
        &mut shmem,
        delivery,
        run_timeout,
        classify_mode,
        mask,
        config.exact,
        config.mode_flags.hang_mode,
    );

    let mut engine = MinimizationEngine::new(input.clone(), config.del_len_limit);

    if let Err(err) = oracle.check(engine.accepted(), true) {
        return Err(err);
    }

    let engine_stats = match engine.minimize(&mut oracle) {
        Ok(stats) => stats,
        Err(Error::Interrupted) => {
            write_output(&config.output_path, engine.accepted())?;
            return Err(Error::Interrupted);
        }
        Err(e) => return Err(e),
    };

    let final_buffer = engine.into_accepted();
    write_output(&config.output_path, &final_buffer)?;

    Ok(Stats {
        original_len: input.len(),
        final_len: final_buffer.len(),
        counters: *oracle.counters(),
        passes_run: engine_stats.passes_run,
        mode: oracle.mode(),
        elapsed: start.elapsed(),
    })
}
