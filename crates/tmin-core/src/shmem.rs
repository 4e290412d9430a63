//! Shared-memory channel: the coverage bitmap region, and (when the
//! forkserver negotiates it) the shared-memory input-delivery region.
//!
//! Both regions are owned by this struct and released when it is dropped.
//! Because the driver owns the channel for the lifetime of one `run()` call
//! and never reaches for `std::process::exit` until after that call returns,
//! normal `Drop` order gives the "release on every exit path" guarantee the
//! design notes ask for, without needing an `atexit`-style global hook.

use libafl_bolts::shmem::{ShMem, ShMemId, ShMemProvider, StdShMemProvider};

use crate::error::{Error, Result};

/// Environment variable the forkserver reads to find the coverage map.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// Environment variable carrying the coverage map size.
pub const SHM_SIZE_ENV_VAR: &str = "AFL_MAP_SIZE";
/// Environment variable the forkserver reads to find the shared-memory
/// fuzzing-input region.
pub const SHM_FUZZ_ENV_VAR: &str = "__AFL_SHM_FUZZ_ID";
/// Default size of the shared-memory input region (candidate bytes plus the
/// 4-byte length prefix), matching the reference implementation's default.
pub const SHM_FUZZ_MAP_SIZE_DEFAULT: usize = 1024 * 1024 + 4;

pub struct ShmemChannel {
    provider: StdShMemProvider,
    coverage: <StdShMemProvider as ShMemProvider>::ShMem,
    input: Option<<StdShMemProvider as ShMemProvider>::ShMem>,
}

impl ShmemChannel {
    /// Allocate the coverage bitmap region. `map_size` is the number of
    /// edge-id entries (one byte per entry).
    pub fn new(map_size: usize) -> Result<Self> {
        let mut provider = StdShMemProvider::new().map_err(|e| Error::Shmem(e.to_string()))?;
        let coverage = provider
            .new_shmem(map_size)
            .map_err(|e| Error::Shmem(e.to_string()))?;
        Ok(Self {
            provider,
            coverage,
            input: None,
        })
    }

    /// Allocate the optional shared-memory input-delivery region. Only
    /// called once, after the forkserver handshake confirms support.
    pub fn enable_shmem_input(&mut self, max_len: usize) -> Result<()> {
        let region = self
            .provider
            .new_shmem(max_len + 4)
            .map_err(|e| Error::Shmem(e.to_string()))?;
        self.input = Some(region);
        Ok(())
    }

    pub fn coverage_id(&self) -> ShMemId {
        self.coverage.id()
    }

    pub fn coverage_map_size(&self) -> usize {
        self.coverage.len()
    }

    pub fn coverage_slice(&self) -> &[u8] {
        self.coverage.as_slice()
    }

    /// Zero the coverage map before each run; the target is expected to do
    /// this too on fork, but the parent clears it defensively so a crashed
    /// grandchild that never reached instrumentation setup doesn't leak
    /// stale counts into the next classification.
    pub fn clear_coverage(&mut self) {
        self.coverage.as_mut_slice().fill(0);
    }

    pub fn input_id(&self) -> Option<ShMemId> {
        self.input.as_ref().map(|shm| shm.id())
    }

    /// Write `candidate` into the shared-memory input region, prefixed by
    /// its length. Returns an error if the region hasn't been enabled or the
    /// candidate doesn't fit.
    pub fn write_input(&mut self, candidate: &[u8]) -> Result<()> {
        let region = self
            .input
            .as_mut()
            .ok_or_else(|| Error::Shmem("shared-memory input region not enabled".into()))?;
        let slice = region.as_mut_slice();
        if candidate.len() + 4 > slice.len() {
            return Err(Error::Shmem(format!(
                "candidate of {} bytes exceeds shared-memory input capacity of {} bytes",
                candidate.len(),
                slice.len() - 4
            )));
        }
        slice[0..4].copy_from_slice(&(candidate.len() as u32).to_le_bytes());
        slice[4..4 + candidate.len()].copy_from_slice(candidate);
        Ok(())
    }
}
