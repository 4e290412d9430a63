//! Error taxonomy for the minimizer core.
//!
//! Every fallible function in this crate returns [`Result<T, Error>`]; nothing
//! in non-test code panics. `Error::Interrupted` is kept distinct from the
//! other fatal variants so the CLI layer can map it to exit code 1 instead of
//! a generic failure code.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("forkserver handshake failed: {0}")]
    Handshake(String),

    #[error("forkserver protocol error: {0}")]
    Protocol(String),

    #[error(
        "binary does not appear to be instrumented (no coverage bitmap activity detected)"
    )]
    InstrumentationMissing,

    #[error("{observed} but {requested} was requested ({hint})")]
    SemanticMismatch {
        observed: String,
        requested: String,
        hint: String,
    },

    #[error("input file is empty")]
    EmptyInput,

    #[error("input file is too large ({len} bytes, max {max} bytes)")]
    InputTooLarge { len: usize, max: usize },

    #[error("invalid mask bitmap: {0}")]
    InvalidMaskBitmap(String),

    #[error("shared memory error: {0}")]
    Shmem(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("minimization aborted by user")]
    Interrupted,
}

/// Context-attaching helper, in the spirit of the pack's `AflContext` pattern
/// for wrapping raw I/O errors with the path that caused them.
pub trait ErrorContext<T> {
    fn io_context(self, path: impl Into<PathBuf>) -> Result<T, Error>;
}

impl<T> ErrorContext<T> for io::Result<T> {
    fn io_context(self, path: impl Into<PathBuf>) -> Result<T, Error> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
