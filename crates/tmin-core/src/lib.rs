//! Core minimization engine, equivalence oracle, and forkserver channel.
//!
//! The binary crate (`tmin`) is a thin `clap` front end over this library;
//! everything with semantic weight — mode selection, stage scheduling,
//! oracle verdicts — lives here and is testable without a CLI process.

pub mod bitmap;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod forkserver;
pub mod oracle;
pub mod shmem;
pub mod signal;
pub mod stats;
pub mod trimmer;

/// Compile-time input size cap (`TMIN_MAX_FILE` in the reference
/// implementation).
pub const MAX_INPUT_LEN: usize = 1024 * 1024;

pub use config::Config;
pub use error::{Error, Result};
pub use stats::Stats;
