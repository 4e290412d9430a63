//! Behavior-equivalence oracle: runs a candidate through the forkserver
//! channel, classifies its coverage bitmap, and decides "same behavior as
//! the baseline" or not.
//!
//! The verdict-to-decision logic is kept as a pure function ([`resolve`])
//! separate from the I/O that produces a [`Verdict`] in the first place, the
//! same separation `bitmap::classify` draws between raw bytes and decision:
//! it can be tested exhaustively without a real forkserver or shared memory.

use std::fs;
use std::time::Duration;

use crate::bitmap::{self, ClassifyMode};
use crate::error::{Error, ErrorContext, Result};
use crate::forkserver::{ExecBackend, InputDelivery, Verdict};
use crate::shmem::ShmemChannel;
use crate::signal;

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub missed_hangs: u64,
    pub missed_crashes: u64,
    pub missed_paths: u64,
    pub total_execs: u64,
}

impl Counters {
    /// `true` once enough executions have happened that a high hang rate is
    /// more likely a flaky target than bad luck.
    pub fn results_may_be_skewed(&self) -> bool {
        self.total_execs >= 50 && self.missed_hangs * 10 > self.total_execs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Coverage,
    Crash,
    Hang,
}

/// The equivalence-decision boundary the minimization engine queries.
/// `first_run` establishes the baseline and fixes `mode` for everything
/// after it.
pub trait Oracle {
    fn check(&mut self, candidate: &[u8], first_run: bool) -> Result<bool>;
    fn counters(&self) -> &Counters;
    fn mode(&self) -> Option<Mode>;
}

enum MissCounter {
    Hangs,
    Crashes,
    Paths,
}

enum Outcome {
    Equivalent,
    NotEquivalent(MissCounter),
    NeedsBitmapCompare,
}

/// Pure decision step, given a verdict and the oracle's current mode state.
/// Mutates `mode` in place when this is the call that establishes it.
fn resolve(
    mode: &mut Option<Mode>,
    hang_requested: bool,
    exact: bool,
    first_run: bool,
    verdict: Verdict,
) -> Result<Outcome> {
    if verdict == Verdict::InternalError {
        return Err(Error::Protocol("forkserver reported an internal error".into()));
    }

    if first_run && mode.is_none() {
        if hang_requested {
            if verdict != Verdict::Timeout {
                return Err(Error::SemanticMismatch {
                    observed: "target did not hang on the baseline input".into(),
                    requested: "hang-mode minimization (-H)".into(),
                    hint: "drop -H, or confirm the target actually hangs on this input".into(),
                });
            }
            *mode = Some(Mode::Hang);
        } else {
            match verdict {
                Verdict::Timeout => {
                    return Err(Error::SemanticMismatch {
                        observed: "target hung on the baseline input".into(),
                        requested: "coverage/crash-mode minimization".into(),
                        hint: "pass -H to minimize for hang equivalence instead".into(),
                    })
                }
                Verdict::Crash => *mode = Some(Mode::Crash),
                Verdict::Ok => *mode = Some(Mode::Coverage),
                Verdict::InstrumentationMissing => return Err(Error::InstrumentationMissing),
                Verdict::InternalError => unreachable!("handled above"),
            }
        }
    }

    Ok(match mode.expect("established above whenever first_run is true") {
        Mode::Hang => match verdict {
            Verdict::Timeout => Outcome::Equivalent,
            Verdict::Crash => Outcome::NotEquivalent(MissCounter::Crashes),
            _ => Outcome::NotEquivalent(MissCounter::Hangs),
        },
        Mode::Crash => match verdict {
            Verdict::Crash if !exact => Outcome::Equivalent,
            Verdict::Crash => Outcome::NeedsBitmapCompare,
            Verdict::Ok => Outcome::NotEquivalent(MissCounter::Paths),
            Verdict::Timeout => Outcome::NotEquivalent(MissCounter::Hangs),
            Verdict::InstrumentationMissing => Outcome::NotEquivalent(MissCounter::Paths),
            Verdict::InternalError => unreachable!("handled above"),
        },
        Mode::Coverage => match verdict {
            Verdict::Ok => Outcome::NeedsBitmapCompare,
            Verdict::Crash => Outcome::NotEquivalent(MissCounter::Crashes),
            Verdict::Timeout => Outcome::NotEquivalent(MissCounter::Hangs),
            Verdict::InstrumentationMissing => return Err(Error::InstrumentationMissing),
            Verdict::InternalError => unreachable!("handled above"),
        },
    })
}

/// The real oracle, backed by a live forkserver and shared-memory coverage
/// map. `tests/` drives the engine against a [`crate::testing::FakeOracle`]
/// style stand-in instead of this type.
pub struct ForkserverOracle<'a> {
    backend: &'a mut dyn ExecBackend,
    shmem: &'a mut ShmemChannel,
    delivery: InputDelivery,
    timeout: Duration,
    classify_mode: ClassifyMode,
    mask: Option<Vec<u8>>,
    exact: bool,
    hang_requested: bool,
    mode: Option<Mode>,
    baseline_fingerprint: Option<u64>,
    classified_scratch: Vec<u8>,
    counters: Counters,
}

impl<'a> ForkserverOracle<'a> {
    pub fn new(
        backend: &'a mut dyn ExecBackend,
        shmem: &'a mut ShmemChannel,
        delivery: InputDelivery,
        timeout: Duration,
        classify_mode: ClassifyMode,
        mask: Option<Vec<u8>>,
        exact: bool,
        hang_requested: bool,
    ) -> Self {
        let map_size = shmem.coverage_map_size();
        Self {
            backend,
            shmem,
            delivery,
            timeout,
            classify_mode,
            mask,
            exact,
            hang_requested,
            mode: None,
            baseline_fingerprint: None,
            classified_scratch: vec![0u8; map_size],
            counters: Counters::default(),
        }
    }

    fn deliver_candidate(&mut self, candidate: &[u8]) -> Result<()> {
        match &self.delivery {
            InputDelivery::File { path } => fs::write(path, candidate).io_context(path.clone()),
            InputDelivery::SharedMemory => self.shmem.write_input(candidate),
        }
    }

    fn compare_bitmap(&mut self, first_run: bool) -> Result<bool> {
        let raw = self.shmem.coverage_slice();
        bitmap::classify(raw, &mut self.classified_scratch, self.classify_mode, self.mask.as_deref());
        let fingerprint = bitmap::fingerprint(&self.classified_scratch);

        if first_run {
            self.baseline_fingerprint = Some(fingerprint);
            return Ok(true);
        }
        let baseline = self
            .baseline_fingerprint
            .expect("mode is only established once baseline_fingerprint is also set");
        if fingerprint == baseline {
            Ok(true)
        } else {
            self.counters.missed_paths += 1;
            Ok(false)
        }
    }
}

impl<'a> Oracle for ForkserverOracle<'a> {
    fn check(&mut self, candidate: &[u8], first_run: bool) -> Result<bool> {
        self.counters.total_execs += 1;
        self.shmem.clear_coverage();
        self.deliver_candidate(candidate)?;
        let verdict = self.backend.run(&self.delivery, candidate.len(), self.timeout)?;

        if signal::stop_requested() {
            return Err(Error::Interrupted);
        }

        let outcome = resolve(&mut self.mode, self.hang_requested, self.exact, first_run, verdict)?;
        match outcome {
            Outcome::Equivalent => Ok(true),
            Outcome::NotEquivalent(which) => {
                match which {
                    MissCounter::Hangs => self.counters.missed_hangs += 1,
                    MissCounter::Crashes => self.counters.missed_crashes += 1,
                    MissCounter::Paths => self.counters.missed_paths += 1,
                }
                Ok(false)
            }
            Outcome::NeedsBitmapCompare => self.compare_bitmap(first_run),
        }
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }

    fn mode(&self) -> Option<Mode> {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_mode_established_on_first_ok() {
        let mut mode = None;
        let outcome = resolve(&mut mode, false, false, true, Verdict::Ok).unwrap();
        assert_eq!(mode, Some(Mode::Coverage));
        assert!(matches!(outcome, Outcome::NeedsBitmapCompare));
    }

    #[test]
    fn crash_mode_non_exact_is_always_equivalent() {
        let mut mode = Some(Mode::Crash);
        let outcome = resolve(&mut mode, false, false, false, Verdict::Crash).unwrap();
        assert!(matches!(outcome, Outcome::Equivalent));
    }

    #[test]
    fn crash_mode_exact_falls_through_to_bitmap_compare() {
        let mut mode = Some(Mode::Crash);
        let outcome = resolve(&mut mode, false, true, false, Verdict::Crash).unwrap();
        assert!(matches!(outcome, Outcome::NeedsBitmapCompare));
    }

    #[test]
    fn coverage_mode_rejects_a_crash() {
        let mut mode = Some(Mode::Coverage);
        let outcome = resolve(&mut mode, false, false, false, Verdict::Crash).unwrap();
        assert!(matches!(outcome, Outcome::NotEquivalent(MissCounter::Crashes)));
    }

    #[test]
    fn crash_mode_rejects_a_clean_run() {
        let mut mode = Some(Mode::Crash);
        let outcome = resolve(&mut mode, false, false, false, Verdict::Ok).unwrap();
        assert!(matches!(outcome, Outcome::NotEquivalent(MissCounter::Paths)));
    }

    #[test]
    fn hang_mode_accepts_only_timeout() {
        let mut mode = Some(Mode::Hang);
        assert!(matches!(
            resolve(&mut mode, true, false, false, Verdict::Timeout).unwrap(),
            Outcome::Equivalent
        ));
        assert!(matches!(
            resolve(&mut mode, true, false, false, Verdict::Crash).unwrap(),
            Outcome::NotEquivalent(MissCounter::Crashes)
        ));
        assert!(matches!(
            resolve(&mut mode, true, false, false, Verdict::Ok).unwrap(),
            Outcome::NotEquivalent(MissCounter::Hangs)
        ));
    }

    #[test]
    fn hang_requested_but_baseline_did_not_hang_is_fatal() {
        let mut mode = None;
        let err = resolve(&mut mode, true, false, true, Verdict::Ok).unwrap_err();
        assert!(matches!(err, Error::SemanticMismatch { .. }));
    }

    #[test]
    fn instrumentation_missing_is_fatal_in_coverage_mode_only() {
        let mut coverage_mode = Some(Mode::Coverage);
        assert!(resolve(&mut coverage_mode, false, false, false, Verdict::InstrumentationMissing).is_err());

        let mut crash_mode = Some(Mode::Crash);
        let outcome =
            resolve(&mut crash_mode, false, false, false, Verdict::InstrumentationMissing).unwrap();
        assert!(matches!(outcome, Outcome::NotEquivalent(MissCounter::Paths)));
    }

    #[test]
    fn internal_error_is_always_fatal() {
        let mut mode = Some(Mode::Coverage);
        assert!(resolve(&mut mode, false, false, false, Verdict::InternalError).is_err());
    }

    #[test]
    fn skew_warning_threshold() {
        let mut counters = Counters { total_execs: 50, missed_hangs: 6, ..Default::default() };
        assert!(counters.results_may_be_skewed());
        counters.missed_hangs = 4;
        assert!(!counters.results_may_be_skewed());
    }
}
