//! Hook point for user-supplied reduction plugins that run before the
//! built-in stages. `MinimizationEngine::register_trimmer` wires instances
//! of `Trimmer` into `minimize`'s pass; no concrete trimmer ships with this
//! crate, but the seam is exercised end to end in `engine.rs`'s tests.

use crate::error::Result;
use crate::oracle::Oracle;
use crate::signal;

/// `init` receives the buffer as it stood before this trimmer ran.
/// `propose` is called repeatedly; returning `None` ends this trimmer's
/// turn. `feedback` reports whether the oracle accepted the last proposal.
/// `finish` is always called once, even if `init` was the only other call
/// made (an empty proposal stream is valid).
pub trait Trimmer {
    fn init(&mut self, input: &[u8]) -> Result<()>;
    fn propose(&mut self) -> Result<Option<Vec<u8>>>;
    fn feedback(&mut self, accepted: bool);
    fn finish(&mut self) -> Result<()>;
}

/// Runs `trimmers` in order against `accepted`, committing any candidate the
/// oracle accepts. Returns `true` if anything changed, in which case the
/// caller should skip the built-in Stage 1–3 sweep for this invocation.
pub fn run_trimmers(
    trimmers: &mut [Box<dyn Trimmer>],
    accepted: &mut Vec<u8>,
    oracle: &mut dyn Oracle,
) -> Result<bool> {
    let mut changed = false;
    for trimmer in trimmers.iter_mut() {
        trimmer.init(accepted)?;
        loop {
            if signal::stop_requested() {
                trimmer.finish()?;
                return Err(crate::error::Error::Interrupted);
            }
            let Some(candidate) = trimmer.propose()? else {
                break;
            };
            let ok = oracle.check(&candidate, false)?;
            trimmer.feedback(ok);
            if ok {
                *accepted = candidate;
                changed = true;
            }
        }
        trimmer.finish()?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Counters;

    struct PrefixDropTrimmer {
        current: Vec<u8>,
        drop_len: usize,
        tried: bool,
    }

    impl Trimmer for PrefixDropTrimmer {
        fn init(&mut self, input: &[u8]) -> Result<()> {
            self.current = input.to_vec();
            self.tried = false;
            Ok(())
        }

        fn propose(&mut self) -> Result<Option<Vec<u8>>> {
            if self.tried || self.current.len() < self.drop_len {
                return Ok(None);
            }
            self.tried = true;
            Ok(Some(self.current[self.drop_len..].to_vec()))
        }

        fn feedback(&mut self, accepted: bool) {
            if accepted {
                self.current.drain(..self.drop_len);
            }
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysAccept {
        counters: Counters,
    }

    impl Oracle for AlwaysAccept {
        fn check(&mut self, _candidate: &[u8], _first_run: bool) -> Result<bool> {
            self.counters.total_execs += 1;
            Ok(true)
        }
        fn counters(&self) -> &Counters {
            &self.counters
        }
        fn mode(&self) -> Option<crate::oracle::Mode> {
            None
        }
    }

    #[test]
    fn accepted_trimmer_proposal_is_committed() {
        let mut accepted = b"HELLOWORLD".to_vec();
        let mut oracle = AlwaysAccept { counters: Counters::default() };
        let mut trimmers: Vec<Box<dyn Trimmer>> =
            vec![Box::new(PrefixDropTrimmer { current: vec![], drop_len: 5, tried: false })];
        let changed = run_trimmers(&mut trimmers, &mut accepted, &mut oracle).unwrap();
        assert!(changed);
        assert_eq!(accepted, b"WORLD");
    }
}
