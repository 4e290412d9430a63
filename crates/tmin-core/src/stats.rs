//! The final human-readable summary. This is a user-facing report, not a
//! diagnostic, so it is written directly rather than through `tracing`.

use std::time::Duration;

use crate::oracle::{Counters, Mode};

#[derive(Debug, Clone)]
pub struct Stats {
    pub original_len: usize,
    pub final_len: usize,
    pub counters: Counters,
    pub passes_run: u32,
    pub mode: Option<Mode>,
    pub elapsed: Duration,
}

impl Stats {
    pub fn reduction_percent(&self) -> f64 {
        if self.original_len == 0 {
            return 0.0;
        }
        100.0 * (1.0 - (self.final_len as f64 / self.original_len as f64))
    }

    pub fn results_may_be_skewed(&self) -> bool {
        self.counters.results_may_be_skewed()
    }
}

fn colorize(code: &str, text: &str) -> String {
    format!("\x1b[{code}m{text}\x1b[0m")
}

fn mode_label(mode: Option<Mode>) -> &'static str {
    match mode {
        Some(Mode::Coverage) => "coverage",
        Some(Mode::Crash) => "crash",
        Some(Mode::Hang) => "hang",
        None => "unresolved",
    }
}

/// Renders the banner printed to stdout once minimization finishes. Kept as
/// a pure string builder so it can be snapshot-tested without a terminal.
pub fn render_summary(stats: &Stats) -> String {
    let mut out = String::new();
    out.push_str(&colorize("1;32", "minimization complete"));
    out.push('\n');
    out.push_str(&format!(
        "  input size  : {} -> {} bytes ({})\n",
        stats.original_len,
        stats.final_len,
        colorize("1", &format!("{:.1}% reduction", stats.reduction_percent()))
    ));
    out.push_str(&format!("  mode        : {}\n", mode_label(stats.mode)));
    out.push_str(&format!("  passes      : {}\n", stats.passes_run));
    out.push_str(&format!("  executions  : {}\n", stats.counters.total_execs));
    out.push_str(&format!(
        "  elapsed     : {:.2}s\n",
        stats.elapsed.as_secs_f64()
    ));
    out.push_str(&format!(
        "  anomalies   : {} hangs, {} crashes, {} path drifts\n",
        stats.counters.missed_hangs, stats.counters.missed_crashes, stats.counters.missed_paths
    ));
    if stats.results_may_be_skewed() {
        out.push_str(&colorize(
            "1;33",
            "  warning: results may be skewed (high timeout rate)\n",
        ));
    }
    out
}
