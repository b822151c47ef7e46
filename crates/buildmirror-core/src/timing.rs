//! Opt-in latency sampling for sync operations.
//!
//! Aggregates are process-wide: proactive loads run on scheduler threads and
//! their timings must reach the report printed by the CLI thread. Each
//! operation keeps exact totals plus a bounded window of its most recent
//! durations, so a long-lived host with timing enabled stays at constant
//! memory per operation name.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

/// Recent durations kept per operation for percentile estimates.
pub const WINDOW: usize = 1024;

/// Drained timing statistics, one entry per operation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingReport {
    pub operations: Vec<OpTiming>,
}

/// Statistics for one operation.
///
/// `count`, `total` and `max` cover every call; the percentiles cover the
/// last [`WINDOW`] calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpTiming {
    pub name: String,
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

#[derive(Debug, Default)]
struct OpStats {
    count: u64,
    total: Duration,
    max: Duration,
    recent: VecDeque<Duration>,
}

impl OpStats {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(elapsed);
        self.max = self.max.max(elapsed);
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(elapsed);
    }

    fn finish(self, name: String) -> OpTiming {
        let mut sorted: Vec<Duration> = self.recent.into();
        sorted.sort_unstable();
        OpTiming {
            name,
            count: self.count,
            total: self.total,
            max: self.max,
            p50: nearest_rank(&sorted, 50),
            p95: nearest_rank(&sorted, 95),
            p99: nearest_rank(&sorted, 99),
        }
    }
}

static STATS: Mutex<BTreeMap<String, OpStats>> = Mutex::new(BTreeMap::new());

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether `BMIRROR_TIMING` asks for timing (`1`, `true`, `yes` or `on`,
/// any case).
#[must_use]
pub fn timing_enabled_from_env() -> bool {
    std::env::var("BMIRROR_TIMING").is_ok_and(|value| is_truthy(&value))
}

/// Turn collection on or off. Turning it off discards what was collected.
pub fn set_timing_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
    if !enabled {
        clear_timings();
    }
}

#[must_use]
pub fn is_timing_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn clear_timings() {
    if let Ok(mut stats) = STATS.lock() {
        stats.clear();
    }
}

/// Run `f`, recording its wall time under `name` when timing is on.
pub fn timed<R>(name: &str, f: impl FnOnce() -> R) -> R {
    if !is_timing_enabled() {
        return f();
    }
    let started = Instant::now();
    let result = f();
    record(name, started.elapsed());
    result
}

/// Take everything recorded so far and reset the counters.
#[must_use]
pub fn collect_report() -> TimingReport {
    let drained = STATS
        .lock()
        .map(|mut stats| std::mem::take(&mut *stats))
        .unwrap_or_default();
    TimingReport {
        operations: drained
            .into_iter()
            .map(|(name, stats)| stats.finish(name))
            .collect(),
    }
}

impl TimingReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let operations: Vec<serde_json::Value> = self
            .operations
            .iter()
            .map(|op| {
                json!({
                    "name": op.name,
                    "count": op.count,
                    "total_us": op.total.as_micros(),
                    "max_us": op.max.as_micros(),
                    "p50_us": op.p50.as_micros(),
                    "p95_us": op.p95.as_micros(),
                    "p99_us": op.p99.as_micros(),
                })
            })
            .collect();
        json!({ "operations": operations })
    }

    /// Fixed-width table for the terminal.
    #[must_use]
    pub fn display_table(&self) -> String {
        use std::fmt::Write as _;

        if self.is_empty() {
            return "No timing samples recorded.".to_string();
        }
        let mut out = format!(
            "{:<24} {:>7} {:>9} {:>9} {:>9} {:>9}\n",
            "operation", "count", "p50", "p95", "p99", "max"
        );
        out.push_str(&"-".repeat(72));
        out.push('\n');
        for op in &self.operations {
            let _ = writeln!(
                out,
                "{:<24} {:>7} {:>9} {:>9} {:>9} {:>9}",
                op.name,
                op.count,
                human(op.p50),
                human(op.p95),
                human(op.p99),
                human(op.max)
            );
        }
        out
    }
}

fn record(name: &str, elapsed: Duration) {
    let Ok(mut stats) = STATS.lock() else {
        return;
    };
    if let Some(op) = stats.get_mut(name) {
        op.record(elapsed);
    } else {
        stats.entry(name.to_string()).or_default().record(elapsed);
    }
}

/// Nearest-rank percentile of an ascending slice.
fn nearest_rank(sorted: &[Duration], pct: usize) -> Duration {
    let Some(last) = sorted.len().checked_sub(1) else {
        return Duration::ZERO;
    };
    let rank = (pct.min(100) * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(last)]
}

fn human(duration: Duration) -> String {
    let micros = duration.as_micros();
    match micros {
        1_000_000.. => format!("{}.{:03}s", micros / 1_000_000, (micros % 1_000_000) / 1_000),
        1_000.. => format!("{}.{:03}ms", micros / 1_000, micros % 1_000),
        _ => format!("{micros}µs"),
    }
}

fn is_truthy(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| value.eq_ignore_ascii_case(t))
}
