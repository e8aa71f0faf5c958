//! Request records and run summaries
//!
//! Workers append one [`RequestRecord`] per completed execution. The lock is
//! held only for the push; all sorting and grouping happens on a copy when
//! [`MetricsAggregator::summarize`] is called after the run has drained.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Width of the windows used for throughput-over-time
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(5);

/// One completed execution attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub target_id: String,
    /// Wall-clock start, for export
    pub started_at: DateTime<Utc>,
    /// Completion offset from the aggregator's epoch
    pub completed_at: Duration,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// Summary statistics for one target, or for all targets combined
///
/// Latencies are in milliseconds; throughput figures are requests per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub total: u64,
    pub success: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub rps: f64,
    pub avg_throughput: f64,
    pub min_throughput: f64,
    pub max_throughput: f64,
    pub error_counts: BTreeMap<String, u64>,
}

/// Overall and per-target summaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub overall: TargetSummary,
    pub targets: BTreeMap<String, TargetSummary>,
}

/// Thread-safe append-only record store
#[derive(Debug)]
pub struct MetricsAggregator {
    epoch: Instant,
    records: Mutex<Vec<RequestRecord>>,
    total: AtomicU64,
    succeeded: AtomicU64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            records: Mutex::new(Vec::new()),
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
        }
    }

    /// Record a completion that happened just now
    pub fn record(&self, target_id: &str, duration: Duration, success: bool, error: Option<String>) {
        let started_at = Utc::now()
            - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.push(RequestRecord {
            target_id: target_id.to_string(),
            started_at,
            completed_at: self.epoch.elapsed(),
            duration,
            success,
            error,
        });
    }

    /// Append a fully formed record
    pub fn push(&self, record: RequestRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if record.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        self.records.lock().push(record);
    }

    /// Offset from this aggregator's epoch, for callers building records
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(total, successful)` without taking the record lock
    pub fn counts(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
        )
    }

    /// Copy of every record, in completion order
    pub fn records(&self) -> Vec<RequestRecord> {
        self.records.lock().clone()
    }

    /// Overall and per-target statistics over everything recorded so far
    pub fn summarize(&self) -> RunSummary {
        let records = self.records();
        if records.is_empty() {
            return RunSummary::default();
        }

        let mut by_target: HashMap<&str, Vec<&RequestRecord>> = HashMap::new();
        for record in &records {
            by_target.entry(record.target_id.as_str()).or_default().push(record);
        }

        let all: Vec<&RequestRecord> = records.iter().collect();
        RunSummary {
            overall: summarize_records(&all),
            targets: by_target
                .into_iter()
                .map(|(id, recs)| (id.to_string(), summarize_records(&recs)))
                .collect(),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Nearest-rank percentile: `sorted[floor(q * n)]`, no interpolation
pub fn nearest_rank(sorted: &[Duration], quantile: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let index = ((quantile * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    sorted[index]
}

/// Requests per second in consecutive fixed windows from first to last completion
///
/// Windows without completions contribute zero.
pub fn throughput_windows(completions: &[Duration], window: Duration) -> Vec<f64> {
    let (Some(start), Some(end)) = (completions.iter().min(), completions.iter().max()) else {
        return Vec::new();
    };
    let width = window.as_nanos();
    if width == 0 {
        return Vec::new();
    }

    let windows = (*end - *start).as_nanos().div_ceil(width) as usize;
    let mut counts = vec![0u64; windows];
    for t in completions {
        let index = ((*t - *start).as_nanos() / width) as usize;
        // windows are half-open: a completion exactly on the last boundary falls past the end
        if let Some(count) = counts.get_mut(index) {
            *count += 1;
        }
    }

    let secs = window.as_secs_f64();
    counts.into_iter().map(|c| c as f64 / secs).collect()
}

fn summarize_records(records: &[&RequestRecord]) -> TargetSummary {
    if records.is_empty() {
        return TargetSummary::default();
    }

    let total = records.len() as u64;
    let success = records.iter().filter(|r| r.success).count() as u64;

    let mut durations: Vec<Duration> = records.iter().map(|r| r.duration).collect();
    durations.sort_unstable();
    let sum: Duration = durations.iter().sum();

    let completions: Vec<Duration> = records.iter().map(|r| r.completed_at).collect();
    let span = completions.iter().max().copied().unwrap_or_default()
        - completions.iter().min().copied().unwrap_or_default();
    let rps = if span > Duration::ZERO {
        total as f64 / span.as_secs_f64()
    } else {
        0.0
    };

    let windows = throughput_windows(&completions, THROUGHPUT_WINDOW);
    let (avg_throughput, min_throughput, max_throughput) = if windows.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            windows.iter().sum::<f64>() / windows.len() as f64,
            windows.iter().copied().fold(f64::INFINITY, f64::min),
            windows.iter().copied().fold(0.0, f64::max),
        )
    };

    let mut error_counts = BTreeMap::new();
    for record in records.iter().filter(|r| !r.success) {
        let kind = record
            .error
            .as_deref()
            .and_then(|e| e.split(':').next())
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or("unknown");
        *error_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    TargetSummary {
        total,
        success,
        errors: total - success,
        success_rate: success as f64 / total as f64 * 100.0,
        avg_latency_ms: millis(sum) / total as f64,
        min_latency_ms: millis(durations[0]),
        max_latency_ms: millis(durations[durations.len() - 1]),
        p50_latency_ms: millis(nearest_rank(&durations, 0.50)),
        p90_latency_ms: millis(nearest_rank(&durations, 0.90)),
        p99_latency_ms: millis(nearest_rank(&durations, 0.99)),
        rps,
        avg_throughput,
        min_throughput,
        max_throughput,
        error_counts,
    }
}

impl RunSummary {
    /// Print formatted report
    pub fn print_report(&self) {
        let o = &self.overall;
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    LOAD TEST RESULTS                         ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Total Requests:    {:>10}                                 ║", o.total);
        println!("║ Successful:        {:>10}                                 ║", o.success);
        println!("║ Failed:            {:>10}                                 ║", o.errors);
        println!("║ Success Rate:      {:>10.2}%                                ║", o.success_rate);
        println!("║ Actual RPS:        {:>10.2}                                 ║", o.rps);
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ LATENCY (milliseconds)                                       ║");
        println!("║   avg:             {:>10.1}                                 ║", o.avg_latency_ms);
        println!("║   p50:             {:>10.1}                                 ║", o.p50_latency_ms);
        println!("║   p90:             {:>10.1}                                 ║", o.p90_latency_ms);
        println!("║   p99:             {:>10.1}                                 ║", o.p99_latency_ms);
        println!("║   max:             {:>10.1}                                 ║", o.max_latency_ms);

        if !self.targets.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ PER TARGET                                                   ║");
            for (id, t) in &self.targets {
                println!("║ {:<60} ║", id);
                println!(
                    "║   {:>6} req  {:>6.1}% ok  avg {:>8.1}ms  p90 {:>8.1}ms     ║",
                    t.total, t.success_rate, t.avg_latency_ms, t.p90_latency_ms
                );
                println!(
                    "║   throughput avg {:>7.2}  min {:>7.2}  max {:>7.2} rps       ║",
                    t.avg_throughput, t.min_throughput, t.max_throughput
                );
            }
        }

        if !o.error_counts.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ ERRORS                                                       ║");
            for (error_type, count) in &o.error_counts {
                println!("║   {:20}: {:>10}                         ║", error_type, count);
            }
        }

        println!("╚══════════════════════════════════════════════════════════════╝\n");
    }
}
