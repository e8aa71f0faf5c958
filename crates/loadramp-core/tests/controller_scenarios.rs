//! End-to-end controller scenarios
//!
//! These tests drive full runs against in-process executors on a paused
//! tokio clock, so request counts are exact up to slot boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loadramp_core::error::ExecutorError;
use loadramp_core::health::{HealthMonitor, HealthProbe, HealthSettings};
use loadramp_core::prelude::*;
use loadramp_core::telemetry::{
    FanoutSink, JsonLinesSink, PrometheusSink, TelemetryEvent, TelemetrySink,
};
use loadramp_core::{LifecycleKind, ProbeError, RunnerSettings};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn match_all() -> QueryDescriptor {
    QueryDescriptor::dsl("big5", r#"{"query":{"match_all":{}}}"#)
}

/// Always succeeds after a fixed latency
struct FixedLatency {
    latency: Duration,
    calls: AtomicU64,
}

impl FixedLatency {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl QueryExecutor for FixedLatency {
    async fn execute(&self, _query: &QueryDescriptor) -> ExecutionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        ExecutionOutcome::success(self.latency)
    }

    async fn check_connection(&self) -> std::result::Result<String, ExecutorError> {
        Ok("in-process backend".to_string())
    }
}

/// Fails every other call
struct Flaky {
    calls: AtomicU64,
}

#[async_trait]
impl QueryExecutor for Flaky {
    async fn execute(&self, _query: &QueryDescriptor) -> ExecutionOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = Duration::from_millis(10);
        tokio::time::sleep(latency).await;
        if n % 2 == 0 {
            ExecutionOutcome::success(latency)
        } else {
            ExecutionOutcome::failure(latency, "http 503: search_phase_execution_exception")
        }
    }
}

struct Refused;

#[async_trait]
impl QueryExecutor for Refused {
    async fn execute(&self, _query: &QueryDescriptor) -> ExecutionOutcome {
        ExecutionOutcome::failure(Duration::ZERO, "unreachable")
    }

    async fn check_connection(&self) -> std::result::Result<String, ExecutorError> {
        Err(ExecutorError::ConnectionFailed("connection refused".to_string()))
    }
}

/// Replays a fixed script of samples, then repeats the last one
struct ScriptedProbe {
    samples: Mutex<VecDeque<f64>>,
}

impl ScriptedProbe {
    fn new(samples: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(samples.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    fn name(&self) -> &str {
        "scripted cpu"
    }

    async fn sample(&self) -> std::result::Result<f64, ProbeError> {
        let mut samples = self.samples.lock();
        match samples.len() {
            0 => Err(ProbeError::Unavailable("empty script".to_string())),
            1 => Ok(samples[0]),
            _ => Ok(samples.pop_front().unwrap_or_default()),
        }
    }
}

#[derive(Default)]
struct Lifecycle(Mutex<Vec<LifecycleKind>>);

impl TelemetrySink for Lifecycle {
    fn emit(&self, event: TelemetryEvent) {
        if let TelemetryEvent::Lifecycle(ev) = event {
            self.0.lock().push(ev.kind);
        }
    }
}

fn constant_concurrency(level: u32, duration: u64) -> LoadPlan {
    LoadPlan::builder(secs(duration))
        .target(QueryTarget::concurrency(
            "match_all",
            match_all(),
            RampSchedule::constant(level, secs(duration)).unwrap(),
        ))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn constant_concurrency_matches_latency_bound() {
    let executor = FixedLatency::new(Duration::from_millis(10));
    let report = LoadController::new(
        constant_concurrency(2, 5),
        executor.clone(),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let overall = &report.summary.overall;
    // 5s / 10ms * 2 slots
    assert!((950..=1_000).contains(&overall.total), "total = {}", overall.total);
    assert_eq!(overall.success_rate, 100.0);
    assert_eq!(overall.total, overall.success + overall.errors);
    assert_eq!(report.peak_concurrency.global.max, 2);
    assert_eq!(report.peak_concurrency.global.current, 0);
    assert_eq!(report.summary.targets["match_all"].total, overall.total);
}

#[tokio::test(start_paused = true)]
async fn warmup_records_are_excluded() {
    let plan = LoadPlan::builder(secs(2))
        .warmup(secs(1))
        .target(QueryTarget::concurrency(
            "match_all",
            match_all(),
            RampSchedule::constant(1u32, secs(2)).unwrap(),
        ))
        .build()
        .unwrap();
    let executor = FixedLatency::new(Duration::from_millis(10));

    let report = LoadController::new(plan, executor.clone(), CancellationToken::new())
        .run()
        .await;

    let warmup = report.warmup_summary.expect("warmup ran");
    assert!((90..=100).contains(&warmup.overall.total), "warmup = {}", warmup.overall.total);
    // measured phase alone: 2s / 10ms
    assert!(
        (190..=200).contains(&report.summary.overall.total),
        "total = {}",
        report.summary.overall.total
    );
    assert!(executor.calls.load(Ordering::SeqCst) > report.summary.overall.total);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_early() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(secs(1)).await;
        trigger.cancel();
    });

    let sink = Arc::new(Lifecycle::default());
    let report = LoadController::new(
        constant_concurrency(2, 5),
        FixedLatency::new(Duration::from_millis(10)),
        cancel,
    )
    .with_telemetry(sink.clone())
    .run()
    .await;

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    let total = report.summary.overall.total;
    assert!(total > 0);
    assert!(total < 950, "total = {}", total);
    assert!(report.elapsed < secs(5));

    let events = sink.0.lock();
    assert_eq!(events.first(), Some(&LifecycleKind::Start));
    assert_eq!(
        &events[events.len() - 2..],
        &[LifecycleKind::Interrupted, LifecycleKind::End]
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_yields_zero_report() {
    let report = LoadController::new(
        constant_concurrency(4, 5),
        Arc::new(Refused),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(report.outcome, RunOutcome::ConnectionFailed);
    assert_eq!(report.summary.overall.total, 0);
    assert_eq!(report.summary.overall.success, 0);
    assert_eq!(report.summary.overall.errors, 0);
    assert_eq!(report.summary.overall.success_rate, 0.0);
    assert!(report.summary.targets.is_empty());
    assert_eq!(report.peak_concurrency.global.max, 0);
}

#[tokio::test(start_paused = true)]
async fn failures_are_recorded_not_fatal() {
    let report = LoadController::new(
        constant_concurrency(1, 2),
        Arc::new(Flaky {
            calls: AtomicU64::new(0),
        }),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let overall = &report.summary.overall;
    assert!(overall.total >= 190, "total = {}", overall.total);
    assert!((overall.success as i64 - overall.errors as i64).abs() <= 1);
    assert!((overall.success_rate - 50.0).abs() < 1.0);
    assert_eq!(overall.error_counts.get("http 503"), Some(&overall.errors));
}

#[tokio::test(start_paused = true)]
async fn rate_target_converges() {
    let plan = LoadPlan::builder(secs(4))
        .target(QueryTarget::rate(
            "term",
            match_all(),
            RampSchedule::constant(50.0, secs(4)).unwrap(),
        ))
        .build()
        .unwrap();

    let report = LoadController::new(
        plan,
        FixedLatency::new(Duration::from_millis(20)),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let total = report.summary.overall.total;
    // 4 schedulers at 80ms each
    assert!((185..=205).contains(&total), "total = {}", total);
    assert_eq!(report.dropped_fires, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_ramp_reaches_peak() {
    let plan = LoadPlan::builder(secs(3))
        .target(
            QueryTarget::concurrency(
                "sort",
                match_all(),
                RampBuilder::linear(1u32, 3, 3, secs(1)).unwrap(),
            )
            .with_group("sorting"),
        )
        .build()
        .unwrap();

    let report = LoadController::new(
        plan,
        FixedLatency::new(Duration::from_millis(100)),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(report.peak_concurrency.global.max, 3);
    assert_eq!(report.peak_concurrency.targets["sort"].max, 3);
    assert_eq!(report.peak_concurrency.groups["sorting"].max, 3);
    // roughly 10 + 20 + 30
    let total = report.summary.overall.total;
    assert!((50..=60).contains(&total), "total = {}", total);
}

#[tokio::test(start_paused = true)]
async fn health_pause_halts_issuance() {
    let settings = HealthSettings {
        threshold: 90.0,
        hysteresis: 5.0,
        interval_secs: 1,
        pause_load: true,
    };
    // over threshold for the first two samples, healthy afterwards
    let monitor = HealthMonitor::new(ScriptedProbe::new(&[95.0, 95.0, 50.0]), settings);
    let sink = Arc::new(Lifecycle::default());

    let report = LoadController::new(
        constant_concurrency(1, 4),
        FixedLatency::new(Duration::from_millis(10)),
        CancellationToken::new(),
    )
    .with_telemetry(sink.clone())
    .with_health_monitor(monitor)
    .run()
    .await;

    // unpaused this would be ~400
    let total = report.summary.overall.total;
    assert!((150..=210).contains(&total), "total = {}", total);

    let events = sink.0.lock();
    let pause = events.iter().position(|k| *k == LifecycleKind::Pause).unwrap();
    let resume = events.iter().position(|k| *k == LifecycleKind::Resume).unwrap();
    assert!(pause < resume);
    assert_eq!(events.iter().filter(|k| **k == LifecycleKind::Pause).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn monitoring_only_health_never_pauses() {
    let settings = HealthSettings {
        interval_secs: 1,
        pause_load: false,
        ..HealthSettings::default()
    };
    let monitor = HealthMonitor::new(ScriptedProbe::new(&[99.0]), settings);
    let sink = Arc::new(Lifecycle::default());
    let prometheus = Arc::new(PrometheusSink::new().unwrap());
    let fanout = FanoutSink::new().with(sink.clone()).with(prometheus.clone());

    let report = LoadController::new(
        constant_concurrency(1, 2),
        FixedLatency::new(Duration::from_millis(10)),
        CancellationToken::new(),
    )
    .with_telemetry(Arc::new(fanout))
    .with_health_monitor(monitor)
    .run()
    .await;

    assert!(report.summary.overall.total >= 190);
    assert!(sink.0.lock().contains(&LifecycleKind::Pause));

    let text = prometheus.gather_text().unwrap();
    assert!(text.contains("loadramp_lifecycle_events_total{kind=\"PAUSE\"} 1"), "{}", text);
    assert!(text.contains("loadramp_paused 0"), "{}", text);
}

/// Hangs far past any join bound
struct Stuck;

#[async_trait]
impl QueryExecutor for Stuck {
    async fn execute(&self, _query: &QueryDescriptor) -> ExecutionOutcome {
        tokio::time::sleep(secs(60)).await;
        ExecutionOutcome::success(secs(60))
    }
}

struct Panicking;

#[async_trait]
impl QueryExecutor for Panicking {
    async fn execute(&self, _query: &QueryDescriptor) -> ExecutionOutcome {
        tokio::time::sleep(Duration::from_millis(10)).await;
        panic!("executor bug");
    }
}

#[tokio::test(start_paused = true)]
async fn slow_workers_are_abandoned_at_drain() {
    let plan = LoadPlan::builder(secs(3))
        .target(QueryTarget::concurrency(
            "match_all",
            match_all(),
            RampSchedule::constant(1u32, secs(3)).unwrap(),
        ))
        .settings(RunnerSettings {
            worker_join_timeout_secs: 1,
            ..RunnerSettings::default()
        })
        .build()
        .unwrap();

    let report = LoadController::new(plan, Arc::new(Stuck), CancellationToken::new())
        .run()
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.summary.overall.total, 0);
    // 3s run plus one 1s join bound, nowhere near the 60s request
    assert!(report.elapsed < secs(10), "elapsed = {:?}", report.elapsed);
    assert_eq!(report.peak_concurrency.global.max, 1);
}

#[tokio::test(start_paused = true)]
async fn worker_failure_aborts_run() {
    let report = LoadController::new(
        constant_concurrency(1, 10),
        Arc::new(Panicking),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(report.elapsed < secs(10), "elapsed = {:?}", report.elapsed);
    assert_eq!(report.summary.overall.total, 0);
}

#[tokio::test]
async fn request_events_reach_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let sink = Arc::new(
        JsonLinesSink::create(&path, 10_000, Duration::from_millis(50))
            .await
            .unwrap(),
    );

    let report = LoadController::new(
        constant_concurrency(2, 1),
        FixedLatency::new(Duration::from_millis(20)),
        CancellationToken::new(),
    )
    .with_execution_id("exec-jsonl")
    .with_telemetry(sink.clone())
    .run()
    .await;

    let written = sink.close().await.unwrap();
    assert_eq!(sink.dropped(), 0);

    let content = std::fs::read_to_string(&path).unwrap();
    let events: Vec<TelemetryEvent> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len() as u64, written);

    let requests = events
        .iter()
        .filter(|e| matches!(e, TelemetryEvent::Request(r) if r.execution_id == "exec-jsonl"))
        .count() as u64;
    assert_eq!(requests, report.summary.overall.total);
    assert!(matches!(events.last(), Some(TelemetryEvent::Lifecycle(l)) if l.kind == LifecycleKind::End));
}
