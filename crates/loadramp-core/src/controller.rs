//! Run orchestration
//!
//! [`LoadController`] owns a validated plan and drives it through
//! `Idle → Warmup → Running → Draining → Stopped`. It always produces a
//! [`RunReport`], even when the backend is unreachable or the run is
//! cancelled before the first request completes.

use std::fmt::Write as _;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::QueryExecutor;
use crate::health::{HealthMonitor, PauseFlag};
use crate::metrics::{MetricsAggregator, RunSummary};
use crate::plan::{LoadPlan, LoadShape};
use crate::telemetry::{LifecycleEvent, LifecycleKind, NullSink, TelemetryEvent, TelemetrySink};
use crate::tracker::{ConcurrencySnapshot, ConcurrencyTracker};
use crate::worker::{concurrency_slot, rate_worker, RunContext, SlotDemand};

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Warmup,
    Running,
    Draining,
    Stopped,
}

/// Why the run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Reached the configured duration
    Completed,
    /// Cancelled from outside
    Interrupted,
    /// A worker exited before the run finished
    Aborted,
    /// The pre-run connectivity check failed; nothing was sent
    ConnectionFailed,
}

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub execution_id: String,
    pub outcome: RunOutcome,
    /// Measured phase only
    pub summary: RunSummary,
    pub warmup_summary: Option<RunSummary>,
    pub peak_concurrency: ConcurrencySnapshot,
    /// Rate-mode fires skipped because the in-flight cap was reached
    pub dropped_fires: u64,
    pub elapsed: Duration,
}

impl RunReport {
    fn empty(execution_id: String, outcome: RunOutcome, elapsed: Duration) -> Self {
        Self {
            execution_id,
            outcome,
            summary: RunSummary::default(),
            warmup_summary: None,
            peak_concurrency: ConcurrencySnapshot::default(),
            dropped_fires: 0,
            elapsed,
        }
    }
}

/// Drives one load test; consumed by [`run`](Self::run)
pub struct LoadController {
    plan: Arc<LoadPlan>,
    executor: Arc<dyn QueryExecutor>,
    cancel: CancellationToken,
    telemetry: Arc<dyn TelemetrySink>,
    health: Option<HealthMonitor>,
    pause: PauseFlag,
    tracker: Arc<ConcurrencyTracker>,
    execution_id: String,
    phase: watch::Sender<RunPhase>,
}

impl LoadController {
    pub fn new(plan: LoadPlan, executor: Arc<dyn QueryExecutor>, cancel: CancellationToken) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            plan: Arc::new(plan),
            executor,
            cancel,
            telemetry: Arc::new(NullSink),
            health: None,
            pause: PauseFlag::new(),
            tracker: Arc::new(ConcurrencyTracker::new()),
            execution_id: Uuid::new_v4().to_string(),
            phase,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Gate load generation on a health monitor; it runs for the whole test
    pub fn with_health_monitor(mut self, monitor: HealthMonitor) -> Self {
        self.health = Some(monitor);
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    /// Pause switch consulted by every worker
    pub fn pause_flag(&self) -> PauseFlag {
        self.pause.clone()
    }

    /// Live in-flight counters
    pub fn tracker(&self) -> Arc<ConcurrencyTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!("Run {} entering {:?}", self.execution_id, phase);
        self.phase.send_replace(phase);
    }

    fn lifecycle(&self, kind: LifecycleKind) {
        self.telemetry.emit(TelemetryEvent::Lifecycle(LifecycleEvent::now(
            &self.execution_id,
            kind,
        )));
    }

    /// Execute the plan to completion or cancellation
    pub async fn run(mut self) -> RunReport {
        let started = Instant::now();
        info!(
            "Starting load test {} ({} targets, {}s)",
            self.execution_id,
            self.plan.targets().len(),
            self.plan.duration().as_secs()
        );

        match self.executor.check_connection().await {
            Ok(backend) => info!("Connected to {}", backend),
            Err(e) => {
                error!("Connectivity check failed: {}; no load will be generated", e);
                self.set_phase(RunPhase::Stopped);
                return RunReport::empty(
                    self.execution_id.clone(),
                    RunOutcome::ConnectionFailed,
                    started.elapsed(),
                );
            }
        }

        self.lifecycle(LifecycleKind::Start);

        let monitor_token = self.cancel.child_token();
        let monitor_handle = self.health.take().map(|monitor| self.start_monitor(monitor, &monitor_token));

        let warmup_summary = match self.plan.warmup() {
            Some(duration) => Some(self.run_warmup(duration).await),
            None => None,
        };

        let (outcome, summary, dropped_fires) = if self.cancel.is_cancelled() {
            info!("Cancelled before the measured phase");
            (RunOutcome::Interrupted, RunSummary::default(), 0)
        } else {
            self.run_measured().await
        };

        monitor_token.cancel();
        if let Some(handle) = monitor_handle {
            join_worker("health monitor", handle, self.plan.settings().worker_join_timeout()).await;
        }

        if outcome == RunOutcome::Interrupted {
            self.lifecycle(LifecycleKind::Interrupted);
        }
        self.lifecycle(LifecycleKind::End);
        self.set_phase(RunPhase::Stopped);

        let report = RunReport {
            execution_id: self.execution_id.clone(),
            outcome,
            summary,
            warmup_summary,
            peak_concurrency: self.tracker.snapshot(),
            dropped_fires,
            elapsed: started.elapsed(),
        };
        info!(
            "Load test {} finished: {:?}, {} requests in {:.1}s",
            report.execution_id,
            report.outcome,
            report.summary.overall.total,
            report.elapsed.as_secs_f64()
        );
        report
    }

    fn start_monitor(&self, mut monitor: HealthMonitor, token: &CancellationToken) -> JoinHandle<()> {
        monitor.set_pause_flag(self.pause.clone());

        let advisory = !monitor.settings().pause_load;
        let note = if advisory { " (monitoring only)" } else { "" };

        let telemetry = Arc::clone(&self.telemetry);
        let execution_id = self.execution_id.clone();
        monitor.on_pause(move |value| {
            telemetry.emit(TelemetryEvent::Lifecycle(
                LifecycleEvent::now(&execution_id, LifecycleKind::Pause)
                    .with_detail(format!("health metric {:.1}{}", value, note))
                    .advisory(advisory),
            ));
        });

        let telemetry = Arc::clone(&self.telemetry);
        let execution_id = self.execution_id.clone();
        monitor.on_resume(move |value| {
            telemetry.emit(TelemetryEvent::Lifecycle(
                LifecycleEvent::now(&execution_id, LifecycleKind::Resume)
                    .with_detail(format!("health metric {:.1}{}", value, note))
                    .advisory(advisory),
            ));
        });

        Arc::new(monitor).spawn(token.clone())
    }

    fn context(&self, metrics: Arc<MetricsAggregator>, stop: CancellationToken, warmup: bool) -> Arc<RunContext> {
        Arc::new(RunContext {
            execution_id: self.execution_id.clone(),
            executor: Arc::clone(&self.executor),
            tracker: Arc::clone(&self.tracker),
            metrics,
            telemetry: Arc::clone(&self.telemetry),
            pause: self.pause.clone(),
            stop,
            settings: self.plan.settings().clone(),
            origin: Instant::now(),
            warmup,
            dropped_fires: AtomicU64::new(0),
        })
    }

    /// Every target at concurrency 1 into a separate record stream
    async fn run_warmup(&self, duration: Duration) -> RunSummary {
        self.set_phase(RunPhase::Warmup);
        self.lifecycle(LifecycleKind::WarmupStart);
        info!("Warmup: {} targets at concurrency 1 for {}s", self.plan.targets().len(), duration.as_secs());

        let metrics = Arc::new(MetricsAggregator::new());
        let stop = self.cancel.child_token();
        let ctx = self.context(Arc::clone(&metrics), stop.clone(), true);

        let handles: Vec<(String, JoinHandle<()>)> = self
            .plan
            .targets()
            .iter()
            .map(|target| {
                let handle = tokio::spawn(concurrency_slot(
                    Arc::clone(&ctx),
                    Arc::new(target.clone()),
                    SlotDemand::Fixed(1),
                    0,
                ));
                (format!("warmup:{}", target.id), handle)
            })
            .collect();

        tokio::select! {
            _ = self.cancel.cancelled() => info!("Warmup interrupted"),
            _ = tokio::time::sleep(duration) => {}
        }

        stop.cancel();
        let timeout = self.plan.settings().warmup_join_timeout();
        for (label, handle) in handles {
            join_worker(&label, handle, timeout).await;
        }

        let (total, succeeded) = metrics.counts();
        info!("Warmup complete: {} requests ({} succeeded)", total, succeeded);
        self.lifecycle(LifecycleKind::WarmupEnd);
        metrics.summarize()
    }

    /// Measured phase; the phase clock starts at zero here
    async fn run_measured(&self) -> (RunOutcome, RunSummary, u64) {
        let worker_plan = self.plan.worker_plan();
        info!(
            "Worker pool: {} ({} concurrency slots, {} rate permits)",
            worker_plan.total_workers, worker_plan.concurrency_slots, worker_plan.rate_permits
        );

        let metrics = Arc::new(MetricsAggregator::new());
        let stop = self.cancel.child_token();
        let ctx = self.context(Arc::clone(&metrics), stop.clone(), false);
        let permits = Arc::new(Semaphore::new(
            worker_plan.rate_permits.min(Semaphore::MAX_PERMITS),
        ));

        self.set_phase(RunPhase::Running);
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(worker_plan.total_workers);
        for (target, allocation) in self.plan.targets().iter().zip(&worker_plan.allocations) {
            let shared = Arc::new(target.clone());
            match &target.shape {
                LoadShape::Concurrency(schedule) => {
                    for slot in 0..allocation.workers {
                        handles.push((
                            format!("{}#slot{}", target.id, slot),
                            tokio::spawn(concurrency_slot(
                                Arc::clone(&ctx),
                                Arc::clone(&shared),
                                SlotDemand::Ramp(schedule.clone()),
                                slot as u32,
                            )),
                        ));
                    }
                }
                LoadShape::Rate(schedule) => {
                    for index in 0..allocation.workers {
                        handles.push((
                            format!("{}#rate{}", target.id, index),
                            tokio::spawn(rate_worker(
                                Arc::clone(&ctx),
                                Arc::clone(&shared),
                                schedule.clone(),
                                allocation.workers,
                                index,
                                Arc::clone(&permits),
                            )),
                        ));
                    }
                }
            }
        }

        let outcome = self.supervise(&ctx, &handles).await;

        self.set_phase(RunPhase::Draining);
        stop.cancel();
        info!("Draining {} workers", handles.len());
        let timeout = self.plan.settings().worker_join_timeout();
        for (label, handle) in handles {
            join_worker(&label, handle, timeout).await;
        }

        let dropped = ctx.dropped_fires();
        if dropped > 0 {
            warn!("{} rate-mode fires dropped at the in-flight cap", dropped);
        }
        (outcome, metrics.summarize(), dropped)
    }

    async fn supervise(&self, ctx: &RunContext, handles: &[(String, JoinHandle<()>)]) -> RunOutcome {
        let settings = self.plan.settings();
        let duration = self.plan.duration();
        let mut next_progress = settings.progress_interval();

        loop {
            let elapsed = ctx.elapsed();
            if elapsed >= duration {
                return RunOutcome::Completed;
            }
            if let Some((label, _)) = handles.iter().find(|(_, h)| h.is_finished()) {
                error!("Worker {} exited before the run finished; aborting", label);
                return RunOutcome::Aborted;
            }
            if elapsed >= next_progress {
                info!("{}", self.progress_line(ctx, elapsed));
                next_progress += settings.progress_interval();
            }

            let tick = settings.control_tick().min(duration - elapsed);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Cancellation requested; stopping load generation");
                    return RunOutcome::Interrupted;
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    fn progress_line(&self, ctx: &RunContext, elapsed: Duration) -> String {
        let (total, succeeded) = ctx.metrics.counts();
        let success_rate = if total > 0 {
            succeeded as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let secs = elapsed.as_secs_f64();
        let rps = if secs > 0.0 { total as f64 / secs } else { 0.0 };
        let snapshot = self.tracker.snapshot();

        let mut line = format!(
            "[{:>4.0}s] requests={} success={:.1}% rps={:.1} in_flight={}",
            secs, total, success_rate, rps, snapshot.global.current
        );
        if !snapshot.groups.is_empty() {
            let groups: Vec<String> = snapshot
                .groups
                .iter()
                .map(|(group, c)| format!("{}={}", group, c.current))
                .collect();
            let _ = write!(line, " groups[{}]", groups.join(" "));
        }
        if ctx.pause.is_paused() {
            line.push_str(" [PAUSED]");
        }
        line
    }
}

/// Join with a bound; a late worker is abandoned, a panicked one logged
async fn join_worker(label: &str, handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Worker {} failed: {}", label, e),
        Err(_) => warn!("Worker {} did not stop within {:?}; abandoning it", label, timeout),
    }
}
