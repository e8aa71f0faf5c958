//! Rate and concurrency worker loops
//!
//! Every worker shares a [`RunContext`]: the executor, the tracker, the
//! metrics stream of the current phase, the pause flag and the stop token.
//! Workers never return errors; failed executions become failed records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::{ExecutionOutcome, QueryExecutor};
use crate::health::PauseFlag;
use crate::metrics::{MetricsAggregator, RequestRecord};
use crate::plan::{QueryTarget, RunnerSettings};
use crate::schedule::RampSchedule;
use crate::telemetry::{RequestEvent, TelemetryEvent, TelemetrySink};
use crate::tracker::ConcurrencyTracker;

/// State shared by every worker of one phase
pub(crate) struct RunContext {
    pub execution_id: String,
    pub executor: Arc<dyn QueryExecutor>,
    pub tracker: Arc<ConcurrencyTracker>,
    pub metrics: Arc<MetricsAggregator>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub pause: PauseFlag,
    pub stop: CancellationToken,
    pub settings: RunnerSettings,
    /// Zero of the phase clock
    pub origin: Instant,
    pub warmup: bool,
    pub dropped_fires: AtomicU64,
}

impl RunContext {
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn dropped_fires(&self) -> u64 {
        self.dropped_fires.load(Ordering::Relaxed)
    }

    /// Sleep one idle poll; returns early on stop
    async fn idle(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(self.settings.idle_poll()) => {}
        }
    }
}

/// Run one query and record the result
///
/// No-op once stopped; a completion that lands after stop is discarded.
pub(crate) async fn execute_once(ctx: &RunContext, target: &QueryTarget) {
    if ctx.is_stopped() {
        return;
    }

    let group = target.group.as_deref();
    let _in_flight = ctx.tracker.enter(&target.id, group);
    let started_at = Utc::now();
    let start = Instant::now();

    let timeout = ctx.settings.request_timeout();
    let outcome = match tokio::time::timeout(timeout, ctx.executor.execute(&target.query)).await {
        Ok(outcome) => outcome,
        Err(_) => ExecutionOutcome::failure(
            start.elapsed(),
            format!("timeout: no response within {}s", timeout.as_secs()),
        ),
    };

    if ctx.is_stopped() {
        return;
    }

    if let Some(error) = &outcome.error {
        debug!("Query {} failed after {:?}: {}", target.id, outcome.duration, error);
    }

    let in_flight_target = ctx.tracker.current_for_target(&target.id);
    let in_flight_global = ctx.tracker.current_global();

    ctx.metrics.push(RequestRecord {
        target_id: target.id.clone(),
        started_at,
        completed_at: ctx.metrics.elapsed(),
        duration: outcome.duration,
        success: outcome.success,
        error: outcome.error.clone(),
    });

    ctx.telemetry.emit(TelemetryEvent::Request(RequestEvent {
        execution_id: ctx.execution_id.clone(),
        target_id: target.id.clone(),
        group: target.group.clone(),
        timestamp: Utc::now(),
        latency_ms: outcome.duration.as_secs_f64() * 1_000.0,
        success: outcome.success,
        error: outcome.error,
        warmup: ctx.warmup,
        in_flight_target,
        in_flight_global,
    }));
}

/// Level a concurrency slot compares its index against
#[derive(Debug, Clone)]
pub(crate) enum SlotDemand {
    Fixed(u32),
    Ramp(RampSchedule<u32>),
}

impl SlotDemand {
    fn at(&self, elapsed: Duration) -> u32 {
        match self {
            Self::Fixed(level) => *level,
            Self::Ramp(schedule) => schedule.lookup(elapsed),
        }
    }
}

/// One concurrency slot: executes back to back while `slot < demand`
pub(crate) async fn concurrency_slot(
    ctx: Arc<RunContext>,
    target: Arc<QueryTarget>,
    demand: SlotDemand,
    slot: u32,
) {
    debug!("WORKER_START target={} slot={}", target.id, slot);
    let mut executed = 0u64;

    while !ctx.is_stopped() {
        if ctx.pause.is_paused() || slot >= demand.at(ctx.elapsed()) {
            ctx.idle().await;
            continue;
        }
        execute_once(&ctx, &target).await;
        executed += 1;
    }

    debug!(
        "WORKER_END target={} slot={} executed={}",
        target.id, slot, executed
    );
}

/// One of `workers` schedulers sharing a rate target
///
/// Fires on a fixed cadence independent of completions; each fire needs a
/// permit from `permits` and is dropped when none is free.
pub(crate) async fn rate_worker(
    ctx: Arc<RunContext>,
    target: Arc<QueryTarget>,
    schedule: RampSchedule<f64>,
    workers: usize,
    worker_index: usize,
    permits: Arc<Semaphore>,
) {
    debug!("WORKER_START target={} rate_worker={}", target.id, worker_index);
    let workers = workers.max(1) as f64;
    let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    let mut fired = 0u64;

    // spread co-scheduled workers so they do not fire in lockstep
    let initial_rate = schedule.lookup(Duration::ZERO);
    let spread = if initial_rate > 0.0 {
        fire_interval(workers, initial_rate).min(Duration::from_secs(1))
    } else {
        Duration::ZERO
    };
    let offset = if spread.is_zero() {
        Duration::ZERO
    } else {
        spread.mul_f64(rand::thread_rng().gen::<f64>())
    };
    let mut next_fire = Instant::now() + offset;
    let mut current_rate = initial_rate;

    loop {
        if ctx.is_stopped() {
            break;
        }

        let elapsed = ctx.elapsed();
        let rate = schedule.lookup(elapsed);
        if ctx.pause.is_paused() || rate <= 0.0 {
            reap_while_idle(&ctx, &mut in_flight).await;
            // resume from the current time; missed fires are not replayed
            next_fire = next_fire.max(Instant::now());
            continue;
        }

        let interval = fire_interval(workers, rate);
        if rate != current_rate {
            // re-base so a step up is not served on the old cadence
            next_fire = next_fire.min(Instant::now() + interval);
            current_rate = rate;
        }

        // never sleep through a rate change
        let wake = match schedule.next_change_after(elapsed) {
            Some(change) => next_fire.min(ctx.origin + change + CHANGE_GRACE),
            None => next_fire,
        };

        let sleep = tokio::time::sleep_until(wake);
        tokio::pin!(sleep);
        let woke = loop {
            tokio::select! {
                _ = ctx.stop.cancelled() => break false,
                _ = &mut sleep => break true,
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        };
        if !woke || ctx.is_stopped() {
            break;
        }
        if ctx.pause.is_paused() || Instant::now() < next_fire {
            continue;
        }

        match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => {
                let ctx = Arc::clone(&ctx);
                let target = Arc::clone(&target);
                in_flight.push(Box::pin(async move {
                    let _permit = permit;
                    execute_once(&ctx, &target).await;
                }));
                fired += 1;
            }
            Err(_) => {
                ctx.dropped_fires.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped fire for {}: in-flight cap reached", target.id);
            }
        }

        next_fire += interval;
        let now = Instant::now();
        if next_fire + interval < now {
            next_fire = now;
        }
    }

    // let in-flight requests finish; their results are discarded
    while in_flight.next().await.is_some() {}

    debug!(
        "WORKER_END target={} rate_worker={} fired={}",
        target.id, worker_index, fired
    );
}

/// Per-worker spacing between fires; absurdly low rates saturate at an hour
fn fire_interval(workers: f64, rate: f64) -> Duration {
    Duration::try_from_secs_f64(workers / rate)
        .unwrap_or(MAX_FIRE_INTERVAL)
        .min(MAX_FIRE_INTERVAL)
}

const MAX_FIRE_INTERVAL: Duration = Duration::from_secs(3_600);

/// Wake this long after a step boundary, where the new value applies
const CHANGE_GRACE: Duration = Duration::from_millis(1);

async fn reap_while_idle(ctx: &RunContext, in_flight: &mut FuturesUnordered<BoxFuture<'static, ()>>) {
    let idle = tokio::time::sleep(ctx.settings.idle_poll());
    tokio::pin!(idle);
    loop {
        tokio::select! {
            _ = ctx.stop.cancelled() => return,
            _ = &mut idle => return,
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }
}
