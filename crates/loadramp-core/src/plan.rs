//! Load plan configuration
//!
//! A [`LoadPlan`] is built once, validated up front, and shared read-only
//! with every worker for the lifetime of a run.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};
use crate::executor::QueryDescriptor;
use crate::health::HealthSettings;
use crate::schedule::{RampBuilder, RampSchedule, RampStep};

/// Label used for concurrency targets that carry no group tag
pub const UNGROUPED: &str = "ungrouped";

/// How a target's schedule is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Requests per second
    Rate,
    /// Requests in flight
    Concurrency,
}

/// Mode and schedule of a target; the mode is fixed by the variant
#[derive(Debug, Clone, PartialEq)]
pub enum LoadShape {
    Rate(RampSchedule<f64>),
    Concurrency(RampSchedule<u32>),
}

impl LoadShape {
    pub fn mode(&self) -> LoadMode {
        match self {
            Self::Rate(_) => LoadMode::Rate,
            Self::Concurrency(_) => LoadMode::Concurrency,
        }
    }

    pub fn change_points(&self) -> Vec<Duration> {
        match self {
            Self::Rate(s) => s.change_points(),
            Self::Concurrency(s) => s.change_points(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Rate(s) if s.steps().len() == 1 => format!("Target QPS: {}", s.first_value()),
            Self::Rate(s) => format!("QPS Ramp: {}", s),
            Self::Concurrency(s) if s.steps().len() == 1 => {
                format!("Target Concurrency: {}", s.first_value())
            }
            Self::Concurrency(s) => format!("Concurrency Ramp: {}", s),
        }
    }
}

/// A query driven under one schedule
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTarget {
    pub id: String,
    pub query: QueryDescriptor,
    pub shape: LoadShape,
    pub group: Option<String>,
}

impl QueryTarget {
    pub fn rate(id: impl Into<String>, query: QueryDescriptor, schedule: RampSchedule<f64>) -> Self {
        Self {
            id: id.into(),
            query,
            shape: LoadShape::Rate(schedule),
            group: None,
        }
    }

    pub fn concurrency(
        id: impl Into<String>,
        query: QueryDescriptor,
        schedule: RampSchedule<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            query,
            shape: LoadShape::Concurrency(schedule),
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn mode(&self) -> LoadMode {
        self.shape.mode()
    }
}

/// Warmup phase configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarmupSettings {
    /// Run every target at concurrency 1 before the measured phase
    #[serde(default)]
    pub enabled: bool,

    /// Warmup duration in seconds
    #[serde(default = "default_warmup_secs")]
    pub duration_secs: u64,
}

fn default_warmup_secs() -> u64 {
    30
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_secs: default_warmup_secs(),
        }
    }
}

/// Scheduler timing and pool sizing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunnerSettings {
    /// Upper bound on a single query execution
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Poll interval for idle slots, zero-rate workers and paused workers
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Controller loop tick
    #[serde(default = "default_control_tick_ms")]
    pub control_tick_ms: u64,

    /// Progress log cadence
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Per-worker bound on the shutdown join
    #[serde(default = "default_worker_join_timeout_secs")]
    pub worker_join_timeout_secs: u64,

    /// Per-worker bound on the warmup join
    #[serde(default = "default_warmup_join_timeout_secs")]
    pub warmup_join_timeout_secs: u64,

    /// Minimum total worker count
    #[serde(default = "default_pool_floor")]
    pub pool_floor: usize,

    /// Cap on the extra capacity reserved for rate-mode fires
    #[serde(default = "default_rate_worker_buffer_cap")]
    pub rate_worker_buffer_cap: usize,

    /// Cap on scheduler workers per rate-mode target
    #[serde(default = "default_max_rate_workers_per_target")]
    pub max_rate_workers_per_target: usize,
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_control_tick_ms() -> u64 {
    100
}

fn default_progress_interval_ms() -> u64 {
    1_000
}

fn default_worker_join_timeout_secs() -> u64 {
    30
}

fn default_warmup_join_timeout_secs() -> u64 {
    10
}

fn default_pool_floor() -> usize {
    50
}

fn default_rate_worker_buffer_cap() -> usize {
    20
}

fn default_max_rate_workers_per_target() -> usize {
    4
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            control_tick_ms: default_control_tick_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            worker_join_timeout_secs: default_worker_join_timeout_secs(),
            warmup_join_timeout_secs: default_warmup_join_timeout_secs(),
            pool_floor: default_pool_floor(),
            rate_worker_buffer_cap: default_rate_worker_buffer_cap(),
            max_rate_workers_per_target: default_max_rate_workers_per_target(),
        }
    }
}

impl RunnerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn control_tick(&self) -> Duration {
        Duration::from_millis(self.control_tick_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_join_timeout_secs)
    }

    pub fn warmup_join_timeout(&self) -> Duration {
        Duration::from_secs(self.warmup_join_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("idle_poll_ms", self.idle_poll_ms),
            ("control_tick_ms", self.control_tick_ms),
            ("progress_interval_ms", self.progress_interval_ms),
            ("max_rate_workers_per_target", self.max_rate_workers_per_target as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LoadError::InvalidPlan(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Workers allocated to one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetAllocation {
    pub mode: LoadMode,
    pub workers: usize,
}

/// Pool sizing fixed at run start; never resized mid-run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    /// `max(pool_floor, concurrency_slots + rate_buffer)`
    pub total_workers: usize,
    /// Sum of every concurrency target's maximum
    pub concurrency_slots: usize,
    /// Capacity reserved for rate-mode fires
    pub rate_buffer: usize,
    /// In-flight cap shared by all rate-mode fires
    pub rate_permits: usize,
    /// Per target, in plan order
    pub allocations: Vec<TargetAllocation>,
}

impl WorkerPlan {
    pub fn for_targets(targets: &[QueryTarget], settings: &RunnerSettings) -> Self {
        let mut allocations = Vec::with_capacity(targets.len());
        let mut concurrency_slots = 0usize;
        let mut expected_qps = 0usize;

        for target in targets {
            let allocation = match &target.shape {
                LoadShape::Concurrency(schedule) => {
                    let slots = schedule.max_value() as usize;
                    concurrency_slots = concurrency_slots.saturating_add(slots);
                    TargetAllocation {
                        mode: LoadMode::Concurrency,
                        workers: slots,
                    }
                }
                LoadShape::Rate(schedule) => {
                    let units = schedule.max_value().ceil() as usize;
                    // `as` saturates, so huge rates pin at usize::MAX
                    expected_qps = expected_qps.saturating_add(units);
                    TargetAllocation {
                        mode: LoadMode::Rate,
                        workers: units.clamp(1, settings.max_rate_workers_per_target),
                    }
                }
            };
            allocations.push(allocation);
        }

        let rate_buffer = expected_qps.min(settings.rate_worker_buffer_cap);
        let total_workers = settings
            .pool_floor
            .max(concurrency_slots.saturating_add(rate_buffer));

        Self {
            total_workers,
            concurrency_slots,
            rate_buffer,
            rate_permits: (total_workers - concurrency_slots).max(1),
            allocations,
        }
    }
}

/// One row of the execution timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub offset_secs: f64,
    pub total_rate: f64,
    pub total_concurrency: u32,
    pub concurrency_by_group: BTreeMap<String, u32>,
}

/// Validated, immutable description of a run
#[derive(Debug, Clone)]
pub struct LoadPlan {
    duration: Duration,
    warmup: Option<Duration>,
    targets: Vec<QueryTarget>,
    settings: RunnerSettings,
    health: Option<HealthSettings>,
}

impl LoadPlan {
    pub fn builder(duration: Duration) -> LoadPlanBuilder {
        LoadPlanBuilder {
            duration,
            warmup: None,
            targets: Vec::new(),
            settings: RunnerSettings::default(),
            health: None,
        }
    }

    /// Parse and validate a TOML plan
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PlanFile = toml::from_str(content)?;
        file.into_plan()
    }

    /// Read, parse and validate a TOML plan file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn warmup(&self) -> Option<Duration> {
        self.warmup
    }

    pub fn targets(&self) -> &[QueryTarget] {
        &self.targets
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn health(&self) -> Option<&HealthSettings> {
        self.health.as_ref()
    }

    pub fn worker_plan(&self) -> WorkerPlan {
        WorkerPlan::for_targets(&self.targets, &self.settings)
    }

    /// Target rate and concurrency at every point where some schedule changes
    pub fn timeline(&self) -> Vec<TimelinePoint> {
        let mut points: BTreeSet<Duration> = BTreeSet::new();
        points.insert(Duration::ZERO);
        for target in &self.targets {
            points.extend(
                target
                    .shape
                    .change_points()
                    .into_iter()
                    .filter(|p| *p <= self.duration),
            );
        }

        points
            .into_iter()
            .map(|offset| {
                let mut total_rate = 0.0;
                let mut by_group: BTreeMap<String, u32> = BTreeMap::new();
                for target in &self.targets {
                    match &target.shape {
                        LoadShape::Rate(s) => total_rate += s.value_from(offset),
                        LoadShape::Concurrency(s) => {
                            let group = target.group.as_deref().unwrap_or(UNGROUPED);
                            let level = by_group.entry(group.to_string()).or_insert(0);
                            *level = level.saturating_add(s.value_from(offset));
                        }
                    }
                }
                TimelinePoint {
                    offset_secs: offset.as_secs_f64(),
                    total_rate,
                    total_concurrency: by_group.values().fold(0u32, |acc, v| acc.saturating_add(*v)),
                    concurrency_by_group: by_group,
                }
            })
            .collect()
    }

    /// Human-readable execution plan
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Load Test Execution Plan ===");
        if let Some(warmup) = self.warmup {
            let _ = writeln!(out, "Warmup: {} seconds", warmup.as_secs());
        }
        let _ = writeln!(out, "Duration: {} seconds", self.duration.as_secs());
        let _ = writeln!(out, "Total targets: {}", self.targets.len());

        let worker_plan = self.worker_plan();
        let _ = writeln!(
            out,
            "Worker pool: {} ({} concurrency slots, {} rate buffer)",
            worker_plan.total_workers, worker_plan.concurrency_slots, worker_plan.rate_buffer
        );

        let _ = writeln!(out, "\nTargets:");
        for (i, target) in self.targets.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", i + 1, target.id);
            let _ = writeln!(out, "     Language: {:?}", target.query.language);
            let _ = writeln!(out, "     {}", target.shape.describe());
            if let Some(group) = &target.group {
                let _ = writeln!(out, "     Group: {}", group);
            }
            if let Some(index) = &target.query.index {
                let _ = writeln!(out, "     Index: {}", index);
            }
            let _ = writeln!(out, "     Query: {}", target.query.preview(100));
        }

        let timeline = self.timeline();
        let _ = writeln!(out, "\n=== Target Timeline ===");
        let _ = writeln!(out, "{:<12}{:>10}{:>14}", "Time", "Total QPS", "Concurrency");
        let _ = writeln!(out, "{}", "-".repeat(36));
        for point in &timeline {
            let label = if point.offset_secs == 0.0 {
                "0s start".to_string()
            } else {
                format!("{}s", point.offset_secs)
            };
            let _ = writeln!(
                out,
                "{:<12}{:>10.1}{:>14}",
                label, point.total_rate, point.total_concurrency
            );
        }
        out
    }
}

/// Incremental plan construction; validation happens in [`build`](Self::build)
pub struct LoadPlanBuilder {
    duration: Duration,
    warmup: Option<Duration>,
    targets: Vec<QueryTarget>,
    settings: RunnerSettings,
    health: Option<HealthSettings>,
}

impl LoadPlanBuilder {
    pub fn warmup(mut self, duration: Duration) -> Self {
        self.warmup = Some(duration);
        self
    }

    pub fn target(mut self, target: QueryTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn health(mut self, health: HealthSettings) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<LoadPlan> {
        if self.duration.is_zero() {
            return Err(LoadError::InvalidDuration(
                "test duration must be positive".to_string(),
            ));
        }
        if matches!(self.warmup, Some(w) if w.is_zero()) {
            return Err(LoadError::InvalidDuration(
                "warmup duration must be positive when warmup is enabled".to_string(),
            ));
        }
        if self.targets.is_empty() {
            return Err(LoadError::NoTargets);
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id.is_empty() {
                return Err(LoadError::InvalidPlan("target id must not be empty".to_string()));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(LoadError::DuplicateTarget(target.id.clone()));
            }
        }

        self.settings.validate()?;
        if let Some(health) = &self.health {
            health.validate()?;
        }

        Ok(LoadPlan {
            duration: self.duration,
            warmup: self.warmup,
            targets: self.targets,
            settings: self.settings,
            health: self.health,
        })
    }
}

// ============================================================================
// PLAN FILE
// ============================================================================

/// On-disk plan layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanFile {
    /// Measured phase duration in seconds
    pub duration_secs: u64,

    #[serde(default)]
    pub warmup: WarmupSettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub health: Option<HealthSettings>,

    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

/// One `[[targets]]` table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetSpec {
    pub id: String,
    pub mode: LoadMode,
    #[serde(default)]
    pub group: Option<String>,
    pub query: QueryDescriptor,
    pub schedule: ScheduleSpec,
}

/// Schedule notation accepted in plan files
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Holds one value for the whole test
    Constant(f64),
    Steps(Vec<StepSpec>),
    Linear(RampShapeSpec),
    Exponential(RampShapeSpec),
    PowerOfTwoThenLinear(PowerRampSpec),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub value: f64,
    pub duration_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RampShapeSpec {
    pub start: f64,
    pub end: f64,
    pub steps: usize,
    pub step_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PowerRampSpec {
    pub steps: usize,
    pub step_secs: u64,
}

impl ScheduleSpec {
    fn to_rate(&self, test_duration: Duration) -> Result<RampSchedule<f64>> {
        match self {
            Self::Constant(v) => RampSchedule::constant(*v, test_duration),
            Self::Steps(steps) => RampSchedule::new(
                steps
                    .iter()
                    .map(|s| RampStep::new(s.value, Duration::from_secs(s.duration_secs)))
                    .collect(),
            ),
            Self::Linear(r) => {
                RampBuilder::linear(r.start, r.end, r.steps, Duration::from_secs(r.step_secs))
            }
            Self::Exponential(r) => {
                RampBuilder::exponential(r.start, r.end, r.steps, Duration::from_secs(r.step_secs))
            }
            Self::PowerOfTwoThenLinear(r) => {
                RampBuilder::power_of_two_then_linear(r.steps, Duration::from_secs(r.step_secs))
            }
        }
    }

    fn to_concurrency(&self, test_duration: Duration) -> Result<RampSchedule<u32>> {
        match self {
            Self::Constant(v) => RampSchedule::constant(whole(*v)?, test_duration),
            Self::Steps(steps) => {
                let steps = steps
                    .iter()
                    .map(|s| -> Result<RampStep<u32>> {
                        Ok(RampStep::new(whole(s.value)?, Duration::from_secs(s.duration_secs)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                RampSchedule::new(steps)
            }
            Self::Linear(r) => RampBuilder::linear(
                whole(r.start)?,
                whole(r.end)?,
                r.steps,
                Duration::from_secs(r.step_secs),
            ),
            Self::Exponential(r) => RampBuilder::exponential(
                whole(r.start)?,
                whole(r.end)?,
                r.steps,
                Duration::from_secs(r.step_secs),
            ),
            Self::PowerOfTwoThenLinear(r) => {
                RampBuilder::power_of_two_then_linear(r.steps, Duration::from_secs(r.step_secs))
            }
        }
    }
}

/// Concurrency values in plan files must be non-negative integers
fn whole(value: f64) -> Result<u32> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Ok(value as u32)
    } else {
        Err(LoadError::InvalidSchedule(format!(
            "concurrency value {} is not a non-negative integer",
            value
        )))
    }
}

impl PlanFile {
    pub fn into_plan(self) -> Result<LoadPlan> {
        let duration = Duration::from_secs(self.duration_secs);
        let mut builder = LoadPlan::builder(duration).settings(self.runner);

        if self.warmup.enabled {
            builder = builder.warmup(Duration::from_secs(self.warmup.duration_secs));
        }
        if let Some(health) = self.health {
            builder = builder.health(health);
        }

        for spec in self.targets {
            let shape = match spec.mode {
                LoadMode::Rate => LoadShape::Rate(spec.schedule.to_rate(duration)?),
                LoadMode::Concurrency => {
                    LoadShape::Concurrency(spec.schedule.to_concurrency(duration)?)
                }
            };
            builder = builder.target(QueryTarget {
                id: spec.id,
                query: spec.query,
                shape,
                group: spec.group,
            });
        }

        builder.build()
    }
}
