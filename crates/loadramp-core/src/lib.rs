//! # Loadramp Core
//!
//! Load generation and measurement engine for query-serving backends.
//!
//! This crate provides the building blocks of a load test:
//! - `RampSchedule` - Time-varying target values (rate or concurrency)
//! - `LoadPlan` - Validated set of targets, each bound to a schedule and a mode
//! - `LoadController` - Worker scheduler enforcing the plan against a `QueryExecutor`
//! - `ConcurrencyTracker` / `MetricsAggregator` - In-flight counters and run statistics
//! - `HealthMonitor` - Pauses generation while the backend is saturated
//!
//! ## Architecture
//!
//! ```text
//!   LoadPlan ──► LoadController ──┬──► rate workers ──────┐
//!                    ▲            └──► concurrency slots ─┤
//!                    │                                    ▼
//!              HealthMonitor                        QueryExecutor
//!               (pause flag)                              │
//!                                     ConcurrencyTracker ◄┤
//!                                     MetricsAggregator  ◄┤
//!                                     TelemetrySink      ◄┘
//! ```

pub mod controller;
pub mod error;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod plan;
pub mod schedule;
pub mod telemetry;
pub mod tracker;

mod worker;

pub use controller::{LoadController, RunOutcome, RunPhase, RunReport};
pub use error::{ExecutorError, LoadError, ProbeError, Result};
pub use executor::{ExecutionOutcome, QueryDescriptor, QueryExecutor, QueryLanguage};
pub use health::{HealthMonitor, HealthProbe, HealthSettings, HealthTransition, LocalCpuProbe, PauseFlag};
pub use metrics::{MetricsAggregator, RequestRecord, RunSummary, TargetSummary};
pub use plan::{LoadMode, LoadPlan, LoadShape, QueryTarget, RunnerSettings, WorkerPlan};
pub use schedule::{RampBuilder, RampSchedule, RampStep, RampValue};
pub use telemetry::{
    FanoutSink, JsonLinesSink, LifecycleKind, NullSink, PrometheusSink, TelemetryEvent,
    TelemetrySink,
};
pub use tracker::{ConcurrencySnapshot, ConcurrencyTracker, InFlight};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::controller::{LoadController, RunOutcome, RunReport};
    pub use crate::error::{LoadError, Result};
    pub use crate::executor::{ExecutionOutcome, QueryDescriptor, QueryExecutor};
    pub use crate::plan::{LoadPlan, QueryTarget};
    pub use crate::schedule::{RampBuilder, RampSchedule};
}
