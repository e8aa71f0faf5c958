//! In-flight request bookkeeping
//!
//! Counts requests in flight globally, per target and per group, and keeps
//! the running maxima. Maxima never decrease during a run. A single mutex
//! guards all counters; the critical section is a handful of integer
//! updates, far shorter than any request it brackets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Current and peak in-flight count
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub current: u64,
    pub max: u64,
}

impl InFlight {
    fn increment(&mut self) {
        self.current += 1;
        self.max = self.max.max(self.current);
    }

    fn decrement(&mut self) {
        self.current = self.current.saturating_sub(1);
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencySnapshot {
    pub global: InFlight,
    pub targets: BTreeMap<String, InFlight>,
    pub groups: BTreeMap<String, InFlight>,
}

#[derive(Debug, Default)]
struct TrackerState {
    global: InFlight,
    targets: HashMap<String, InFlight>,
    groups: HashMap<String, InFlight>,
}

/// Thread-safe in-flight counters
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    state: Mutex<TrackerState>,
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as started
    pub fn begin(&self, target: &str, group: Option<&str>) {
        let mut state = self.state.lock();
        state.global.increment();
        state
            .targets
            .entry(target.to_string())
            .or_default()
            .increment();
        if let Some(group) = group {
            state.groups.entry(group.to_string()).or_default().increment();
        }
    }

    /// Count a request as finished; counters never go below zero
    pub fn end(&self, target: &str, group: Option<&str>) {
        let mut state = self.state.lock();
        state.global.decrement();
        if let Some(counter) = state.targets.get_mut(target) {
            counter.decrement();
        }
        if let Some(group) = group {
            if let Some(counter) = state.groups.get_mut(group) {
                counter.decrement();
            }
        }
    }

    /// Begin a request and end it when the returned guard drops
    pub fn enter(self: &Arc<Self>, target: &str, group: Option<&str>) -> InFlightGuard {
        self.begin(target, group);
        InFlightGuard {
            tracker: Arc::clone(self),
            target: target.to_string(),
            group: group.map(str::to_string),
        }
    }

    pub fn current_global(&self) -> u64 {
        self.state.lock().global.current
    }

    pub fn max_global(&self) -> u64 {
        self.state.lock().global.max
    }

    pub fn current_for_target(&self, target: &str) -> u64 {
        self.state.lock().targets.get(target).map_or(0, |c| c.current)
    }

    pub fn max_for_target(&self, target: &str) -> u64 {
        self.state.lock().targets.get(target).map_or(0, |c| c.max)
    }

    pub fn current_for_group(&self, group: &str) -> u64 {
        self.state.lock().groups.get(group).map_or(0, |c| c.current)
    }

    pub fn max_for_group(&self, group: &str) -> u64 {
        self.state.lock().groups.get(group).map_or(0, |c| c.max)
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let state = self.state.lock();
        ConcurrencySnapshot {
            global: state.global,
            targets: state.targets.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            groups: state.groups.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

/// Ends its request on drop, including when the request future is abandoned
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<ConcurrencyTracker>,
    target: String,
    group: Option<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.end(&self.target, self.group.as_deref());
    }
}
