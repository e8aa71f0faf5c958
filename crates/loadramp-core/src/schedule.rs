//! Ramp schedules
//!
//! A schedule is an ordered, non-empty list of `(value, duration)` steps
//! describing how a target rate or concurrency changes over a run. Lookup
//! walks cumulative durations and holds the last value once the schedule
//! has been exhausted.

use std::fmt;
use std::time::Duration;

use crate::error::{LoadError, Result};

/// Number of doubling steps before [`RampBuilder::power_of_two_then_linear`]
/// switches to linear growth
pub const POWER_OF_TWO_STEPS: usize = 7;

/// Value carried by a ramp step
///
/// Implemented for `f64` (requests per second) and `u32` (concurrency).
/// Builders compute in `f64` and convert with [`RampValue::from_f64`],
/// which truncates for integer types.
pub trait RampValue: Copy + PartialOrd + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Convert from a computed value, truncating toward zero for integers
    fn from_f64(value: f64) -> Self;

    /// Widen to `f64` for arithmetic
    fn to_f64(self) -> f64;

    /// Whether the value can appear in a schedule
    fn is_valid(self) -> bool {
        let v = self.to_f64();
        v.is_finite() && v >= 0.0
    }
}

impl RampValue for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl RampValue for u32 {
    fn from_f64(value: f64) -> Self {
        // `as` saturates: negatives become 0, NaN becomes 0
        value.trunc() as u32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// A single step of a ramp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampStep<T> {
    pub value: T,
    pub duration: Duration,
}

impl<T: RampValue> RampStep<T> {
    pub fn new(value: T, duration: Duration) -> Self {
        Self { value, duration }
    }
}

/// Immutable, validated sequence of ramp steps
#[derive(Debug, Clone, PartialEq)]
pub struct RampSchedule<T> {
    steps: Vec<RampStep<T>>,
    total: Duration,
}

impl<T: RampValue> RampSchedule<T> {
    /// Build a schedule, rejecting empty step lists, zero durations and
    /// negative or non-finite values
    pub fn new(steps: Vec<RampStep<T>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(LoadError::InvalidSchedule(
                "schedule must contain at least one step".to_string(),
            ));
        }

        let mut total = Duration::ZERO;
        for (i, step) in steps.iter().enumerate() {
            if step.duration.is_zero() {
                return Err(LoadError::InvalidSchedule(format!(
                    "step {} has zero duration",
                    i
                )));
            }
            if !step.value.is_valid() {
                return Err(LoadError::InvalidSchedule(format!(
                    "step {} has invalid value {}",
                    i, step.value
                )));
            }
            total += step.duration;
        }

        Ok(Self { steps, total })
    }

    /// One step holding `value` for `duration`
    pub fn constant(value: T, duration: Duration) -> Result<Self> {
        Self::new(vec![RampStep::new(value, duration)])
    }

    pub fn steps(&self) -> &[RampStep<T>] {
        &self.steps
    }

    /// Sum of all step durations
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Value in effect `elapsed` after the schedule started
    ///
    /// Returns the first step whose cumulative end is `>= elapsed`; past the
    /// end the last value is held indefinitely.
    pub fn lookup(&self, elapsed: Duration) -> T {
        let mut cumulative = Duration::ZERO;
        for step in &self.steps {
            cumulative += step.duration;
            if elapsed <= cumulative {
                return step.value;
            }
        }
        self.last_value()
    }

    /// Value of the step that starts at or spans `offset`
    ///
    /// Unlike [`lookup`](Self::lookup) a boundary belongs to the step that
    /// begins there, which is what a timeline of change points wants.
    pub fn value_from(&self, offset: Duration) -> T {
        let mut cumulative = Duration::ZERO;
        for step in &self.steps {
            cumulative += step.duration;
            if offset < cumulative {
                return step.value;
            }
        }
        self.last_value()
    }

    /// Largest step value; sizes the worker pool before a run
    pub fn max_value(&self) -> T {
        self.steps
            .iter()
            .map(|s| s.value)
            .fold(self.steps[0].value, |acc, v| if v > acc { v } else { acc })
    }

    pub fn first_value(&self) -> T {
        self.steps[0].value
    }

    pub fn last_value(&self) -> T {
        self.steps[self.steps.len() - 1].value
    }

    /// Offsets at which the value may change: 0 and every step boundary
    pub fn change_points(&self) -> Vec<Duration> {
        let mut points = Vec::with_capacity(self.steps.len() + 1);
        let mut cumulative = Duration::ZERO;
        points.push(cumulative);
        for step in &self.steps {
            cumulative += step.duration;
            points.push(cumulative);
        }
        points
    }

    /// Earliest boundary at or after `elapsed` where the value changes
    ///
    /// [`lookup`](Self::lookup) still returns the old value at the boundary
    /// itself; the new one applies from just past it.
    pub fn next_change_after(&self, elapsed: Duration) -> Option<Duration> {
        let mut cumulative = Duration::ZERO;
        for pair in self.steps.windows(2) {
            cumulative += pair[0].duration;
            if cumulative >= elapsed && pair[0].value != pair[1].value {
                return Some(cumulative);
            }
        }
        None
    }
}

impl<T: RampValue> fmt::Display for RampSchedule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .steps
            .iter()
            .map(|s| format!("({}, {}s)", s.value, s.duration.as_secs_f64()))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Constructors for common ramp shapes
pub struct RampBuilder;

impl RampBuilder {
    /// Evenly spaced values from `start` to `end`
    ///
    /// Step `i` is `start + i * (end - start) / (steps - 1)`; a single step
    /// holds `end`.
    pub fn linear<T: RampValue>(
        start: T,
        end: T,
        steps: usize,
        step_duration: Duration,
    ) -> Result<RampSchedule<T>> {
        Self::check_shape(steps, step_duration)?;
        if steps == 1 {
            return RampSchedule::constant(end, step_duration);
        }

        let (a, b) = (start.to_f64(), end.to_f64());
        let span = (steps - 1) as f64;
        let values = (0..steps).map(|i| match i {
            0 => start,
            i if i == steps - 1 => end,
            i => T::from_f64(a + (b - a) * i as f64 / span),
        });

        RampSchedule::new(values.map(|v| RampStep::new(v, step_duration)).collect())
    }

    /// Geometric progression from `start` to `end`
    ///
    /// Step `i` is `start * (end / start)^(i / (steps - 1))`. `start` must
    /// be positive.
    pub fn exponential<T: RampValue>(
        start: T,
        end: T,
        steps: usize,
        step_duration: Duration,
    ) -> Result<RampSchedule<T>> {
        Self::check_shape(steps, step_duration)?;
        let (a, b) = (start.to_f64(), end.to_f64());
        if a <= 0.0 {
            return Err(LoadError::InvalidSchedule(
                "exponential ramp requires start > 0".to_string(),
            ));
        }
        if b < 0.0 {
            return Err(LoadError::InvalidSchedule(
                "exponential ramp requires end >= 0".to_string(),
            ));
        }
        if steps == 1 {
            return RampSchedule::constant(end, step_duration);
        }

        let multiplier = (b / a).powf(1.0 / (steps - 1) as f64);
        let values = (0..steps).map(|i| match i {
            0 => start,
            i if i == steps - 1 => end,
            i => T::from_f64(a * multiplier.powi(i as i32)),
        });

        RampSchedule::new(values.map(|v| RampStep::new(v, step_duration)).collect())
    }

    /// 1, 2, 4, ... 64 for the first seven steps, then 100, 150, 200, ...
    pub fn power_of_two_then_linear<T: RampValue>(
        steps: usize,
        step_duration: Duration,
    ) -> Result<RampSchedule<T>> {
        Self::check_shape(steps, step_duration)?;
        let values = (0..steps).map(|i| {
            if i < POWER_OF_TWO_STEPS {
                T::from_f64((1u64 << i) as f64)
            } else {
                T::from_f64(100.0 + 50.0 * (i - POWER_OF_TWO_STEPS) as f64)
            }
        });

        RampSchedule::new(values.map(|v| RampStep::new(v, step_duration)).collect())
    }

    fn check_shape(steps: usize, step_duration: Duration) -> Result<()> {
        if steps == 0 {
            return Err(LoadError::InvalidSchedule(
                "steps must be positive".to_string(),
            ));
        }
        if step_duration.is_zero() {
            return Err(LoadError::InvalidSchedule(
                "step duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_linear_concurrency_ramp() {
        let ramp = RampBuilder::linear(1u32, 5, 5, secs(60)).unwrap();
        let values: Vec<u32> = ramp.steps().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(ramp.total_duration(), secs(300));
        assert_eq!(ramp.steps()[0].duration, secs(60));
    }

    #[test]
    fn test_linear_truncates_integers() {
        let ramp = RampBuilder::linear(2u32, 6, 4, secs(10)).unwrap();
        let values: Vec<u32> = ramp.steps().iter().map(|s| s.value).collect();
        // 2, 3.33, 4.67, 6
        assert_eq!(values, vec![2, 3, 4, 6]);
    }

    #[test]
    fn test_linear_rate_ramp_keeps_fractions() {
        let ramp = RampBuilder::linear(0.5f64, 8.0, 5, secs(12)).unwrap();
        let values: Vec<f64> = ramp.steps().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![0.5, 2.375, 4.25, 6.125, 8.0]);
    }

    #[test]
    fn test_single_step_holds_end() {
        let ramp = RampBuilder::linear(1u32, 5, 1, secs(300)).unwrap();
        assert_eq!(ramp.steps().len(), 1);
        assert_eq!(ramp.first_value(), 5);
    }

    #[test]
    fn test_zero_steps_rejected() {
        assert!(RampBuilder::linear(1u32, 5, 0, secs(60)).is_err());
        assert!(RampBuilder::exponential(1u32, 5, 0, secs(60)).is_err());
        assert!(RampBuilder::power_of_two_then_linear::<u32>(0, secs(60)).is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let err = RampBuilder::linear(1u32, 5, 3, Duration::ZERO).unwrap_err();
        assert!(matches!(err, LoadError::InvalidSchedule(_)));
    }

    #[test]
    fn test_exponential_concurrency_ramp() {
        let ramp = RampBuilder::exponential(1u32, 8, 4, secs(30)).unwrap();
        let values: Vec<u32> = ramp.steps().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1, 2, 4, 8]);
        // growth accelerates
        assert!(values[1] - values[0] < values[3] - values[2]);
    }

    #[test]
    fn test_exponential_rejects_zero_start() {
        let err = RampBuilder::exponential(0u32, 8, 4, secs(30)).unwrap_err();
        assert!(err.to_string().contains("start > 0"));
    }

    #[test]
    fn test_power_of_two_then_linear() {
        let ramp = RampBuilder::power_of_two_then_linear::<u32>(10, secs(5)).unwrap();
        let values: Vec<u32> = ramp.steps().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1, 2, 4, 8, 16, 32, 64, 100, 150, 200]);
    }

    #[test]
    fn test_lookup_walks_cumulative_windows() {
        let ramp = RampSchedule::new(vec![
            RampStep::new(1u32, secs(10)),
            RampStep::new(4, secs(10)),
            RampStep::new(2, secs(10)),
        ])
        .unwrap();

        assert_eq!(ramp.lookup(Duration::ZERO), 1);
        assert_eq!(ramp.lookup(secs(10)), 1);
        assert_eq!(ramp.lookup(Duration::from_millis(10_001)), 4);
        assert_eq!(ramp.lookup(secs(25)), 2);
        assert_eq!(ramp.lookup(secs(3600)), 2);
        assert_eq!(ramp.max_value(), 4);

        assert_eq!(ramp.value_from(Duration::ZERO), 1);
        assert_eq!(ramp.value_from(secs(10)), 4);
        assert_eq!(ramp.value_from(secs(30)), 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RampSchedule::constant(-1.0f64, secs(1)).is_err());
        assert!(RampSchedule::constant(f64::NAN, secs(1)).is_err());
        assert!(RampSchedule::<u32>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_change_points() {
        let ramp = RampBuilder::linear(1u32, 3, 3, secs(5)).unwrap();
        assert_eq!(
            ramp.change_points(),
            vec![Duration::ZERO, secs(5), secs(10), secs(15)]
        );
    }

    #[test]
    fn test_next_change_skips_flat_boundaries() {
        let ramp = RampSchedule::new(vec![
            RampStep::new(0.1f64, secs(10)),
            RampStep::new(0.1, secs(10)),
            RampStep::new(50.0, secs(10)),
        ])
        .unwrap();

        assert_eq!(ramp.next_change_after(Duration::ZERO), Some(secs(20)));
        assert_eq!(ramp.next_change_after(secs(20)), Some(secs(20)));
        assert_eq!(ramp.next_change_after(Duration::from_millis(20_001)), None);
        assert_eq!(
            RampSchedule::constant(3u32, secs(5)).unwrap().next_change_after(Duration::ZERO),
            None
        );
    }

    #[test]
    fn test_display() {
        let ramp = RampBuilder::linear(1u32, 2, 2, secs(5)).unwrap();
        assert_eq!(ramp.to_string(), "[(1, 5s), (2, 5s)]");
    }

    proptest! {
        #[test]
        fn prop_linear_endpoints_and_monotonic(
            start in 0u32..500,
            end in 0u32..500,
            steps in 2usize..40,
            step_secs in 1u64..120,
        ) {
            let ramp = RampBuilder::linear(start, end, steps, secs(step_secs)).unwrap();
            prop_assert_eq!(ramp.lookup(Duration::ZERO), start);
            prop_assert_eq!(ramp.lookup(ramp.total_duration()), end);
            prop_assert_eq!(ramp.total_duration(), secs(step_secs * steps as u64));

            let values: Vec<u32> = ramp.steps().iter().map(|s| s.value).collect();
            for pair in values.windows(2) {
                if end >= start {
                    prop_assert!(pair[0] <= pair[1]);
                } else {
                    prop_assert!(pair[0] >= pair[1]);
                }
            }
        }

        #[test]
        fn prop_lookup_holds_last_value(
            values in proptest::collection::vec(0.0f64..1000.0, 1..20),
            extra_ms in 1u64..1_000_000,
        ) {
            let steps = values
                .iter()
                .map(|v| RampStep::new(*v, secs(3)))
                .collect();
            let ramp = RampSchedule::new(steps).unwrap();
            let past_end = ramp.total_duration() + Duration::from_millis(extra_ms);
            prop_assert_eq!(ramp.lookup(past_end), ramp.last_value());
        }

        #[test]
        fn prop_exponential_endpoints(
            start in 1u32..100,
            end in 1u32..5000,
            steps in 2usize..20,
        ) {
            let ramp = RampBuilder::exponential(start, end, steps, secs(1)).unwrap();
            prop_assert_eq!(ramp.first_value(), start);
            prop_assert_eq!(ramp.last_value(), end);
        }
    }
}
