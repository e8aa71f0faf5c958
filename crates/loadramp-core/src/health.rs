//! Backend health gating
//!
//! A [`HealthMonitor`] polls a [`HealthProbe`] on a fixed interval and flips
//! a shared [`PauseFlag`] with hysteresis: it pauses when the sample exceeds
//! `threshold` and resumes only once the sample falls to
//! `threshold - hysteresis`. Callbacks fire once per transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LoadError, ProbeError, Result};

/// Health gating configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthSettings {
    /// Pause above this value
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Resume at or below `threshold - hysteresis`
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,

    /// Seconds between samples
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// When false, transitions are reported but load is never paused
    #[serde(default = "default_true")]
    pub pause_load: bool,
}

fn default_threshold() -> f64 {
    90.0
}

fn default_hysteresis() -> f64 {
    5.0
}

fn default_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            hysteresis: default_hysteresis(),
            interval_secs: default_interval_secs(),
            pause_load: true,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn resume_level(&self) -> f64 {
        self.threshold - self.hysteresis
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(LoadError::InvalidPlan("health threshold must be finite".to_string()));
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(LoadError::InvalidPlan(
                "health hysteresis must be non-negative".to_string(),
            ));
        }
        if self.interval_secs == 0 {
            return Err(LoadError::InvalidPlan(
                "health interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source of the tracked health metric (e.g. CPU percent)
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn sample(&self) -> std::result::Result<f64, ProbeError>;
}

/// Shared pause switch read by every worker
#[derive(Debug, Clone, Default)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::Release);
    }
}

/// Edge reported by [`HealthMonitor::observe`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthTransition {
    Paused { value: f64 },
    Resumed { value: f64 },
}

pub type HealthCallback = Box<dyn Fn(f64) + Send + Sync>;

/// Polls a probe and gates load generation
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    settings: HealthSettings,
    flag: PauseFlag,
    paused: AtomicBool,
    on_pause: Vec<HealthCallback>,
    on_resume: Vec<HealthCallback>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, settings: HealthSettings) -> Self {
        Self {
            probe,
            settings,
            flag: PauseFlag::new(),
            paused: AtomicBool::new(false),
            on_pause: Vec::new(),
            on_resume: Vec::new(),
        }
    }

    /// Register a callback run once on every running → paused edge
    pub fn on_pause(&mut self, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.on_pause.push(Box::new(callback));
    }

    /// Register a callback run once on every paused → running edge
    pub fn on_resume(&mut self, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.on_resume.push(Box::new(callback));
    }

    /// Flag that workers consult; replaced so a controller can share its own
    pub fn set_pause_flag(&mut self, flag: PauseFlag) {
        self.flag = flag;
    }

    pub fn pause_flag(&self) -> PauseFlag {
        self.flag.clone()
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Whether the monitored metric is currently over threshold
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Feed one sample through the hysteresis band
    pub fn observe(&self, value: f64) -> Option<HealthTransition> {
        let paused = self.is_paused();
        let transition = if !paused && value > self.settings.threshold {
            HealthTransition::Paused { value }
        } else if paused && value <= self.settings.resume_level() {
            HealthTransition::Resumed { value }
        } else {
            return None;
        };

        let now_paused = matches!(transition, HealthTransition::Paused { .. });
        self.paused.store(now_paused, Ordering::Release);
        if self.settings.pause_load {
            self.flag.set(now_paused);
        }

        let callbacks = if now_paused { &self.on_pause } else { &self.on_resume };
        for callback in callbacks {
            callback(value);
        }
        Some(transition)
    }

    /// Poll until `cancel` fires; probe errors skip the cycle
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Health monitor started ({}; threshold {:.1}, resume at {:.1}, every {}s{})",
            self.probe.name(),
            self.settings.threshold,
            self.settings.resume_level(),
            self.settings.interval_secs,
            if self.settings.pause_load { "" } else { ", monitoring only" }
        );

        loop {
            let sample = tokio::select! {
                _ = cancel.cancelled() => break,
                sample = self.probe.sample() => sample,
            };

            match sample {
                Ok(value) => match self.observe(value) {
                    Some(HealthTransition::Paused { value }) => warn!(
                        "{} at {:.1} > {:.1}: pausing load generation",
                        self.probe.name(),
                        value,
                        self.settings.threshold
                    ),
                    Some(HealthTransition::Resumed { value }) => info!(
                        "{} at {:.1}: resuming load generation",
                        self.probe.name(),
                        value
                    ),
                    None => {}
                },
                Err(e) => warn!("Health probe {} failed: {}", self.probe.name(), e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval()) => {}
            }
        }

        info!("Health monitor stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

/// Host CPU utilisation in percent
pub struct LocalCpuProbe {
    system: Mutex<System>,
}

impl LocalCpuProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // first reading primes the usage delta
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for LocalCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for LocalCpuProbe {
    fn name(&self) -> &str {
        "local CPU"
    }

    async fn sample(&self) -> std::result::Result<f64, ProbeError> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        let usage = system.global_cpu_info().cpu_usage() as f64;
        if usage.is_finite() {
            Ok(usage)
        } else {
            Err(ProbeError::Malformed(format!("cpu usage {}", usage)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedProbe {
        samples: Mutex<VecDeque<std::result::Result<f64, ProbeError>>>,
    }

    impl ScriptedProbe {
        fn new(samples: Vec<std::result::Result<f64, ProbeError>>) -> Self {
            Self {
                samples: Mutex::new(samples.into()),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn sample(&self) -> std::result::Result<f64, ProbeError> {
            self.samples
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProbeError::Unavailable("script exhausted".into())))
        }
    }

    fn monitor(settings: HealthSettings) -> (HealthMonitor, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let mut monitor = HealthMonitor::new(Arc::new(ScriptedProbe::new(Vec::new())), settings);
        let pauses = Arc::new(AtomicUsize::new(0));
        let resumes = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pauses);
        monitor.on_pause(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let r = Arc::clone(&resumes);
        monitor.on_resume(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        (monitor, pauses, resumes)
    }

    #[test]
    fn test_hysteresis_band() {
        let (monitor, pauses, resumes) = monitor(HealthSettings::default());
        let flag = monitor.pause_flag();

        assert_eq!(monitor.observe(85.0), None);
        assert_eq!(monitor.observe(90.0), None);
        assert_eq!(monitor.observe(91.0), Some(HealthTransition::Paused { value: 91.0 }));
        assert!(flag.is_paused());

        // still inside the dead band
        assert_eq!(monitor.observe(99.0), None);
        assert_eq!(monitor.observe(89.0), None);
        assert_eq!(monitor.observe(85.1), None);
        assert!(flag.is_paused());

        assert_eq!(monitor.observe(85.0), Some(HealthTransition::Resumed { value: 85.0 }));
        assert!(!flag.is_paused());
        assert_eq!(monitor.observe(95.0), Some(HealthTransition::Paused { value: 95.0 }));

        assert_eq!(pauses.load(Ordering::SeqCst), 2);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_monitoring_only_never_sets_flag() {
        let settings = HealthSettings {
            pause_load: false,
            ..HealthSettings::default()
        };
        let (monitor, pauses, _) = monitor(settings);

        assert!(monitor.observe(99.0).is_some());
        assert!(monitor.is_paused());
        assert!(!monitor.pause_flag().is_paused());
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_flag() {
        let (mut monitor, _, _) = monitor(HealthSettings::default());
        let shared = PauseFlag::new();
        monitor.set_pause_flag(shared.clone());
        monitor.observe(100.0);
        assert!(shared.is_paused());
    }

    #[test]
    fn test_settings_validation() {
        assert!(HealthSettings::default().validate().is_ok());
        let bad = HealthSettings {
            hysteresis: -1.0,
            ..HealthSettings::default()
        };
        assert!(bad.validate().is_err());
        let bad = HealthSettings {
            interval_secs: 0,
            ..HealthSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_do_not_toggle() {
        let probe = ScriptedProbe::new(vec![
            Ok(95.0),
            Err(ProbeError::Unavailable("node stats timed out".into())),
            Err(ProbeError::Malformed("nan".into())),
            Ok(50.0),
        ]);
        let settings = HealthSettings {
            interval_secs: 1,
            ..HealthSettings::default()
        };
        let mut monitor = HealthMonitor::new(Arc::new(probe), settings);
        let resumes = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&resumes);
        monitor.on_resume(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let monitor = Arc::new(monitor);
        let flag = monitor.pause_flag();

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&monitor).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // two errors after the pause: still paused
        assert!(flag.is_paused());
        assert_eq!(resumes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!flag.is_paused());
        assert_eq!(resumes.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_cpu_probe_samples() {
        let probe = LocalCpuProbe::new();
        let value = probe.sample().await.unwrap();
        assert!(value >= 0.0);
    }
}
