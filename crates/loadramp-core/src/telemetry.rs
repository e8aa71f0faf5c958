//! Structured run telemetry
//!
//! Workers and the controller push [`TelemetryEvent`]s into a
//! [`TelemetrySink`]. Emission is fire-and-forget: a sink must return
//! immediately and may drop events rather than block a worker.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LoadError, Result};

// ============================================================================
// EVENTS
// ============================================================================

/// Run lifecycle markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleKind {
    Start,
    WarmupStart,
    WarmupEnd,
    Pause,
    Resume,
    Interrupted,
    End,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::WarmupStart => "WARMUP_START",
            Self::WarmupEnd => "WARMUP_END",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Interrupted => "INTERRUPTED",
            Self::End => "END",
        }
    }
}

/// One completed request with the in-flight counts at completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub execution_id: String,
    pub target_id: String,
    pub group: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub success: bool,
    pub error: Option<String>,
    /// Recorded into the warmup stream rather than the measured one
    pub warmup: bool,
    pub in_flight_target: u64,
    pub in_flight_global: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub execution_id: String,
    pub kind: LifecycleKind,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
    /// Reported only; load generation was not gated by this event
    #[serde(default)]
    pub advisory: bool,
}

impl LifecycleEvent {
    pub fn now(execution_id: &str, kind: LifecycleKind) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            kind,
            timestamp: Utc::now(),
            detail: None,
            advisory: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn advisory(mut self, advisory: bool) -> Self {
        self.advisory = advisory;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Request(RequestEvent),
    Lifecycle(LifecycleEvent),
}

// ============================================================================
// SINKS
// ============================================================================

/// Destination for telemetry; `emit` must never block
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Forwards each event to every inner sink
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for FanoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Buffered newline-delimited JSON file writer
///
/// Events go through a bounded channel to a background writer task that
/// flushes on a timer. When the channel is full the event is dropped and
/// counted.
pub struct JsonLinesSink {
    tx: Mutex<Option<mpsc::Sender<TelemetryEvent>>>,
    writer: Mutex<Option<JoinHandle<std::io::Result<u64>>>>,
    dropped: AtomicU64,
}

impl JsonLinesSink {
    /// Create (truncating) `path` and start the writer task
    pub async fn create(
        path: impl AsRef<Path>,
        capacity: usize,
        flush_interval: Duration,
    ) -> Result<Self> {
        let file = tokio::fs::File::create(path.as_ref()).await?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_lines(file, rx, flush_interval));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Events discarded because the buffer was full or the sink closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events, drain the buffer and flush; returns lines written
    pub async fn close(&self) -> Result<u64> {
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        match writer {
            Some(handle) => match handle.await {
                Ok(result) => Ok(result?),
                Err(e) => Err(LoadError::Io(format!("telemetry writer failed: {}", e))),
            },
            None => Ok(0),
        }
    }
}

impl TelemetrySink for JsonLinesSink {
    fn emit(&self, event: TelemetryEvent) {
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        };
        if !sent {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn write_lines(
    file: tokio::fs::File,
    mut rx: mpsc::Receiver<TelemetryEvent>,
    flush_interval: Duration,
) -> std::io::Result<u64> {
    let mut out = BufWriter::new(file);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut written = 0u64;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let mut line = serde_json::to_vec(&event)?;
                    line.push(b'\n');
                    out.write_all(&line).await?;
                    written += 1;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = out.flush().await {
                    warn!("Telemetry flush failed: {}", e);
                }
            }
        }
    }

    out.flush().await?;
    debug!("Telemetry writer closed after {} events", written);
    Ok(written)
}

/// Prometheus instruments fed from the event stream
pub struct PrometheusSink {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
    in_flight: IntGauge,
    lifecycle: IntCounterVec,
    paused: IntGauge,
}

impl PrometheusSink {
    pub fn new() -> std::result::Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("loadramp_requests_total", "Completed requests"),
            &["target", "status"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("loadramp_request_latency_seconds", "Request latency").buckets(
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            ),
            &["target"],
        )?;
        let in_flight = IntGauge::new("loadramp_in_flight", "Requests in flight at last completion")?;
        let lifecycle = IntCounterVec::new(
            Opts::new("loadramp_lifecycle_events_total", "Run lifecycle events"),
            &["kind"],
        )?;
        let paused = IntGauge::new("loadramp_paused", "1 while load generation is paused")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(lifecycle.clone()))?;
        registry.register(Box::new(paused.clone()))?;

        Ok(Self {
            registry,
            requests,
            latency,
            in_flight,
            lifecycle,
            paused,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric
    pub fn gather_text(&self) -> std::result::Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl TelemetrySink for PrometheusSink {
    fn emit(&self, event: TelemetryEvent) {
        match event {
            // warmup traffic is not part of the measured series
            TelemetryEvent::Request(req) if req.warmup => {}
            TelemetryEvent::Request(req) => {
                let status = if req.success { "success" } else { "error" };
                self.requests.with_label_values(&[&req.target_id, status]).inc();
                self.latency
                    .with_label_values(&[&req.target_id])
                    .observe(req.latency_ms / 1_000.0);
                self.in_flight.set(req.in_flight_global as i64);
            }
            TelemetryEvent::Lifecycle(ev) => {
                self.lifecycle.with_label_values(&[ev.kind.as_str()]).inc();
                match ev.kind {
                    LifecycleKind::Pause if !ev.advisory => self.paused.set(1),
                    LifecycleKind::Resume | LifecycleKind::End => self.paused.set(0),
                    _ => {}
                }
            }
        }
    }
}
