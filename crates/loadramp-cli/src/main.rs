//! # Loadramp CLI
//!
//! Command-line interface for ramp-driven load tests against
//! OpenSearch-compatible backends.
//!
//! ## Usage
//!
//! ```bash
//! # Run a plan
//! loadramp run --plan plan.toml --output summary.json --events events.jsonl
//!
//! # Show the execution plan and target timeline
//! loadramp plan --plan plan.toml
//!
//! # Preview a ramp
//! loadramp ramp linear --start 1 --end 20 --steps 5 --step-secs 30
//! ```

mod backend;
mod config;
mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use loadramp_core::health::{HealthMonitor, HealthProbe, LocalCpuProbe};
use loadramp_core::schedule::{RampBuilder, RampSchedule, RampValue};
use loadramp_core::telemetry::{FanoutSink, JsonLinesSink, PrometheusSink, TelemetrySink};
use loadramp_core::{LoadController, QueryExecutor, RunOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::{ClusterCpuProbe, Endpoint, HttpQueryExecutor};
use crate::config::PlanDocument;

#[derive(Parser)]
#[command(name = "loadramp")]
#[command(author, version)]
#[command(about = "Ramp-driven load generator for search backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test plan
    Run {
        /// Plan file path
        #[arg(short, long, default_value = "loadramp.toml")]
        plan: PathBuf,

        /// Override the measured duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Skip the warmup phase even if the plan enables it
        #[arg(long)]
        no_warmup: bool,

        /// Which health signal gates the run when the plan has a [health] table
        #[arg(long, value_enum, default_value_t = ProbeKind::Cluster)]
        health_probe: ProbeKind,

        /// Write the run report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stream request and lifecycle events as JSON lines
        #[arg(long)]
        events: Option<PathBuf>,

        /// Write Prometheus text exposition at the end of the run
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Print the execution plan and target timeline
    Plan {
        /// Plan file path
        #[arg(short, long, default_value = "loadramp.toml")]
        plan: PathBuf,

        /// Print the timeline as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the backend in a plan is reachable
    Check {
        /// Plan file path
        #[arg(short, long, default_value = "loadramp.toml")]
        plan: PathBuf,
    },

    /// Preview a ramp schedule
    Ramp {
        #[command(subcommand)]
        shape: RampShape,

        /// Build integer (concurrency) values instead of rates
        #[arg(long, global = true)]
        concurrency: bool,
    },
}

#[derive(Subcommand)]
enum RampShape {
    /// Evenly spaced steps from start to end
    Linear {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        #[arg(long)]
        steps: usize,
        #[arg(long, default_value = "60")]
        step_secs: u64,
    },
    /// Geometric steps from start to end
    Exponential {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        #[arg(long)]
        steps: usize,
        #[arg(long, default_value = "60")]
        step_secs: u64,
    },
    /// 1, 2, 4 ... 64, then +50 per step
    Pow2 {
        #[arg(long)]
        steps: usize,
        #[arg(long, default_value = "60")]
        step_secs: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ProbeKind {
    /// Highest CPU among the backend's data nodes
    Cluster,
    /// CPU of the machine generating load
    Local,
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Run {
            plan,
            duration,
            no_warmup,
            health_probe,
            output,
            events,
            metrics_out,
        } => {
            let outcome = run(RunArgs {
                plan,
                duration,
                no_warmup,
                health_probe,
                output,
                events,
                metrics_out,
            })
            .await?;
            if outcome == RunOutcome::ConnectionFailed {
                anyhow::bail!("backend unreachable; no load was generated");
            }
        }

        Commands::Plan { plan, json } => {
            let (plan, _) = PlanDocument::load(&plan)?.into_plan(None, false)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan.timeline())?);
            } else {
                print!("{}", plan.describe());
            }
        }

        Commands::Check { plan } => {
            let (plan, backend) = PlanDocument::load(&plan)?.into_plan(None, false)?;
            let endpoint = Endpoint::new(&backend, plan.settings().request_timeout())?;
            let executor = HttpQueryExecutor::new(endpoint);
            let description = executor
                .check_connection()
                .await
                .with_context(|| format!("connecting to {}", backend.url))?;
            println!("✓ Connected to {}", description);
        }

        Commands::Ramp { shape, concurrency } => {
            if concurrency {
                print_schedule(&build_ramp::<u32>(&shape)?);
            } else {
                print_schedule(&build_ramp::<f64>(&shape)?);
            }
        }
    }

    Ok(())
}

struct RunArgs {
    plan: PathBuf,
    duration: Option<u64>,
    no_warmup: bool,
    health_probe: ProbeKind,
    output: Option<PathBuf>,
    events: Option<PathBuf>,
    metrics_out: Option<PathBuf>,
}

async fn run(args: RunArgs) -> anyhow::Result<RunOutcome> {
    let (plan, backend) = PlanDocument::load(&args.plan)?.into_plan(args.duration, args.no_warmup)?;
    print!("{}", plan.describe());

    let endpoint = Endpoint::new(&backend, plan.settings().request_timeout())?;
    let executor = Arc::new(HttpQueryExecutor::new(endpoint.clone()));

    let mut fanout = FanoutSink::new();
    let events = match &args.events {
        Some(path) => {
            let sink = Arc::new(JsonLinesSink::create(path, 65_536, Duration::from_secs(1)).await?);
            fanout = fanout.with(sink.clone());
            Some(sink)
        }
        None => None,
    };
    let prometheus = match &args.metrics_out {
        Some(_) => {
            let sink = Arc::new(PrometheusSink::new()?);
            fanout = fanout.with(sink.clone());
            Some(sink)
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; draining in-flight requests");
            signal_token.cancel();
        }
    });

    let mut controller = LoadController::new(plan, executor, cancel)
        .with_telemetry(Arc::new(fanout) as Arc<dyn TelemetrySink>);

    if let Some(settings) = controller.plan().health().cloned() {
        let probe: Arc<dyn HealthProbe> = match args.health_probe {
            ProbeKind::Cluster => Arc::new(ClusterCpuProbe::new(endpoint)),
            ProbeKind::Local => Arc::new(LocalCpuProbe::new()),
        };
        controller = controller.with_health_monitor(HealthMonitor::new(probe, settings));
    }

    let report = controller.run().await;
    report::print_run_report(&report);

    if let (Some(sink), Some(path)) = (events, &args.events) {
        let written = sink.close().await?;
        info!(
            "Wrote {} events to {} ({} dropped)",
            written,
            path.display(),
            sink.dropped()
        );
    }
    if let (Some(sink), Some(path)) = (prometheus, &args.metrics_out) {
        std::fs::write(path, sink.gather_text()?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Metrics saved to {}", path.display());
    }
    if let Some(path) = &args.output {
        report::write_json(path, &report)?;
        info!("Results saved to {}", path.display());
    }

    Ok(report.outcome)
}

fn build_ramp<T: RampValue>(shape: &RampShape) -> anyhow::Result<RampSchedule<T>> {
    let schedule = match *shape {
        RampShape::Linear { start, end, steps, step_secs } => RampBuilder::linear(
            T::from_f64(start),
            T::from_f64(end),
            steps,
            Duration::from_secs(step_secs),
        )?,
        RampShape::Exponential { start, end, steps, step_secs } => RampBuilder::exponential(
            T::from_f64(start),
            T::from_f64(end),
            steps,
            Duration::from_secs(step_secs),
        )?,
        RampShape::Pow2 { steps, step_secs } => {
            RampBuilder::power_of_two_then_linear(steps, Duration::from_secs(step_secs))?
        }
    };
    Ok(schedule)
}

fn print_schedule<T: RampValue>(schedule: &RampSchedule<T>) {
    println!("{:<6}{:>10}{:>12}", "Step", "Start", "Value");
    println!("{}", "-".repeat(28));
    let mut offset = Duration::ZERO;
    for (i, step) in schedule.steps().iter().enumerate() {
        println!("{:<6}{:>9}s{:>12}", i, offset.as_secs(), step.value);
        offset += step.duration;
    }
    println!("\nTotal: {}s, max {}", schedule.total_duration().as_secs(), schedule.max_value());
    println!("{}", schedule);
}
