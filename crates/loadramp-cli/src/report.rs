//! Run report rendering and export

use std::path::Path;

use anyhow::Context;
use loadramp_core::{RunOutcome, RunReport};

/// Print the measured summary followed by run-level details
pub fn print_run_report(report: &RunReport) {
    report.summary.print_report();

    println!("Execution:        {}", report.execution_id);
    println!("Outcome:          {}", outcome_label(report.outcome));
    println!("Elapsed:          {:.1}s", report.elapsed.as_secs_f64());
    println!(
        "Peak concurrency: {} (global)",
        report.peak_concurrency.global.max
    );
    for (group, counts) in &report.peak_concurrency.groups {
        println!("  {:<24} {}", group, counts.max);
    }
    if report.dropped_fires > 0 {
        println!("Dropped fires:    {}", report.dropped_fires);
    }
    if let Some(warmup) = &report.warmup_summary {
        println!(
            "Warmup:           {} requests ({:.1}% ok, excluded from results)",
            warmup.overall.total, warmup.overall.success_rate
        );
    }
    println!();
}

pub fn outcome_label(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Interrupted => "interrupted",
        RunOutcome::Aborted => "aborted (worker failure)",
        RunOutcome::ConnectionFailed => "connection failed",
    }
}

/// Write the full report as pretty JSON
pub fn write_json(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadramp_core::{ConcurrencySnapshot, RunSummary};
    use std::time::Duration;

    #[test]
    fn test_write_json() {
        let report = RunReport {
            execution_id: "exec-42".to_string(),
            outcome: RunOutcome::Interrupted,
            summary: RunSummary::default(),
            warmup_summary: None,
            peak_concurrency: ConcurrencySnapshot::default(),
            dropped_fires: 3,
            elapsed: Duration::from_millis(1_500),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        write_json(&path, &report).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["outcome"], "interrupted");
        assert_eq!(value["dropped_fires"], 3);
        assert_eq!(value["summary"]["overall"]["total"], 0);
    }
}
