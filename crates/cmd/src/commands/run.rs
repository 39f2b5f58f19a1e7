// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Run command - executes benchmarks and prints a result table
//!
//! Example:
//!   qbench run --config qbench.yaml -b tpch-q1 -v scale=10 -s nightly-1,nightly-2

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use qbench::{BenchmarkExecutionResult, MeasurementUnit};
use tokio_util::sync::CancellationToken;

use crate::common::DriverContext;

/// Run the named benchmarks (all of them when `names` is empty), once per
/// execution sequence id.
///
/// Listeners are drained before returning so every event reaches them.
pub async fn run_command(
    context: &DriverContext,
    names: &[String],
    sequence_ids: &[String],
    cancel: CancellationToken,
    out: &mut impl Write,
) -> Result<Vec<Arc<BenchmarkExecutionResult>>> {
    let benchmarks = context.loader().load_sequences(names, sequence_ids)?;
    let count = benchmarks.len();
    diagnostics::info!("Loaded {count} benchmarks", count);

    let listeners = context.listeners()?;
    let orchestrator = context.orchestrator(listeners.reporter(), cancel).await?;
    let outcome = orchestrator.run_suite(benchmarks).await;
    drop(orchestrator);
    listeners
        .shutdown(context.config.listener_drain_timeout())
        .await;

    let results = outcome?;
    write_results(&results, out)?;
    Ok(results)
}

fn write_results(results: &[Arc<BenchmarkExecutionResult>], out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "{:<32} {:<8} {:>6} {:>6} {:>12} {:>8}",
        "BENCHMARK", "STATUS", "RUNS", "FAILED", "MEAN (ms)", "STDDEV%"
    )?;
    for result in results {
        let duration = result
            .aggregates()
            .get("duration")
            .filter(|a| a.unit == MeasurementUnit::Milliseconds);
        let (mean, spread) = match duration {
            Some(aggregate) => (
                format!("{:.2}", aggregate.mean),
                format!("{:.1}", aggregate.std_dev_percent),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        writeln!(
            out,
            "{:<32} {:<8} {:>6} {:>6} {:>12} {:>8}",
            format!("{}@{}", result.benchmark().name, result.benchmark().sequence_id),
            result.status().to_string(),
            result.executions().len(),
            result.failed_executions(),
            mean,
            spread
        )?;
        if let Some(throughput) = result.measurements().iter().find(|m| m.name == "throughput") {
            writeln!(out, "{:<32} throughput {:.2} {}", "", throughput.value, throughput.unit)?;
        }
    }
    Ok(())
}
