// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Execution records: one per query attempt and one per benchmark

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::benchmark::Benchmark;
use crate::error::BenchError;
use crate::measurement::Measurement;
use crate::statistics::AggregatedMeasurement;

/// One rendered statement ready to run.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    pub benchmark: Arc<Benchmark>,
    pub query_name: String,
    /// Position in submission order, used to restore ordering after a join.
    pub sequence_id: usize,
    pub attributes: BTreeMap<String, String>,
    pub statement: String,
}

impl QueryExecution {
    /// Human-readable identity used in logs and listener events.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{}/{}#{}",
            self.benchmark.name, self.query_name, self.sequence_id
        )
    }
}

#[derive(Debug)]
enum Timer {
    NotStarted,
    Running {
        start: Instant,
        started_at: DateTime<Utc>,
    },
}

/// Accumulates the outcome of a query while it runs.
///
/// The builder moves `NotStarted -> Running` on [`start_timer`] and is
/// consumed by [`end_timer`], which yields a result that is either
/// succeeded or failed depending on whether a failure was recorded.
///
/// [`start_timer`]: QueryExecutionResultBuilder::start_timer
/// [`end_timer`]: QueryExecutionResultBuilder::end_timer
#[derive(Debug)]
pub struct QueryExecutionResultBuilder {
    execution: QueryExecution,
    timer: Timer,
    rows_count: u64,
    engine_query_id: Option<String>,
    failure: Option<BenchError>,
}

impl QueryExecutionResultBuilder {
    #[must_use]
    pub fn new(execution: QueryExecution) -> Self {
        Self {
            execution,
            timer: Timer::NotStarted,
            rows_count: 0,
            engine_query_id: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn execution(&self) -> &QueryExecution {
        &self.execution
    }

    pub fn start_timer(&mut self) -> Result<(), BenchError> {
        if let Timer::Running { .. } = self.timer {
            return Err(BenchError::IllegalState(format!(
                "timer for {} already started",
                self.execution.label()
            )));
        }
        self.timer = Timer::Running {
            start: Instant::now(),
            started_at: Utc::now(),
        };
        Ok(())
    }

    pub fn set_rows_count(&mut self, rows: u64) {
        self.rows_count = rows;
    }

    pub fn set_engine_query_id(&mut self, id: Option<String>) {
        self.engine_query_id = id;
    }

    /// Record the failure cause. The first recorded cause wins.
    pub fn failed(&mut self, cause: BenchError) {
        if self.failure.is_none() {
            self.failure = Some(cause);
        }
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn end_timer(self) -> Result<QueryExecutionResult, BenchError> {
        let Timer::Running { start, started_at } = self.timer else {
            return Err(BenchError::IllegalState(format!(
                "timer for {} stopped before it was started",
                self.execution.label()
            )));
        };
        Ok(QueryExecutionResult {
            execution: self.execution,
            start,
            end: Instant::now(),
            started_at,
            finished_at: Utc::now(),
            rows_count: self.rows_count,
            engine_query_id: self.engine_query_id,
            failure: self.failure,
            measurements: Vec::new(),
        })
    }
}

/// Completed query attempt plus its measurements.
#[derive(Debug)]
pub struct QueryExecutionResult {
    execution: QueryExecution,
    start: Instant,
    end: Instant,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    rows_count: u64,
    engine_query_id: Option<String>,
    failure: Option<BenchError>,
    measurements: Vec<Measurement>,
}

impl QueryExecutionResult {
    #[cfg(test)]
    pub(crate) fn from_timing(
        execution: QueryExecution,
        start: Instant,
        end: Instant,
        failure: Option<BenchError>,
    ) -> Self {
        Self {
            execution,
            start,
            end,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            rows_count: 0,
            engine_query_id: None,
            failure,
            measurements: Vec::new(),
        }
    }

    #[must_use]
    pub fn execution(&self) -> &QueryExecution {
        &self.execution
    }

    #[must_use]
    pub fn benchmark(&self) -> &Benchmark {
        &self.execution.benchmark
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.failure.is_none()
    }

    #[must_use]
    pub fn failure(&self) -> Option<&BenchError> {
        self.failure.as_ref()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }

    #[must_use]
    pub fn start(&self) -> Instant {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Instant {
        self.end
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    #[must_use]
    pub fn rows_count(&self) -> u64 {
        self.rows_count
    }

    #[must_use]
    pub fn engine_query_id(&self) -> Option<&str> {
        self.engine_query_id.as_deref()
    }

    #[must_use]
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub(crate) fn set_measurements(&mut self, measurements: Vec<Measurement>) {
        self.measurements = measurements;
    }

    pub(crate) fn set_failure(&mut self, cause: BenchError) {
        if self.failure.is_none() {
            self.failure = Some(cause);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenchmarkStatus {
    Success,
    Failed,
}

impl std::fmt::Display for BenchmarkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkStatus::Success => write!(f, "SUCCESS"),
            BenchmarkStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Where a benchmark is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenchmarkPhase {
    Pending,
    RunningPreMacros,
    Executing,
    Aggregating,
    RunningPostMacros,
    Completed,
    Failed,
}

impl BenchmarkPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, BenchmarkPhase::Completed | BenchmarkPhase::Failed)
    }
}

/// Everything one benchmark produced for one sequence id.
#[derive(Debug)]
pub struct BenchmarkExecutionResult {
    benchmark: Arc<Benchmark>,
    phase: BenchmarkPhase,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    executions: Vec<Arc<QueryExecutionResult>>,
    failures: Vec<BenchError>,
    measurements: Vec<Measurement>,
    aggregates: BTreeMap<String, AggregatedMeasurement>,
}

impl BenchmarkExecutionResult {
    #[must_use]
    pub fn new(benchmark: Arc<Benchmark>) -> Self {
        Self {
            benchmark,
            phase: BenchmarkPhase::Pending,
            started_at: Utc::now(),
            finished_at: None,
            executions: Vec::new(),
            failures: Vec::new(),
            measurements: Vec::new(),
            aggregates: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn benchmark(&self) -> &Benchmark {
        &self.benchmark
    }

    #[must_use]
    pub fn benchmark_arc(&self) -> Arc<Benchmark> {
        self.benchmark.clone()
    }

    #[must_use]
    pub fn phase(&self) -> BenchmarkPhase {
        self.phase
    }

    /// FAILED when any benchmark-level error or any repetition failed.
    #[must_use]
    pub fn status(&self) -> BenchmarkStatus {
        if self.is_successful() {
            BenchmarkStatus::Success
        } else {
            BenchmarkStatus::Failed
        }
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.phase != BenchmarkPhase::Failed
            && self.failures.is_empty()
            && self.executions.iter().all(|e| e.is_successful())
    }

    #[must_use]
    pub fn executions(&self) -> &[Arc<QueryExecutionResult>] {
        &self.executions
    }

    #[must_use]
    pub fn failed_executions(&self) -> usize {
        self.executions.iter().filter(|e| !e.is_successful()).count()
    }

    /// Benchmark-level failures first, then per-execution causes in
    /// sequence order.
    #[must_use]
    pub fn failure_causes(&self) -> Vec<&BenchError> {
        self.failures
            .iter()
            .chain(self.executions.iter().filter_map(|e| e.failure()))
            .collect()
    }

    /// Wall time from the first execution start to the last execution end.
    #[must_use]
    pub fn query_duration(&self) -> Option<Duration> {
        let start = self.executions.iter().map(|e| e.start()).min()?;
        let end = self.executions.iter().map(|e| e.end()).max()?;
        Some(end.duration_since(start))
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    #[must_use]
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    #[must_use]
    pub fn aggregates(&self) -> &BTreeMap<String, AggregatedMeasurement> {
        &self.aggregates
    }

    pub(crate) fn set_phase(&mut self, phase: BenchmarkPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_executions(&mut self, executions: Vec<Arc<QueryExecutionResult>>) {
        self.executions = executions;
    }

    pub(crate) fn add_failure(&mut self, cause: BenchError) {
        self.failures.push(cause);
    }

    pub(crate) fn set_measurements(&mut self, measurements: Vec<Measurement>) {
        self.measurements = measurements;
    }

    pub(crate) fn set_aggregates(&mut self, aggregates: BTreeMap<String, AggregatedMeasurement>) {
        self.aggregates = aggregates;
    }

    pub(crate) fn finish(&mut self, phase: BenchmarkPhase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }
}
