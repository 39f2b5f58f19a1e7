// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Drives benchmarks from macros through execution to aggregated results
//!
//! Per benchmark the phases are:
//!
//! ```text
//! Pending -> RunningPreMacros -> Executing -> Aggregating -> RunningPostMacros -> Completed | Failed
//! ```
//!
//! A failed pre-macro skips straight to aggregation, so post-macros still
//! get a chance to clean up.
//!
//! Prewarm executions run before `Executing` on their own pool. They post
//! no listener events and never appear in results.

use std::collections::BTreeMap;
use std::sync::Arc;

use std::time::Duration;

use diagnostics::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::benchmark::{Benchmark, EXECUTION_SEQUENCE_ID};
use crate::config::{FailurePolicy, PostMacroPolicy};
use crate::datasource::DataSourceProvider;
use crate::error::BenchError;
use crate::execution::{BenchmarkExecutionResult, BenchmarkPhase, QueryExecution, QueryExecutionResult};
use crate::listener::StatusReporter;
use crate::macros::MacroRunner;
use crate::measurement::{Measured, MeasurementCollector};
use crate::pool::{ExecutionPool, WorkerContext};
use crate::statistics::aggregate_measurements;
use crate::template::{QueryRenderer, SqlTemplate};
use crate::variables::expand;

/// Macros that bracket a whole suite.
#[derive(Debug, Clone, Default)]
pub struct SuiteMacros {
    pub before_all: Vec<String>,
    pub after_all: Vec<String>,
    /// Run before every benchmark; a failure fails that benchmark.
    pub health_check: Vec<String>,
}

pub struct BenchmarkOrchestrator {
    renderer: Arc<dyn QueryRenderer>,
    data_sources: Arc<dyn DataSourceProvider>,
    macros: Arc<MacroRunner>,
    collector: Arc<MeasurementCollector>,
    status: StatusReporter,
    failure_policy: FailurePolicy,
    post_macro_policy: PostMacroPolicy,
    suite_macros: SuiteMacros,
    time_limit: Option<Duration>,
    cancel: CancellationToken,
}

impl BenchmarkOrchestrator {
    pub fn new(
        renderer: Arc<dyn QueryRenderer>,
        data_sources: Arc<dyn DataSourceProvider>,
        macros: Arc<MacroRunner>,
    ) -> Self {
        Self {
            renderer,
            data_sources,
            macros,
            collector: Arc::new(MeasurementCollector::with_defaults()),
            status: StatusReporter::default(),
            failure_policy: FailurePolicy::default(),
            post_macro_policy: PostMacroPolicy::default(),
            suite_macros: SuiteMacros::default(),
            time_limit: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_collector(mut self, collector: MeasurementCollector) -> Self {
        self.collector = Arc::new(collector);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusReporter) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_post_macro_policy(mut self, policy: PostMacroPolicy) -> Self {
        self.post_macro_policy = policy;
        self
    }

    #[must_use]
    pub fn with_suite_macros(mut self, macros: SuiteMacros) -> Self {
        self.suite_macros = macros;
        self
    }

    /// Executions and benchmarks that have not started when `limit` has
    /// elapsed are skipped. The clock starts with [`run_suite`](Self::run_suite)
    /// or, for a single benchmark, with [`run_benchmark`](Self::run_benchmark).
    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Cancelling `token` lets in-flight executions finish and stops
    /// everything not yet started.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run benchmarks in order between the suite macros.
    ///
    /// Only a failing before-all macro is returned as `Err`; benchmark
    /// failures are reported in the results (see
    /// [`FailedBenchmarks::check`](crate::error::FailedBenchmarks::check)).
    pub async fn run_suite(
        &self,
        benchmarks: Vec<Benchmark>,
    ) -> Result<Vec<Arc<BenchmarkExecutionResult>>, BenchError> {
        let total = benchmarks.len();
        info!("Running {total} benchmarks", total);
        let deadline = self.deadline();

        if let Err(err) = self
            .macros
            .run_all(&self.suite_macros.before_all, None, None)
            .await
        {
            self.run_after_all().await;
            return Err(err);
        }

        let mut results = Vec::with_capacity(total);
        for benchmark in benchmarks {
            if self.cancel.is_cancelled() {
                let remaining = total - results.len();
                warn!("Stop requested, skipping {remaining} remaining benchmarks", remaining);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let remaining = total - results.len();
                warn!(
                    "Time limit ran out, skipping {remaining} remaining benchmarks",
                    remaining
                );
                break;
            }

            let result = match self
                .macros
                .run_all(&self.suite_macros.health_check, Some(&benchmark), None)
                .await
            {
                Ok(()) => self.run_benchmark_until(benchmark, deadline).await,
                Err(err) => self.rejected(benchmark, err),
            };

            let stop = !result.is_successful()
                && self.failure_policy == FailurePolicy::AbortOnFirstFailure;
            results.push(result);
            if stop {
                warn!("Benchmark failed, not running the rest of the suite");
                break;
            }
        }

        self.run_after_all().await;
        Ok(results)
    }

    async fn run_after_all(&self) {
        if let Err(err) = self
            .macros
            .run_all(&self.suite_macros.after_all, None, None)
            .await
        {
            let err = err.to_string();
            error!("After-all macros failed: {err}", err: err.as_str());
        }
    }

    /// A benchmark that never started, failed with `cause`.
    fn rejected(&self, benchmark: Benchmark, cause: BenchError) -> Arc<BenchmarkExecutionResult> {
        let mut result = BenchmarkExecutionResult::new(Arc::new(benchmark));
        result.add_failure(cause);
        result.finish(BenchmarkPhase::Failed);
        let result = Arc::new(result);
        self.status.benchmark_finished(&result);
        result
    }

    fn deadline(&self) -> Option<Instant> {
        self.time_limit.map(|limit| Instant::now() + limit)
    }

    pub async fn run_benchmark(&self, benchmark: Benchmark) -> Arc<BenchmarkExecutionResult> {
        self.run_benchmark_until(benchmark, self.deadline()).await
    }

    async fn run_benchmark_until(
        &self,
        benchmark: Benchmark,
        deadline: Option<Instant>,
    ) -> Arc<BenchmarkExecutionResult> {
        if let Err(err) = benchmark.validate() {
            return self.rejected(benchmark, err);
        }

        let benchmark = Arc::new(benchmark);
        let mut result = BenchmarkExecutionResult::new(benchmark.clone());
        let label = benchmark.to_string();
        info!("Starting benchmark {label}", label);
        self.status.benchmark_started(&benchmark);

        result.set_phase(BenchmarkPhase::RunningPreMacros);
        let prepared = self
            .macros
            .run_all(&benchmark.before_benchmark_macros, Some(benchmark.as_ref()), None)
            .await;

        let mut aborted = false;
        match prepared {
            Ok(()) => {
                result.set_phase(BenchmarkPhase::Executing);
                match self.execute(&benchmark, deadline).await {
                    Ok(outcome) => {
                        aborted = outcome.aborted;
                        if outcome.interrupted {
                            result.add_failure(BenchError::Interrupted(benchmark.name.clone()));
                        }
                        if outcome.timed_out {
                            let name = benchmark.name.clone();
                            result.add_failure(BenchError::TimeLimitExceeded(name));
                        }
                        result.set_executions(outcome.executions);
                    }
                    Err(err) => result.add_failure(err),
                }
            }
            Err(err) => result.add_failure(err),
        }

        result.set_phase(BenchmarkPhase::Aggregating);
        self.aggregate(&mut result).await;

        result.set_phase(BenchmarkPhase::RunningPostMacros);
        self.run_post_macros(&mut result).await;

        let benchmark_failed = result.failure_causes().len() > result.failed_executions();
        let any_succeeded = result.executions().iter().any(|e| e.is_successful());
        let phase = if aborted || benchmark_failed || !any_succeeded {
            BenchmarkPhase::Failed
        } else {
            BenchmarkPhase::Completed
        };
        result.finish(phase);

        let status = result.status().to_string();
        let phase = format!("{phase:?}");
        info!("Finished benchmark {label}: {status} ({phase})", label, status, phase);

        let result = Arc::new(result);
        self.status.benchmark_finished(&result);
        result
    }

    async fn run_post_macros(&self, result: &mut BenchmarkExecutionResult) {
        let benchmark = result.benchmark_arc();
        if benchmark.after_benchmark_macros.is_empty() {
            return;
        }
        let total_failure = result.executions().iter().all(|e| !e.is_successful());
        if total_failure && self.post_macro_policy == PostMacroPolicy::SkipOnTotalFailure {
            let name = benchmark.name.as_str();
            info!("Skipping after-benchmark macros for {name}, nothing succeeded", name);
            return;
        }

        if let Err(err) = self
            .macros
            .run_all(&benchmark.after_benchmark_macros, Some(benchmark.as_ref()), None)
            .await
        {
            if result.is_successful() {
                result.add_failure(err);
            } else {
                let name = benchmark.name.as_str();
                let err = err.to_string();
                warn!(
                    "After-benchmark macros for already failed {name} also failed: {err}",
                    name,
                    err: err.as_str()
                );
            }
        }
    }

    async fn aggregate(&self, result: &mut BenchmarkExecutionResult) {
        match self.collector.collect(Measured::Benchmark(&*result)).await {
            Ok(measurements) => result.set_measurements(measurements),
            Err(err) => result.add_failure(err),
        }

        let successful = result
            .executions()
            .iter()
            .filter(|e| e.is_successful())
            .flat_map(|e| e.measurements());
        match aggregate_measurements(successful) {
            Ok(aggregates) => result.set_aggregates(aggregates),
            Err(err) => result.add_failure(err),
        }
    }

    async fn execute(
        &self,
        benchmark: &Arc<Benchmark>,
        deadline: Option<Instant>,
    ) -> Result<ExecutionOutcome, BenchError> {
        let templates = self.load_templates(benchmark)?;
        let context = WorkerContext {
            data_sources: self.data_sources.clone(),
            macros: self.macros.clone(),
            collector: self.collector.clone(),
            status: self.status.clone(),
        };

        // Cancelled by a stop request or when the deadline passes.
        let stop = self.cancel.child_token();
        let timer = deadline.map(|deadline| {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                stop.cancel();
            })
        });
        let outcome = self.execute_until(benchmark, &templates, context, &stop).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        let mut outcome = outcome?;

        if outcome.interrupted && !self.cancel.is_cancelled() {
            outcome.interrupted = false;
            outcome.timed_out = true;
        }
        Ok(outcome)
    }

    async fn execute_until(
        &self,
        benchmark: &Arc<Benchmark>,
        templates: &BTreeMap<String, SqlTemplate>,
        context: WorkerContext,
        stop: &CancellationToken,
    ) -> Result<ExecutionOutcome, BenchError> {
        let name = benchmark.name.as_str();
        if benchmark.prewarm_runs > 0 {
            let prewarm = plan(benchmark, templates, benchmark.prewarm_runs)?;
            let planned = prewarm.len();
            info!("Prewarming {name} with {planned} executions", name, planned);

            let quiet = WorkerContext {
                status: StatusReporter::default(),
                ..context.clone()
            };
            let pool = ExecutionPool::new(benchmark.concurrency, quiet, stop.child_token(), false);
            let warmed = pool.run_all(prewarm).await;
            let failed = warmed.iter().filter(|r| !r.is_successful()).count();
            if failed > 0 {
                warn!("{failed} prewarm executions of {name} failed", failed, name);
            }
            if stop.is_cancelled() {
                return Ok(ExecutionOutcome {
                    executions: Vec::new(),
                    aborted: false,
                    interrupted: true,
                    timed_out: false,
                });
            }
        }

        let pool = ExecutionPool::new(
            benchmark.concurrency,
            context,
            stop.child_token(),
            self.failure_policy == FailurePolicy::AbortOnFirstFailure,
        );
        let executions = plan(benchmark, templates, benchmark.runs)?;
        let planned = executions.len();
        let results = pool.run_all(executions).await;

        let skipped = planned - results.len();
        let interrupted = skipped > 0 && stop.is_cancelled();
        let aborted = pool.is_cancelled() && !stop.is_cancelled();
        if skipped > 0 {
            warn!(
                "{skipped} of {planned} executions of {name} were not run",
                skipped,
                planned,
                name
            );
        }
        Ok(ExecutionOutcome {
            executions: results,
            aborted,
            interrupted,
            timed_out: false,
        })
    }

    fn load_templates(&self, benchmark: &Benchmark) -> Result<BTreeMap<String, SqlTemplate>, BenchError> {
        benchmark
            .queries
            .iter()
            .map(|query| Ok((query.clone(), self.renderer.load(query)?)))
            .collect()
    }
}

struct ExecutionOutcome {
    executions: Vec<Arc<QueryExecutionResult>>,
    /// The pool stopped itself after a failure.
    aborted: bool,
    /// A stop request left executions unstarted.
    interrupted: bool,
    /// The time limit left executions unstarted.
    timed_out: bool,
}

/// Expand variables into concrete, rendered executions.
///
/// Order is combination, then run, then query. An empty variable map is
/// a single combination with no attributes.
fn plan(
    benchmark: &Arc<Benchmark>,
    templates: &BTreeMap<String, SqlTemplate>,
    runs: usize,
) -> Result<Vec<QueryExecution>, BenchError> {
    let mut combinations = expand(&benchmark.variables)?;
    if combinations.is_empty() {
        combinations.push(BTreeMap::new());
    }

    let identity = benchmark.identity_attributes();
    let mut executions = Vec::new();
    for combination in &combinations {
        for run in 0..runs {
            for query in &benchmark.queries {
                let Some(template) = templates.get(query) else {
                    return Err(BenchError::IllegalState(format!("query {query} was not loaded")));
                };

                let mut attributes = combination.clone();
                _ = attributes.insert(EXECUTION_SEQUENCE_ID.to_string(), run.to_string());

                let mut context = identity.clone();
                context.extend(attributes.clone());

                let statement = single_statement(template, &context)?;
                executions.push(QueryExecution {
                    benchmark: benchmark.clone(),
                    query_name: query.clone(),
                    sequence_id: executions.len(),
                    attributes,
                    statement,
                });
            }
        }
    }
    Ok(executions)
}

fn single_statement(
    template: &SqlTemplate,
    attributes: &BTreeMap<String, String>,
) -> Result<String, BenchError> {
    let mut statements = template.render(attributes)?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Err(BenchError::Template {
            path: template.path.display().to_string(),
            attributes: attributes.clone(),
            message: "query file contains no statement".to_string(),
        }),
        _ => Err(BenchError::Template {
            path: template.path.display().to_string(),
            attributes: attributes.clone(),
            message: "Multiple statements in one query file are not supported".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataFusionDataSources;
    use crate::execution::BenchmarkStatus;
    use crate::listener::{BenchmarkListener, ListenerSet};
    use crate::macros::MacroTable;
    use crate::template::FileQueryRenderer;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct StartedExecutions {
        ids: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BenchmarkListener for StartedExecutions {
        async fn execution_started(&self, execution: &QueryExecution) -> Result<(), BenchError> {
            self.ids.lock().expect("not poisoned").push(execution.sequence_id);
            Ok(())
        }
    }

    struct Fixture {
        _sql: TempDir,
        work: TempDir,
        orchestrator: BenchmarkOrchestrator,
    }

    async fn fixture(queries: &[(&str, &str)], macros: &[(&str, &str)]) -> Fixture {
        let sql = tempfile::tempdir().expect("tempdir");
        for (name, body) in queries {
            std::fs::write(sql.path().join(format!("{name}.sql")), body).expect("write");
        }
        let work = tempfile::tempdir().expect("tempdir");

        let definitions = BTreeMap::from([(
            "memory".to_string(),
            vec!["CREATE TABLE t (a INT) AS VALUES (1), (2), (3)".to_string()],
        )]);
        let data_sources: Arc<dyn DataSourceProvider> = Arc::new(
            DataFusionDataSources::from_definitions(&definitions)
                .await
                .expect("data source"),
        );
        let renderer: Arc<dyn QueryRenderer> = Arc::new(FileQueryRenderer::new([sql.path()]));
        let table = MacroTable::new(
            macros
                .iter()
                .map(|(k, v)| {
                    let command = v.replace("$WORK", &work.path().display().to_string());
                    (k.to_string(), Some(command))
                })
                .collect(),
        );
        let runner = Arc::new(MacroRunner::new(
            Arc::new(table),
            renderer.clone(),
            data_sources.clone(),
        ));
        Fixture {
            _sql: sql,
            work,
            orchestrator: BenchmarkOrchestrator::new(renderer, data_sources, runner),
        }
    }

    fn marker(fixture: &Fixture, name: &str) -> bool {
        fixture.work.path().join(name).exists()
    }

    #[tokio::test]
    async fn test_successful_benchmark_completes() {
        let fx = fixture(
            &[("q1", "SELECT * FROM t WHERE a <= {{ limit }}")],
            &[("before", "touch $WORK/before"), ("after", "touch $WORK/after")],
        )
        .await;
        let benchmark = Benchmark::builder("ok", "memory")
            .query("q1")
            .runs(3)
            .concurrency(2)
            .variable("limit", ["1", "3"])
            .before_benchmark(vec!["before".to_string()])
            .after_benchmark(vec!["after".to_string()])
            .build()
            .expect("valid benchmark");

        let result = fx.orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.phase(), BenchmarkPhase::Completed);
        assert_eq!(result.status(), BenchmarkStatus::Success);
        assert_eq!(result.executions().len(), 6);
        let rows: Vec<_> = result.executions().iter().map(|e| e.rows_count()).collect();
        assert_eq!(rows, vec![1, 1, 1, 3, 3, 3]);
        assert!(result.measurements().iter().any(|m| m.name == "throughput"));
        assert_eq!(
            result.aggregates()["duration"].unit,
            crate::measurement::MeasurementUnit::Milliseconds
        );
        assert!(marker(&fx, "before"));
        assert!(marker(&fx, "after"));
    }

    #[tokio::test]
    async fn test_partial_failure_completes_with_failed_status() {
        let fx = fixture(
            &[("q1", "SELECT * FROM {{ table }}")],
            &[],
        )
        .await;
        let benchmark = Benchmark::builder("mixed", "memory")
            .query("q1")
            .variable("table", ["t", "missing"])
            .build()
            .expect("valid benchmark");

        let result = fx.orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.phase(), BenchmarkPhase::Completed);
        assert_eq!(result.status(), BenchmarkStatus::Failed);
        assert_eq!(result.failed_executions(), 1);
        assert_eq!(result.failure_causes().len(), 1);
    }

    #[tokio::test]
    async fn test_total_failure_fails_and_still_runs_post_macros() {
        let fx = fixture(
            &[("q1", "SELECT * FROM missing")],
            &[("cleanup", "touch $WORK/cleanup")],
        )
        .await;
        let benchmark = Benchmark::builder("broken", "memory")
            .query("q1")
            .runs(2)
            .after_benchmark(vec!["cleanup".to_string()])
            .build()
            .expect("valid benchmark");

        let result = fx.orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert_eq!(result.failed_executions(), 2);
        assert!(marker(&fx, "cleanup"));
    }

    #[tokio::test]
    async fn test_post_macros_skipped_on_total_failure_when_configured() {
        let fx = fixture(
            &[("q1", "SELECT * FROM missing")],
            &[("cleanup", "touch $WORK/cleanup")],
        )
        .await;
        let orchestrator = fx
            .orchestrator
            .with_post_macro_policy(PostMacroPolicy::SkipOnTotalFailure);
        let benchmark = Benchmark::builder("broken", "memory")
            .query("q1")
            .after_benchmark(vec!["cleanup".to_string()])
            .build()
            .expect("valid benchmark");

        let result = orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert!(!fx.work.path().join("cleanup").exists());
    }

    #[tokio::test]
    async fn test_pre_macro_failure_fails_without_executing() {
        let fx = fixture(&[("q1", "SELECT 1")], &[("broken", "exit 3")]).await;
        let benchmark = Benchmark::builder("guarded", "memory")
            .query("q1")
            .before_benchmark(vec!["broken".to_string()])
            .build()
            .expect("valid benchmark");

        let result = fx.orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert!(result.executions().is_empty());
        assert!(
            result.failure_causes()[0]
                .to_string()
                .contains("exited with code 3")
        );
    }

    #[tokio::test]
    async fn test_post_macro_failure_fails_successful_benchmark() {
        let fx = fixture(&[("q1", "SELECT 1")], &[("broken", "exit 1")]).await;
        let benchmark = Benchmark::builder("tidy", "memory")
            .query("q1")
            .after_benchmark(vec!["broken".to_string()])
            .build()
            .expect("valid benchmark");

        let result = fx.orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.status(), BenchmarkStatus::Failed);
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert_eq!(result.executions().len(), 1);
    }

    #[tokio::test]
    async fn test_template_errors_fail_the_benchmark() {
        let fx = fixture(&[("two", "SELECT 1; SELECT 2")], &[]).await;
        let multi = Benchmark::builder("multi", "memory")
            .query("two")
            .build()
            .expect("valid benchmark");
        let result = fx.orchestrator.run_benchmark(multi).await;
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert!(
            result.failure_causes()[0]
                .to_string()
                .contains("Multiple statements")
        );

        let missing = Benchmark::builder("missing", "memory")
            .query("absent")
            .build()
            .expect("valid benchmark");
        let result = fx.orchestrator.run_benchmark(missing).await;
        assert!(matches!(
            result.failure_causes()[0],
            BenchError::Template { .. }
        ));
    }

    #[tokio::test]
    async fn test_abort_on_first_failure() {
        let fx = fixture(&[("q1", "SELECT * FROM {{ table }}")], &[]).await;
        let orchestrator = fx
            .orchestrator
            .with_failure_policy(FailurePolicy::AbortOnFirstFailure);
        let benchmark = Benchmark::builder("strict", "memory")
            .query("q1")
            .runs(3)
            .variable("table", ["missing", "t"])
            .build()
            .expect("valid benchmark");

        let result = orchestrator.run_benchmark(benchmark).await;
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert!(result.executions().len() < 6);
        assert!(!result.executions()[0].is_successful());
    }

    #[tokio::test]
    async fn test_suite_runs_macros_and_stops_when_cancelled() {
        let fx = fixture(
            &[("q1", "SELECT 1")],
            &[
                ("setup", "touch $WORK/setup"),
                ("teardown", "touch $WORK/teardown"),
                ("health", "true"),
            ],
        )
        .await;
        let orchestrator = fx.orchestrator.with_suite_macros(SuiteMacros {
            before_all: vec!["setup".to_string()],
            after_all: vec!["teardown".to_string()],
            health_check: vec!["health".to_string()],
        });
        let benchmarks = vec![
            Benchmark::builder("one", "memory").query("q1").build().expect("valid"),
            Benchmark::builder("two", "memory").query("q1").build().expect("valid"),
        ];

        let results = orchestrator
            .run_suite(benchmarks.clone())
            .await
            .expect("suite runs");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_successful()));
        assert!(fx.work.path().join("setup").exists());
        assert!(fx.work.path().join("teardown").exists());

        orchestrator.cancellation().cancel();
        let results = orchestrator.run_suite(benchmarks).await.expect("suite runs");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_failed_health_check_rejects_benchmark() {
        let fx = fixture(&[("q1", "SELECT 1")], &[("health", "exit 1")]).await;
        let orchestrator = fx.orchestrator.with_suite_macros(SuiteMacros {
            health_check: vec!["health".to_string()],
            ..SuiteMacros::default()
        });
        let results = orchestrator
            .run_suite(vec![
                Benchmark::builder("one", "memory").query("q1").build().expect("valid"),
            ])
            .await
            .expect("suite runs");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].phase(), BenchmarkPhase::Failed);
        assert!(results[0].executions().is_empty());
    }

    #[tokio::test]
    async fn test_failing_before_all_aborts_suite() {
        let fx = fixture(&[("q1", "SELECT 1")], &[("setup", "exit 2")]).await;
        let orchestrator = fx.orchestrator.with_suite_macros(SuiteMacros {
            before_all: vec!["setup".to_string()],
            ..SuiteMacros::default()
        });
        let err = orchestrator
            .run_suite(vec![
                Benchmark::builder("one", "memory").query("q1").build().expect("valid"),
            ])
            .await
            .expect_err("setup fails");
        assert!(err.to_string().contains("exited with code 2"));
    }

    #[test]
    fn test_plan_injects_sequence_id_and_covers_combinations() {
        let template = crate::template::parse_template(
            std::path::Path::new("q.sql"),
            "SELECT '{{ a }}', {{ execution_sequence_id }}",
        )
        .expect("template");
        let templates = BTreeMap::from([("q".to_string(), template)]);
        let benchmark = Arc::new(
            Benchmark::builder("plan", "memory")
                .query("q")
                .runs(2)
                .variable("a", ["x", "y"])
                .build()
                .expect("valid"),
        );

        let executions = plan(&benchmark, &templates, benchmark.runs).expect("plan");
        let statements: Vec<_> = executions.iter().map(|e| e.statement.as_str()).collect();
        assert_eq!(
            statements,
            vec!["SELECT 'x', 0", "SELECT 'x', 1", "SELECT 'y', 0", "SELECT 'y', 1"]
        );
        let ids: Vec<_> = executions.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_prewarm_is_invisible_to_listeners_and_results() {
        let fx = fixture(
            &[("q1", "SELECT * FROM t")],
            &[("count", "echo run >> $WORK/count")],
        )
        .await;
        let started = Arc::new(StartedExecutions::default());
        let listener: Arc<dyn BenchmarkListener> = started.clone();
        let listeners = ListenerSet::start(vec![listener]);
        let orchestrator = fx.orchestrator.with_status(listeners.reporter());
        let benchmark = Benchmark::builder("warm", "memory")
            .query("q1")
            .runs(2)
            .prewarm_runs(2)
            .before_execution(vec!["count".to_string()])
            .build()
            .expect("valid benchmark");

        let result = orchestrator.run_benchmark(benchmark).await;
        drop(orchestrator);
        listeners.shutdown(std::time::Duration::from_secs(5)).await;

        assert_eq!(result.phase(), BenchmarkPhase::Completed);
        assert_eq!(result.executions().len(), 2);
        assert_eq!(*started.ids.lock().expect("not poisoned"), vec![0, 1]);
        let count = std::fs::read_to_string(fx.work.path().join("count")).expect("macro ran");
        assert_eq!(count.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_health_check_sees_the_benchmark() {
        let fx = fixture(
            &[("q1", "SELECT 1"), ("health", "SELECT count(*) FROM t")],
            &[("only-one", "test \"$benchmark_name\" = one")],
        )
        .await;
        let orchestrator = fx.orchestrator.with_suite_macros(SuiteMacros {
            health_check: vec!["health.sql".to_string(), "only-one".to_string()],
            ..SuiteMacros::default()
        });
        let results = orchestrator
            .run_suite(vec![
                Benchmark::builder("one", "memory").query("q1").build().expect("valid"),
                Benchmark::builder("two", "memory").query("q1").build().expect("valid"),
            ])
            .await
            .expect("suite runs");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].phase(), BenchmarkPhase::Completed);
        assert_eq!(results[1].phase(), BenchmarkPhase::Failed);
        assert!(results[1].executions().is_empty());
        assert!(matches!(
            results[1].failure_causes()[0],
            BenchError::MacroExecution { exit_code: 1, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_mid_run_interrupts_benchmark() {
        let fx = fixture(&[("q1", "SELECT 1")], &[("slow", "sleep 0.3")]).await;
        let cancel = fx.orchestrator.cancellation();
        let benchmark = Benchmark::builder("slow", "memory")
            .query("q1")
            .runs(4)
            .before_execution(vec!["slow".to_string()])
            .build()
            .expect("valid benchmark");

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let result = fx.orchestrator.run_benchmark(benchmark).await;
        stopper.await.expect("stopper joined");

        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert!(!result.executions().is_empty());
        assert!(result.executions().len() < 4);
        assert!(result.executions().iter().all(|e| e.is_successful()));
        assert!(
            result
                .failure_causes()
                .iter()
                .any(|c| matches!(c, BenchError::Interrupted(name) if name == "slow"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_time_limit_stops_starting_new_work() {
        let fx = fixture(&[("q1", "SELECT 1")], &[("slow", "sleep 0.3")]).await;
        let orchestrator = fx
            .orchestrator
            .with_time_limit(std::time::Duration::from_millis(100));
        let slow = Benchmark::builder("slow", "memory")
            .query("q1")
            .runs(4)
            .before_execution(vec!["slow".to_string()])
            .build()
            .expect("valid benchmark");
        let never = Benchmark::builder("never", "memory").query("q1").build().expect("valid");

        let results = orchestrator.run_suite(vec![slow, never]).await.expect("suite runs");

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.phase(), BenchmarkPhase::Failed);
        assert!(result.executions().len() < 4);
        assert!(result.executions().iter().all(|e| e.is_successful()));
        assert!(
            result
                .failure_causes()
                .iter()
                .any(|c| matches!(c, BenchError::TimeLimitExceeded(_)))
        );
        assert!(!orchestrator.cancellation().is_cancelled());
    }

    #[derive(Default)]
    struct RecordedQueryInfo {
        ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::measurement::QueryInfoClient for RecordedQueryInfo {
        async fn load_metrics(
            &self,
            query_id: &str,
        ) -> Result<Vec<crate::measurement::Measurement>, BenchError> {
            self.ids.lock().expect("not poisoned").push(query_id.to_string());
            Ok(vec![crate::measurement::Measurement::new(
                "planning_time",
                crate::measurement::MeasurementUnit::Milliseconds,
                1.0,
            )])
        }
    }

    #[tokio::test]
    async fn test_engine_metrics_follow_datafusion_query_ids() {
        let fx = fixture(&[("q1", "SELECT * FROM t")], &[]).await;
        let info = Arc::new(RecordedQueryInfo::default());
        let collector = MeasurementCollector::with_defaults().optional(Arc::new(
            crate::measurement::EngineMetricsProvider::new(info.clone()),
        ));
        let orchestrator = fx.orchestrator.with_collector(collector);
        let benchmark = Benchmark::builder("metrics", "memory")
            .query("q1")
            .runs(2)
            .build()
            .expect("valid benchmark");

        let result = orchestrator.run_benchmark(benchmark).await;
        assert!(result.is_successful());
        for execution in result.executions() {
            assert!(execution.engine_query_id().is_some());
            assert!(execution.measurements().iter().any(|m| m.name == "planning_time"));
        }
        let ids = info.ids.lock().expect("not poisoned").clone();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(result.aggregates().contains_key("planning_time"));
    }
}
