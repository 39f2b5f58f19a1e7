// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency execution of one benchmark's queries
//!
//! A pool belongs to a single benchmark. At most `concurrency` executions
//! hold a permit at once; each one owns its connection until it finishes.
//! Failures are recorded on the result and never cancel siblings unless
//! the pool was built to stop on the first failure.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use diagnostics::*;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::datasource::{Connection, DataSourceProvider};
use crate::error::BenchError;
use crate::execution::{QueryExecution, QueryExecutionResult, QueryExecutionResultBuilder};
use crate::listener::StatusReporter;
use crate::macros::MacroRunner;
use crate::measurement::{Measured, MeasurementCollector};

/// Shared, read-only services every worker uses.
#[derive(Clone)]
pub struct WorkerContext {
    pub data_sources: Arc<dyn DataSourceProvider>,
    pub macros: Arc<MacroRunner>,
    pub collector: Arc<MeasurementCollector>,
    pub status: StatusReporter,
}

pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    context: WorkerContext,
    cancel: CancellationToken,
    stop_on_failure: bool,
}

impl ExecutionPool {
    /// `cancel` should be a child of the process-wide stop token; the pool
    /// cancels it itself when stopping on failure.
    pub fn new(
        concurrency: usize,
        context: WorkerContext,
        cancel: CancellationToken,
        stop_on_failure: bool,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            context,
            cancel,
            stop_on_failure,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one execution in the background.
    ///
    /// Resolves to `None` when the execution was skipped because the pool
    /// was cancelled before it got a permit.
    pub fn submit(&self, execution: QueryExecution) -> JoinHandle<Option<Arc<QueryExecutionResult>>> {
        tokio::spawn(self.task(execution))
    }

    /// Run every execution and wait for all of them.
    ///
    /// Results come back in `sequence_id` order regardless of completion
    /// order; skipped executions are absent. A task that panics is recorded
    /// as a failed execution.
    pub async fn run_all(&self, executions: Vec<QueryExecution>) -> Vec<Arc<QueryExecutionResult>> {
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::with_capacity(executions.len());
        for execution in executions {
            let id = tasks.spawn(self.task(execution.clone())).id();
            _ = pending.insert(id, execution);
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Some(result))) => results.push(result),
                Ok((_, None)) => {}
                Err(err) => {
                    let Some(execution) = pending.remove(&err.id()) else {
                        continue;
                    };
                    match self.crashed(execution, &err) {
                        Ok(result) => results.push(result),
                        Err(failure) => {
                            let failure = failure.to_string();
                            error!(
                                "Execution could not be recorded: {failure}",
                                failure: failure.as_str()
                            );
                        }
                    }
                }
            }
        }
        results.sort_by_key(|r| r.execution().sequence_id);
        results
    }

    /// The failed result of an execution whose task did not complete.
    fn crashed(
        &self,
        execution: QueryExecution,
        err: &JoinError,
    ) -> Result<Arc<QueryExecutionResult>, BenchError> {
        let label = execution.label();
        let reason = err.to_string();
        error!(
            "Execution task for {label} did not complete: {reason}",
            label,
            reason: reason.as_str()
        );

        let mut builder = QueryExecutionResultBuilder::new(execution);
        builder.start_timer()?;
        builder.failed(BenchError::IllegalState(format!(
            "execution task for {label} did not complete: {reason}"
        )));
        let result = Arc::new(builder.end_timer()?);

        if self.stop_on_failure && !self.cancel.is_cancelled() {
            warn!("Stopping benchmark after failure of {label}", label);
            self.cancel.cancel();
        }
        self.context.status.execution_finished(&result);
        Ok(result)
    }

    fn task(
        &self,
        execution: QueryExecution,
    ) -> impl Future<Output = Option<Arc<QueryExecutionResult>>> + Send + 'static {
        let semaphore = self.semaphore.clone();
        let context = self.context.clone();
        let cancel = self.cancel.clone();
        let stop_on_failure = self.stop_on_failure;

        async move {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let label = execution.label();
                debug!("Skipping {label}, pool stopped", label);
                return None;
            };

            let result = context.execute(execution).await;
            drop(permit);

            let mut result = match result {
                Ok(result) => result,
                Err(err) => {
                    let err = err.to_string();
                    error!("Execution could not be recorded: {err}", err: err.as_str());
                    return None;
                }
            };

            match context.collector.collect(Measured::Query(&result)).await {
                Ok(measurements) => result.set_measurements(measurements),
                Err(err) => result.set_failure(err),
            }

            if stop_on_failure && !result.is_successful() && !cancel.is_cancelled() {
                let label = result.execution().label();
                warn!("Stopping benchmark after failure of {label}", label);
                cancel.cancel();
            }

            let result = Arc::new(result);
            context.status.execution_finished(&result);
            Some(result)
        }
    }
}

impl WorkerContext {
    /// Before-execution macros, timed statement, after-execution macros.
    async fn execute(&self, execution: QueryExecution) -> Result<QueryExecutionResult, BenchError> {
        let shared = Arc::new(execution);
        self.status.execution_started(&shared);
        let execution = Arc::unwrap_or_clone(shared);

        let benchmark = execution.benchmark.clone();
        let attributes = macro_attributes(&execution);
        let mut builder = QueryExecutionResultBuilder::new(execution);

        let prepared = self
            .run_macros(&benchmark.before_execution_macros, &benchmark, &attributes, None)
            .await;

        builder.start_timer()?;
        let connection = match prepared {
            Ok(()) => match self.data_sources.connect(&benchmark.data_source).await {
                Ok(mut connection) => {
                    let statement = builder.execution().statement.clone();
                    match connection.execute(&statement).await {
                        Ok(outcome) => {
                            builder.set_rows_count(outcome.rows);
                            builder.set_engine_query_id(outcome.engine_query_id);
                        }
                        Err(err) => builder.failed(err),
                    }
                    Some(connection)
                }
                Err(err) => {
                    builder.failed(err);
                    None
                }
            },
            Err(err) => {
                builder.failed(err);
                None
            }
        };
        let mut result = builder.end_timer()?;

        if let Some(mut connection) = connection {
            if let Err(err) = self
                .run_macros(
                    &benchmark.after_execution_macros,
                    &benchmark,
                    &attributes,
                    Some(connection.as_mut()),
                )
                .await
            {
                result.set_failure(err);
            }
        }
        Ok(result)
    }

    async fn run_macros(
        &self,
        names: &[String],
        benchmark: &crate::benchmark::Benchmark,
        attributes: &BTreeMap<String, String>,
        mut connection: Option<&mut dyn Connection>,
    ) -> Result<(), BenchError> {
        for name in names {
            let reborrowed = match connection.as_mut() {
                Some(c) => {
                    let c: &mut dyn Connection = &mut **c;
                    Some(c)
                }
                None => None,
            };
            self.macros
                .run_with_attributes(name, Some(benchmark), attributes, reborrowed)
                .await?;
        }
        Ok(())
    }
}

fn macro_attributes(execution: &QueryExecution) -> BTreeMap<String, String> {
    let mut attributes = execution.benchmark.identity_attributes();
    attributes.extend(execution.attributes.clone());
    _ = attributes.insert("query_name".to_string(), execution.query_name.clone());
    attributes
}
