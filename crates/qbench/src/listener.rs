// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle notifications
//!
//! Each listener gets its own unbounded channel and a task that drains it,
//! so a slow or failing listener never holds up execution or the other
//! listeners.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diagnostics::*;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::benchmark::Benchmark;
use crate::error::BenchError;
use crate::execution::{BenchmarkExecutionResult, QueryExecution, QueryExecutionResult};

#[async_trait]
pub trait BenchmarkListener: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn benchmark_started(&self, _benchmark: &Benchmark) -> Result<(), BenchError> {
        Ok(())
    }

    async fn benchmark_finished(&self, _result: &BenchmarkExecutionResult) -> Result<(), BenchError> {
        Ok(())
    }

    async fn execution_started(&self, _execution: &QueryExecution) -> Result<(), BenchError> {
        Ok(())
    }

    async fn execution_finished(&self, _result: &QueryExecutionResult) -> Result<(), BenchError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum BenchmarkEvent {
    BenchmarkStarted(Arc<Benchmark>),
    BenchmarkFinished(Arc<BenchmarkExecutionResult>),
    ExecutionStarted(Arc<QueryExecution>),
    ExecutionFinished(Arc<QueryExecutionResult>),
}

impl BenchmarkEvent {
    async fn deliver(&self, listener: &dyn BenchmarkListener) -> Result<(), BenchError> {
        match self {
            BenchmarkEvent::BenchmarkStarted(b) => listener.benchmark_started(b).await,
            BenchmarkEvent::BenchmarkFinished(r) => listener.benchmark_finished(r).await,
            BenchmarkEvent::ExecutionStarted(e) => listener.execution_started(e).await,
            BenchmarkEvent::ExecutionFinished(r) => listener.execution_finished(r).await,
        }
    }
}

/// Posting side of the listener fan-out. Cheap to clone.
#[derive(Clone, Default)]
pub struct StatusReporter {
    senders: Arc<Vec<mpsc::UnboundedSender<BenchmarkEvent>>>,
}

impl StatusReporter {
    pub fn benchmark_started(&self, benchmark: &Arc<Benchmark>) {
        self.post(BenchmarkEvent::BenchmarkStarted(benchmark.clone()));
    }

    pub fn benchmark_finished(&self, result: &Arc<BenchmarkExecutionResult>) {
        self.post(BenchmarkEvent::BenchmarkFinished(result.clone()));
    }

    pub fn execution_started(&self, execution: &Arc<QueryExecution>) {
        self.post(BenchmarkEvent::ExecutionStarted(execution.clone()));
    }

    pub fn execution_finished(&self, result: &Arc<QueryExecutionResult>) {
        self.post(BenchmarkEvent::ExecutionFinished(result.clone()));
    }

    /// Never blocks; events for a listener that has gone away are dropped.
    pub fn post(&self, event: BenchmarkEvent) {
        for sender in self.senders.iter() {
            _ = sender.send(event.clone());
        }
    }
}

/// Owns the per-listener tasks.
pub struct ListenerSet {
    reporter: StatusReporter,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl ListenerSet {
    pub fn start(listeners: Vec<Arc<dyn BenchmarkListener>>) -> Self {
        let mut senders = Vec::with_capacity(listeners.len());
        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            let name = listener.name().to_string();
            tasks.push((name, tokio::spawn(drain(listener, rx))));
        }
        Self {
            reporter: StatusReporter {
                senders: Arc::new(senders),
            },
            tasks,
        }
    }

    #[must_use]
    pub fn reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    /// Close the channels and wait for queued events to be delivered.
    ///
    /// Channels close once every `StatusReporter` clone is dropped; tasks
    /// still running after `timeout` are aborted.
    pub async fn shutdown(self, timeout: Duration) {
        drop(self.reporter);
        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut task) in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("Listener {name} did not drain in time, abandoning it", name);
                task.abort();
            }
        }
    }
}

async fn drain(listener: Arc<dyn BenchmarkListener>, mut rx: mpsc::UnboundedReceiver<BenchmarkEvent>) {
    while let Some(event) = rx.recv().await {
        let delivery = AssertUnwindSafe(event.deliver(listener.as_ref())).catch_unwind();
        match delivery.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let listener = listener.name();
                let err = err.to_string();
                warn!("Listener {listener} failed: {err}", listener, err: err.as_str());
            }
            Err(_) => {
                let listener = listener.name();
                error!("Listener {listener} panicked", listener);
            }
        }
    }
}

/// Logs progress at info level.
#[derive(Debug, Default)]
pub struct LoggingListener;

#[async_trait]
impl BenchmarkListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    async fn benchmark_started(&self, benchmark: &Benchmark) -> Result<(), BenchError> {
        let benchmark = benchmark.to_string();
        info!("Benchmark started: {benchmark}", benchmark);
        Ok(())
    }

    async fn benchmark_finished(&self, result: &BenchmarkExecutionResult) -> Result<(), BenchError> {
        let name = result.benchmark().name.as_str();
        let status = result.status().to_string();
        let executions = result.executions().len();
        let failed = result.failed_executions();
        info!(
            "Benchmark finished: {name} {status} ({failed} of {executions} executions failed)",
            name,
            status,
            failed,
            executions
        );
        Ok(())
    }

    async fn execution_started(&self, execution: &QueryExecution) -> Result<(), BenchError> {
        let label = execution.label();
        debug!("Execution started: {label}", label);
        Ok(())
    }

    async fn execution_finished(&self, result: &QueryExecutionResult) -> Result<(), BenchError> {
        let label = result.execution().label();
        let duration_ms = result.duration().as_secs_f64() * 1000.0;
        let rows = result.rows_count();
        match result.failure() {
            None => debug!(
                "Execution finished: {label} in {duration_ms}ms, {rows} rows",
                label,
                duration_ms,
                rows
            ),
            Some(cause) => {
                let cause = cause.to_string();
                warn!("Execution failed: {label}: {cause}", label, cause);
            }
        }
        Ok(())
    }
}
