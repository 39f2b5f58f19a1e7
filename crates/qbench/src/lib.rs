// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! qbench - SQL benchmark driver
//!
//! A benchmark names a data source, a set of query templates and a map of
//! variables. The orchestrator expands the variables into combinations,
//! renders each query once per combination and run, executes the statements
//! on a bounded pool, and collects per-query and per-benchmark measurements.
//! Macros (shell commands or SQL files) run around benchmarks and
//! executions, and listeners observe progress without slowing it down.

mod http;

pub mod benchmark;
pub mod config;
pub mod datasource;
pub mod error;
pub mod execution;
pub mod listener;
pub mod loader;
pub mod macros;
pub mod measurement;
pub mod orchestrator;
pub mod pool;
pub mod reporter;
pub mod retry;
pub mod statistics;
pub mod template;
pub mod variables;

pub use benchmark::{Benchmark, BenchmarkBuilder, EXECUTION_SEQUENCE_ID};
pub use config::{DriverConfig, FailurePolicy, PostMacroPolicy};
pub use datasource::{Connection, DataFusionDataSources, DataSourceProvider, StatementOutcome};
pub use error::{BenchError, FailedBenchmarks};
pub use execution::{
    BenchmarkExecutionResult, BenchmarkPhase, BenchmarkStatus, QueryExecution,
    QueryExecutionResult, QueryExecutionResultBuilder,
};
pub use http::JsonClient;
pub use listener::{BenchmarkEvent, BenchmarkListener, ListenerSet, LoggingListener, StatusReporter};
pub use loader::BenchmarkLoader;
pub use macros::{MacroRegistry, MacroRunner, MacroTable};
pub use measurement::{
    DurationMeasurementProvider, EngineMetricsProvider, HttpQueryInfoClient, Measured, Measurement,
    MeasurementCollector, MeasurementProvider, MeasurementUnit, QueryInfoClient,
    ThroughputMeasurementProvider,
};
pub use orchestrator::{BenchmarkOrchestrator, SuiteMacros};
pub use reporter::{HttpResultReporter, ReportingListener, ResultReporter};
pub use retry::{RetryPolicy, RetryingClient};
pub use statistics::{AggregatedMeasurement, aggregate, aggregate_measurements};
pub use template::{FileQueryRenderer, QueryRenderer, SqlTemplate};
pub use variables::VariableExpander;
