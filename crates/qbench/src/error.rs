// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for benchmark execution

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::execution::BenchmarkExecutionResult;

/// Boxed driver-level error carried inside [`BenchError::QueryExecution`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("Macro {0} is not defined")]
    UndefinedMacro(String),

    #[error("Macro {0} has no command defined")]
    NoCommand(String),

    #[error("Macro {name} exited with code {exit_code}")]
    MacroExecution { name: String, exit_code: i32 },

    #[error("Could not execute macro {name}: {source}")]
    MacroSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Template {path} could not be rendered with attributes {attributes:?}: {message}")]
    Template {
        path: String,
        attributes: BTreeMap<String, String>,
        message: String,
    },

    #[error("Transient external error: {0}")]
    TransientExternal(String),

    #[error("External call failed: {0}")]
    PermanentExternal(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Query execution failed: {cause}")]
    QueryExecution {
        #[source]
        cause: BoxError,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Benchmark {0} was stopped before all executions ran")]
    Interrupted(String),

    #[error("Time limit ran out before all executions of benchmark {0} ran")]
    TimeLimitExceeded(String),

    #[error("Data source {0} is not defined")]
    UnknownDataSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Wrap an engine/driver error without losing its type.
    pub fn query<E>(cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        BenchError::QueryExecution {
            cause: cause.into(),
        }
    }

    /// Only transient external failures are worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, BenchError::TransientExternal(_))
    }

    /// Classify a reqwest failure: server errors, timeouts and connect
    /// failures are transient, everything else is permanent.
    pub fn from_http(err: reqwest::Error) -> Self {
        let transient = err.is_timeout()
            || err.is_connect()
            || err.status().is_some_and(|s| s.is_server_error());
        if transient {
            BenchError::TransientExternal(err.to_string())
        } else {
            BenchError::PermanentExternal(err.to_string())
        }
    }
}

impl From<datafusion::error::DataFusionError> for BenchError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        BenchError::query(err)
    }
}

/// Suite summary: one or more benchmarks did not succeed.
///
/// Every failed result is kept whole, so the individual causes stay
/// reachable through [`FailedBenchmarks::causes`].
#[derive(Debug, thiserror::Error)]
#[error("{} of {total} benchmarks failed", .failed.len())]
pub struct FailedBenchmarks {
    pub failed: Vec<Arc<BenchmarkExecutionResult>>,
    pub total: usize,
}

impl FailedBenchmarks {
    /// `Err` naming every unsuccessful result, `Ok` when all succeeded.
    pub fn check(results: &[Arc<BenchmarkExecutionResult>]) -> Result<(), FailedBenchmarks> {
        let failed: Vec<_> = results
            .iter()
            .filter(|r| !r.is_successful())
            .cloned()
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(FailedBenchmarks {
                failed,
                total: results.len(),
            })
        }
    }

    /// All underlying causes, paired with the benchmark they belong to.
    pub fn causes(&self) -> impl Iterator<Item = (&str, &BenchError)> {
        self.failed.iter().flat_map(|result| {
            result
                .failure_causes()
                .into_iter()
                .map(move |cause| (result.benchmark().name.as_str(), cause))
        })
    }

    /// Multi-line description naming every failure.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut lines = vec![self.to_string()];
        for (name, cause) in self.causes() {
            lines.push(format!("  {name}: {cause}"));
            let mut source = std::error::Error::source(cause);
            while let Some(inner) = source {
                lines.push(format!("    caused by: {inner}"));
                source = inner.source();
            }
        }
        lines.join("\n")
    }
}
