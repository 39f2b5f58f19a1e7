// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Benchmark definitions
//!
//! A `Benchmark` is immutable once the orchestrator starts working on it;
//! it is shared between workers as `Arc<Benchmark>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BenchError;

/// Attribute name carrying the per-execution sequence number into templates.
pub const EXECUTION_SEQUENCE_ID: &str = "execution_sequence_id";

/// One benchmark: a set of queries, run `runs` times with up to
/// `concurrency` executions in flight, once per variable combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    pub sequence_id: String,
    pub data_source: String,
    pub environment: String,
    pub concurrency: usize,
    pub runs: usize,
    pub prewarm_runs: usize,
    pub queries: Vec<String>,
    pub variables: BTreeMap<String, Vec<String>>,
    pub before_benchmark_macros: Vec<String>,
    pub after_benchmark_macros: Vec<String>,
    pub before_execution_macros: Vec<String>,
    pub after_execution_macros: Vec<String>,
}

impl Benchmark {
    /// Start building a benchmark with defaults (one run, no concurrency).
    pub fn builder(name: impl Into<String>, data_source: impl Into<String>) -> BenchmarkBuilder {
        BenchmarkBuilder {
            benchmark: Benchmark {
                name: name.into(),
                sequence_id: "1".to_string(),
                data_source: data_source.into(),
                environment: "default".to_string(),
                concurrency: 1,
                runs: 1,
                prewarm_runs: 0,
                queries: Vec::new(),
                variables: BTreeMap::new(),
                before_benchmark_macros: Vec::new(),
                after_benchmark_macros: Vec::new(),
                before_execution_macros: Vec::new(),
                after_execution_macros: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn is_concurrent(&self) -> bool {
        self.concurrency > 1
    }

    /// Name unique across sequence ids, used by the result service.
    #[must_use]
    pub fn unique_name(&self) -> String {
        format!("{}_{}", self.name, self.environment)
    }

    /// Same benchmark under another execution sequence id.
    #[must_use]
    pub fn with_sequence_id(&self, sequence_id: impl Into<String>) -> Benchmark {
        Benchmark {
            sequence_id: sequence_id.into(),
            ..self.clone()
        }
    }

    /// Identity attributes exported to macros and templates.
    #[must_use]
    pub fn identity_attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("benchmark_name".to_string(), self.name.clone()),
            ("sequence_id".to_string(), self.sequence_id.clone()),
            ("datasource".to_string(), self.data_source.clone()),
            ("environment".to_string(), self.environment.clone()),
            ("concurrency".to_string(), self.concurrency.to_string()),
            ("runs".to_string(), self.runs.to_string()),
        ])
    }

    /// Check the invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.name.is_empty() {
            return Err(BenchError::InvalidArgument(
                "benchmark name must not be empty".to_string(),
            ));
        }
        if self.concurrency < 1 {
            return Err(BenchError::InvalidArgument(format!(
                "benchmark {} has concurrency {}, expected at least 1",
                self.name, self.concurrency
            )));
        }
        if self.runs < 1 {
            return Err(BenchError::InvalidArgument(format!(
                "benchmark {} has runs {}, expected at least 1",
                self.name, self.runs
            )));
        }
        if self.queries.is_empty() {
            return Err(BenchError::InvalidArgument(format!(
                "benchmark {} has no queries",
                self.name
            )));
        }
        if let Some((key, _)) = self.variables.iter().find(|(_, values)| values.is_empty()) {
            return Err(BenchError::InvalidArgument(format!(
                "benchmark {} variable {key} has no values",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Benchmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (seq={}, datasource={}, runs={}, concurrency={})",
            self.name, self.sequence_id, self.data_source, self.runs, self.concurrency
        )
    }
}

pub struct BenchmarkBuilder {
    benchmark: Benchmark,
}

impl BenchmarkBuilder {
    #[must_use]
    pub fn sequence_id(mut self, sequence_id: impl Into<String>) -> Self {
        self.benchmark.sequence_id = sequence_id.into();
        self
    }

    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.benchmark.environment = environment.into();
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.benchmark.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn runs(mut self, runs: usize) -> Self {
        self.benchmark.runs = runs;
        self
    }

    #[must_use]
    pub fn prewarm_runs(mut self, prewarm_runs: usize) -> Self {
        self.benchmark.prewarm_runs = prewarm_runs;
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>) -> Self {
        self.benchmark.queries.push(name.into());
        self
    }

    #[must_use]
    pub fn variable<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        _ = self
            .benchmark
            .variables
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn before_benchmark(mut self, macros: Vec<String>) -> Self {
        self.benchmark.before_benchmark_macros = macros;
        self
    }

    #[must_use]
    pub fn after_benchmark(mut self, macros: Vec<String>) -> Self {
        self.benchmark.after_benchmark_macros = macros;
        self
    }

    #[must_use]
    pub fn before_execution(mut self, macros: Vec<String>) -> Self {
        self.benchmark.before_execution_macros = macros;
        self
    }

    #[must_use]
    pub fn after_execution(mut self, macros: Vec<String>) -> Self {
        self.benchmark.after_execution_macros = macros;
        self
    }

    pub fn build(self) -> Result<Benchmark, BenchError> {
        self.benchmark.validate()?;
        Ok(self.benchmark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let benchmark = Benchmark::builder("simple", "memory")
            .query("q1")
            .build()
            .expect("valid benchmark");
        assert_eq!(benchmark.runs, 1);
        assert_eq!(benchmark.concurrency, 1);
        assert!(!benchmark.is_concurrent());
        assert_eq!(benchmark.unique_name(), "simple_default");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let result = Benchmark::builder("bad", "memory")
            .query("q1")
            .concurrency(0)
            .build();
        assert!(matches!(result, Err(BenchError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_empty_variable_list() {
        let result = Benchmark::builder("bad", "memory")
            .query("q1")
            .variable("scale", Vec::<String>::new())
            .build();
        let err = result.expect_err("empty value list");
        assert!(err.to_string().contains("scale"));
    }

    #[test]
    fn test_with_sequence_id_keeps_definition() {
        let benchmark = Benchmark::builder("b", "memory")
            .query("q1")
            .runs(3)
            .build()
            .expect("valid benchmark");
        let again = benchmark.with_sequence_id("42");
        assert_eq!(again.sequence_id, "42");
        assert_eq!(again.runs, 3);
        assert_eq!(again.queries, benchmark.queries);
    }
}
