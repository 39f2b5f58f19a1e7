// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Benchmark descriptor files
//!
//! One YAML file per benchmark; the file stem is the benchmark name.
//!
//! ```yaml
//! datasource: memory
//! query-names: [q01, q06]
//! runs: 5
//! prewarm-runs: 1
//! concurrency: 2
//! before-benchmark: [drop-caches]
//! variables:
//!   scale: 1, 10        # comma-separated scalar
//!   format: [orc, parquet]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use diagnostics::*;
use serde::Deserialize;
use serde_yaml_ng::Value;

use crate::benchmark::Benchmark;
use crate::error::BenchError;
use crate::template::expand_yaml_template;

const DESCRIPTOR_EXTENSIONS: &[&str] = &["yaml", "yml"];

fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct BenchmarkDescriptor {
    datasource: String,
    query_names: Vec<String>,
    #[serde(default = "one")]
    runs: usize,
    #[serde(default)]
    prewarm_runs: usize,
    #[serde(default = "one")]
    concurrency: usize,
    #[serde(default)]
    before_benchmark: Vec<String>,
    #[serde(default)]
    after_benchmark: Vec<String>,
    #[serde(default)]
    before_execution: Vec<String>,
    #[serde(default)]
    after_execution: Vec<String>,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
}

pub struct BenchmarkLoader {
    dirs: Vec<PathBuf>,
    environment: String,
    sequence_id: String,
    variables: HashMap<String, String>,
}

impl BenchmarkLoader {
    pub fn new(dirs: Vec<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            dirs,
            environment: environment.into(),
            sequence_id: "1".to_string(),
            variables: HashMap::new(),
        }
    }

    #[must_use]
    pub fn sequence_id(mut self, sequence_id: impl Into<String>) -> Self {
        self.sequence_id = sequence_id.into();
        self
    }

    /// Template variables available while expanding descriptor files.
    #[must_use]
    pub fn variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// Descriptor files in name order.
    pub fn descriptor_files(&self) -> Result<Vec<(String, PathBuf)>, BenchError> {
        let mut found = BTreeMap::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                let dir = dir.display().to_string();
                warn!("Benchmark directory {dir} does not exist", dir);
                continue;
            }
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                let is_descriptor = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| DESCRIPTOR_EXTENSIONS.contains(&e));
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if is_descriptor && path.is_file() {
                    // The first directory wins for duplicate names.
                    _ = found.entry(stem.to_string()).or_insert(path.clone());
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Load every descriptor, or only those in `names` when it is non-empty.
    pub fn load(&self, names: &[String]) -> Result<Vec<Benchmark>, BenchError> {
        let files = self.descriptor_files()?;
        if let Some(missing) = names
            .iter()
            .find(|name| !files.iter().any(|(stem, _)| stem == *name))
        {
            return Err(BenchError::Config(format!(
                "benchmark {missing} not found in {:?}",
                self.dirs
            )));
        }

        files
            .iter()
            .filter(|(stem, _)| names.is_empty() || names.contains(stem))
            .map(|(stem, path)| self.load_file(stem, path))
            .collect()
    }

    /// Load the selected benchmarks once per execution sequence id.
    ///
    /// Every run of one benchmark stays together, in `sequence_ids` order.
    pub fn load_sequences(
        &self,
        names: &[String],
        sequence_ids: &[String],
    ) -> Result<Vec<Benchmark>, BenchError> {
        if sequence_ids.is_empty() {
            return Err(BenchError::InvalidArgument(
                "at least one execution sequence id is required".to_string(),
            ));
        }
        let benchmarks = self.load(names)?;
        Ok(benchmarks
            .iter()
            .flat_map(|benchmark| {
                sequence_ids
                    .iter()
                    .map(|id| benchmark.with_sequence_id(id.as_str()))
            })
            .collect())
    }

    fn load_file(&self, name: &str, path: &Path) -> Result<Benchmark, BenchError> {
        let content = std::fs::read_to_string(path)?;
        self.parse(name, &content).map_err(|e| {
            BenchError::Config(format!("benchmark file {}: {e}", path.display()))
        })
    }

    pub fn parse(&self, name: &str, content: &str) -> Result<Benchmark, BenchError> {
        let expanded = expand_yaml_template(content, &self.variables)?;
        let descriptor: BenchmarkDescriptor = serde_yaml_ng::from_str(&expanded)?;

        let mut variables = BTreeMap::new();
        for (key, value) in &descriptor.variables {
            _ = variables.insert(key.clone(), variable_values(key, value)?);
        }

        let benchmark = Benchmark {
            name: name.to_string(),
            sequence_id: self.sequence_id.clone(),
            data_source: descriptor.datasource,
            environment: self.environment.clone(),
            concurrency: descriptor.concurrency,
            runs: descriptor.runs,
            prewarm_runs: descriptor.prewarm_runs,
            queries: descriptor.query_names,
            variables,
            before_benchmark_macros: descriptor.before_benchmark,
            after_benchmark_macros: descriptor.after_benchmark,
            before_execution_macros: descriptor.before_execution,
            after_execution_macros: descriptor.after_execution,
        };
        benchmark.validate()?;
        Ok(benchmark)
    }
}

/// A list, or a scalar that may hold comma-separated values.
fn variable_values(key: &str, value: &Value) -> Result<Vec<String>, BenchError> {
    match value {
        Value::Sequence(items) => items.iter().map(|item| scalar(key, item)).collect(),
        Value::String(text) => Ok(text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        other => Ok(vec![scalar(key, other)?]),
    }
}

fn scalar(key: &str, value: &Value) -> Result<String, BenchError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(BenchError::InvalidArgument(format!(
            "variable {key} must hold scalar values"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> BenchmarkLoader {
        BenchmarkLoader::new(Vec::new(), "ci").sequence_id("42")
    }

    #[test]
    fn test_parse_full_descriptor() {
        let yaml = r#"
datasource: memory
query-names: [q1, q2]
runs: 3
prewarm-runs: 1
concurrency: 2
before-benchmark: [drop-caches]
after-execution: [check.sql]
variables:
  scale: 1, 10
  format: [orc, parquet]
  partitions: 8
"#;
        let benchmark = loader().parse("tpch", yaml).expect("valid descriptor");
        assert_eq!(benchmark.name, "tpch");
        assert_eq!(benchmark.sequence_id, "42");
        assert_eq!(benchmark.environment, "ci");
        assert_eq!(benchmark.queries, vec!["q1", "q2"]);
        assert_eq!(benchmark.runs, 3);
        assert_eq!(benchmark.prewarm_runs, 1);
        assert_eq!(benchmark.concurrency, 2);
        assert_eq!(benchmark.before_benchmark_macros, vec!["drop-caches"]);
        assert_eq!(benchmark.after_execution_macros, vec!["check.sql"]);
        assert_eq!(benchmark.variables["scale"], vec!["1", "10"]);
        assert_eq!(benchmark.variables["format"], vec!["orc", "parquet"]);
        assert_eq!(benchmark.variables["partitions"], vec!["8"]);
    }

    #[test]
    fn test_defaults_and_validation() {
        let benchmark = loader()
            .parse("minimal", "datasource: memory\nquery-names: [q1]\n")
            .expect("valid descriptor");
        assert_eq!(benchmark.runs, 1);
        assert_eq!(benchmark.concurrency, 1);
        assert!(benchmark.variables.is_empty());

        let err = loader()
            .parse("bad", "datasource: memory\nquery-names: [q1]\nruns: 0\n")
            .expect_err("zero runs");
        assert!(matches!(err, BenchError::InvalidArgument(_)));

        assert!(loader().parse("typo", "datasource: m\nquery_names: [q]\n").is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b.yaml"), "datasource: m\nquery-names: [q]\n")
            .expect("write");
        std::fs::write(dir.path().join("a.yml"), "datasource: m\nquery-names: [q]\n")
            .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let loader = BenchmarkLoader::new(vec![dir.path().to_path_buf()], "ci");
        let all = loader.load(&[]).expect("load all");
        let names: Vec<_> = all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let picked = loader.load(&["b".to_string()]).expect("load one");
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "b");

        let err = loader.load(&["zzz".to_string()]).expect_err("unknown name");
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn test_load_sequences_groups_runs_of_each_benchmark() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["alpha", "beta"] {
            std::fs::write(
                dir.path().join(format!("{name}.yaml")),
                "datasource: memory\nquery-names: [q1]\n",
            )
            .expect("write");
        }
        let loader = BenchmarkLoader::new(vec![dir.path().to_path_buf()], "ci");

        let ids = vec!["a".to_string(), "b".to_string()];
        let order: Vec<_> = loader
            .load_sequences(&[], &ids)
            .expect("loads")
            .into_iter()
            .map(|b| format!("{}@{}", b.name, b.sequence_id))
            .collect();
        assert_eq!(order, vec!["alpha@a", "alpha@b", "beta@a", "beta@b"]);

        let err = loader.load_sequences(&[], &[]).expect_err("no ids");
        assert!(matches!(err, BenchError::InvalidArgument(_)));
    }
}
