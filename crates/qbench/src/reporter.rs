// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Pushing results to the benchmark service

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::benchmark::Benchmark;
use crate::error::BenchError;
use crate::execution::{BenchmarkExecutionResult, BenchmarkStatus, QueryExecution, QueryExecutionResult};
use crate::http::{JsonClient, join_url};
use crate::listener::BenchmarkListener;
use crate::measurement::Measurement;

#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn benchmark_started(&self, _benchmark: &Benchmark) -> Result<(), BenchError> {
        Ok(())
    }

    async fn report(
        &self,
        result: &BenchmarkExecutionResult,
        finished_at: DateTime<Utc>,
    ) -> Result<(), BenchError>;

    async fn execution_started(&self, _execution: &QueryExecution) -> Result<(), BenchError> {
        Ok(())
    }

    async fn execution_finished(&self, _result: &QueryExecutionResult) -> Result<(), BenchError> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkStartRequest {
    pub name: String,
    pub environment_name: String,
    pub variables: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStartRequest {
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    pub status: BenchmarkStatus,
    pub end_time: DateTime<Utc>,
    pub measurements: Vec<Measurement>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl BenchmarkStartRequest {
    #[must_use]
    pub fn from_benchmark(benchmark: &Benchmark) -> Self {
        let variables = benchmark
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.join(",")))
            .collect();
        Self {
            name: benchmark.name.clone(),
            environment_name: benchmark.environment.clone(),
            variables,
            attributes: benchmark.identity_attributes(),
        }
    }
}

impl FinishRequest {
    #[must_use]
    pub fn from_benchmark_result(result: &BenchmarkExecutionResult, end_time: DateTime<Utc>) -> Self {
        let mut attributes = BTreeMap::new();
        let causes = result.failure_causes();
        if !causes.is_empty() {
            let text: Vec<_> = causes.iter().map(|c| c.to_string()).collect();
            _ = attributes.insert("failure".to_string(), text.join("\n"));
        }
        Self {
            status: result.status(),
            end_time,
            measurements: result.measurements().to_vec(),
            attributes,
        }
    }

    #[must_use]
    pub fn from_execution_result(result: &QueryExecutionResult) -> Self {
        let mut attributes = BTreeMap::new();
        if let Some(cause) = result.failure() {
            _ = attributes.insert("failure".to_string(), cause.to_string());
        }
        if let Some(id) = result.engine_query_id() {
            _ = attributes.insert("engineQueryId".to_string(), id.to_string());
        }
        Self {
            status: if result.is_successful() {
                BenchmarkStatus::Success
            } else {
                BenchmarkStatus::Failed
            },
            end_time: result.finished_at(),
            measurements: result.measurements().to_vec(),
            attributes,
        }
    }
}

/// Posts JSON to `{service}/v1/benchmark/{unique name}/{sequence id}/...`.
#[derive(Debug, Clone)]
pub struct HttpResultReporter {
    service_url: String,
    client: JsonClient,
}

impl HttpResultReporter {
    pub fn new(service_url: impl Into<String>, client: JsonClient) -> Self {
        Self {
            service_url: service_url.into(),
            client,
        }
    }

    fn benchmark_url(&self, benchmark: &Benchmark, tail: &[&str]) -> String {
        let unique_name = benchmark.unique_name();
        let mut segments = vec![
            "v1",
            "benchmark",
            unique_name.as_str(),
            benchmark.sequence_id.as_str(),
        ];
        segments.extend_from_slice(tail);
        join_url(&self.service_url, &segments)
    }
}

#[async_trait]
impl ResultReporter for HttpResultReporter {
    async fn benchmark_started(&self, benchmark: &Benchmark) -> Result<(), BenchError> {
        let url = self.benchmark_url(benchmark, &["start"]);
        self.client
            .post_json(&url, &BenchmarkStartRequest::from_benchmark(benchmark))
            .await
    }

    async fn report(
        &self,
        result: &BenchmarkExecutionResult,
        finished_at: DateTime<Utc>,
    ) -> Result<(), BenchError> {
        let url = self.benchmark_url(result.benchmark(), &["finish"]);
        self.client
            .post_json(&url, &FinishRequest::from_benchmark_result(result, finished_at))
            .await
    }

    async fn execution_started(&self, execution: &QueryExecution) -> Result<(), BenchError> {
        let sequence = execution.sequence_id.to_string();
        let url = self.benchmark_url(&execution.benchmark, &["execution", sequence.as_str(), "start"]);
        let request = ExecutionStartRequest {
            attributes: execution.attributes.clone(),
        };
        self.client.post_json(&url, &request).await
    }

    async fn execution_finished(&self, result: &QueryExecutionResult) -> Result<(), BenchError> {
        let sequence = result.execution().sequence_id.to_string();
        let url = self.benchmark_url(result.benchmark(), &["execution", sequence.as_str(), "finish"]);
        self.client
            .post_json(&url, &FinishRequest::from_execution_result(result))
            .await
    }
}

/// Exposes a reporter to the orchestrator as a listener.
pub struct ReportingListener {
    reporter: Arc<dyn ResultReporter>,
}

impl ReportingListener {
    pub fn new(reporter: Arc<dyn ResultReporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl BenchmarkListener for ReportingListener {
    fn name(&self) -> &str {
        "result-reporter"
    }

    async fn benchmark_started(&self, benchmark: &Benchmark) -> Result<(), BenchError> {
        self.reporter.benchmark_started(benchmark).await
    }

    async fn benchmark_finished(&self, result: &BenchmarkExecutionResult) -> Result<(), BenchError> {
        let finished_at = result.finished_at().unwrap_or_else(Utc::now);
        self.reporter.report(result, finished_at).await
    }

    async fn execution_started(&self, execution: &QueryExecution) -> Result<(), BenchError> {
        self.reporter.execution_started(execution).await
    }

    async fn execution_finished(&self, result: &QueryExecutionResult) -> Result<(), BenchError> {
        self.reporter.execution_finished(result).await
    }
}
