// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Measurements and the providers that produce them
//!
//! After each query and after each benchmark the collector asks every
//! registered provider for measurements and concatenates the answers in
//! registration order.

use std::sync::Arc;

use async_trait::async_trait;
use diagnostics::*;
use serde::{Deserialize, Serialize};

use crate::error::BenchError;
use crate::execution::{BenchmarkExecutionResult, QueryExecutionResult};
use crate::http::{JsonClient, join_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementUnit {
    Milliseconds,
    Bytes,
    QueryPerSecond,
    None,
}

impl std::fmt::Display for MeasurementUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MeasurementUnit::Milliseconds => "MILLISECONDS",
            MeasurementUnit::Bytes => "BYTES",
            MeasurementUnit::QueryPerSecond => "QUERY_PER_SECOND",
            MeasurementUnit::None => "NONE",
        };
        f.write_str(name)
    }
}

/// A named value. Equal when name, unit and value all match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub unit: MeasurementUnit,
    pub value: f64,
}

impl Measurement {
    pub fn new(name: impl Into<String>, unit: MeasurementUnit, value: f64) -> Self {
        Self {
            name: name.into(),
            unit,
            value,
        }
    }
}

/// What a provider is asked to measure.
#[derive(Debug, Clone, Copy)]
pub enum Measured<'a> {
    Query(&'a QueryExecutionResult),
    Benchmark(&'a BenchmarkExecutionResult),
}

#[async_trait]
pub trait MeasurementProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Missing preconditions yield an empty list, not an error.
    async fn measure(&self, subject: Measured<'_>) -> Result<Vec<Measurement>, BenchError>;
}

fn millis(duration: std::time::Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Elapsed wall time in milliseconds.
///
/// Always reported for queries; reported for benchmarks only when they ran
/// concurrently, since a serial benchmark's time is the sum of its queries.
#[derive(Debug, Default)]
pub struct DurationMeasurementProvider;

#[async_trait]
impl MeasurementProvider for DurationMeasurementProvider {
    fn name(&self) -> &'static str {
        "duration"
    }

    async fn measure(&self, subject: Measured<'_>) -> Result<Vec<Measurement>, BenchError> {
        let duration = match subject {
            Measured::Query(result) => Some(result.duration()),
            Measured::Benchmark(result) if result.benchmark().is_concurrent() => {
                result.query_duration()
            }
            Measured::Benchmark(_) => None,
        };
        Ok(duration
            .map(|d| Measurement::new("duration", MeasurementUnit::Milliseconds, millis(d)))
            .into_iter()
            .collect())
    }
}

/// Queries per second across a concurrent, successful benchmark.
#[derive(Debug, Default)]
pub struct ThroughputMeasurementProvider;

impl ThroughputMeasurementProvider {
    fn throughput(result: &BenchmarkExecutionResult) -> Result<Option<Measurement>, BenchError> {
        if !result.benchmark().is_concurrent() || !result.is_successful() {
            return Ok(None);
        }
        let Some(duration) = result.query_duration() else {
            return Ok(None);
        };
        let duration_ms = millis(duration);
        if duration_ms <= 0.0 {
            return Err(BenchError::InvalidArgument(format!(
                "benchmark {} finished {} executions in zero time, throughput is undefined",
                result.benchmark().name,
                result.executions().len()
            )));
        }
        let executions = result.executions().len() as f64;
        Ok(Some(Measurement::new(
            "throughput",
            MeasurementUnit::QueryPerSecond,
            executions / duration_ms * 1000.0,
        )))
    }
}

#[async_trait]
impl MeasurementProvider for ThroughputMeasurementProvider {
    fn name(&self) -> &'static str {
        "throughput"
    }

    async fn measure(&self, subject: Measured<'_>) -> Result<Vec<Measurement>, BenchError> {
        match subject {
            Measured::Benchmark(result) => Ok(Self::throughput(result)?.into_iter().collect()),
            Measured::Query(_) => Ok(Vec::new()),
        }
    }
}

/// Source of engine-side statistics for a finished query.
#[async_trait]
pub trait QueryInfoClient: Send + Sync {
    async fn load_metrics(&self, query_id: &str) -> Result<Vec<Measurement>, BenchError>;
}

/// Statistics the engine reports under `queryStats`, with the unit each is
/// converted to.
const ENGINE_METRICS: &[(&str, MeasurementUnit)] = &[
    ("totalPlanningTime", MeasurementUnit::Milliseconds),
    ("totalScheduledTime", MeasurementUnit::Milliseconds),
    ("totalCpuTime", MeasurementUnit::Milliseconds),
    ("totalUserTime", MeasurementUnit::Milliseconds),
    ("totalBlockedTime", MeasurementUnit::Milliseconds),
    ("processedInputDataSize", MeasurementUnit::Bytes),
    ("outputDataSize", MeasurementUnit::Bytes),
    ("peakMemoryReservation", MeasurementUnit::Bytes),
];

/// Reads `GET {base}/v1/query/{id}` from the engine's REST endpoint.
#[derive(Debug, Clone)]
pub struct HttpQueryInfoClient {
    base_url: String,
    client: JsonClient,
}

impl HttpQueryInfoClient {
    pub fn new(base_url: impl Into<String>, client: JsonClient) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl QueryInfoClient for HttpQueryInfoClient {
    async fn load_metrics(&self, query_id: &str) -> Result<Vec<Measurement>, BenchError> {
        let url = join_url(&self.base_url, &["v1", "query", query_id]);
        let info: serde_json::Value = self.client.get_json(&url).await?;
        parse_query_stats(&info)
    }
}

/// Pick the known statistics out of a query-info document.
pub fn parse_query_stats(info: &serde_json::Value) -> Result<Vec<Measurement>, BenchError> {
    let Some(stats) = info.get("queryStats").and_then(|s| s.as_object()) else {
        return Err(BenchError::PermanentExternal(
            "query info has no queryStats".to_string(),
        ));
    };
    ENGINE_METRICS
        .iter()
        .filter_map(|(name, unit)| stats.get(*name).map(|value| (name, unit, value)))
        .map(|(name, unit, value)| {
            let value = match value {
                serde_json::Value::Number(n) => n.as_f64().unwrap_or_default(),
                serde_json::Value::String(s) => parse_quantity(s, *unit)?,
                other => {
                    return Err(BenchError::PermanentExternal(format!(
                        "statistic {name} has unexpected value {other}"
                    )));
                }
            };
            Ok(Measurement::new(format!("engine-{name}"), *unit, value))
        })
        .collect()
}

/// Parse strings such as `1.50ms`, `2.3m` or `12.5MB` into `unit`.
pub fn parse_quantity(text: &str, unit: MeasurementUnit) -> Result<f64, BenchError> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| BenchError::PermanentExternal(format!("cannot parse quantity {text}")))?;

    let factor = match (unit, suffix.trim()) {
        (_, "") => 1.0,
        (MeasurementUnit::Milliseconds, "ns") => 1e-6,
        (MeasurementUnit::Milliseconds, "us") => 1e-3,
        (MeasurementUnit::Milliseconds, "ms") => 1.0,
        (MeasurementUnit::Milliseconds, "s") => 1e3,
        (MeasurementUnit::Milliseconds, "m") => 60e3,
        (MeasurementUnit::Milliseconds, "h") => 3600e3,
        (MeasurementUnit::Milliseconds, "d") => 86400e3,
        (MeasurementUnit::Bytes, "B") => 1.0,
        (MeasurementUnit::Bytes, "kB") => 1024.0,
        (MeasurementUnit::Bytes, "MB") => 1024.0_f64.powi(2),
        (MeasurementUnit::Bytes, "GB") => 1024.0_f64.powi(3),
        (MeasurementUnit::Bytes, "TB") => 1024.0_f64.powi(4),
        (MeasurementUnit::Bytes, "PB") => 1024.0_f64.powi(5),
        (unit, suffix) => {
            return Err(BenchError::PermanentExternal(format!(
                "unit {suffix} in {text} cannot be converted to {unit}"
            )));
        }
    };
    Ok(number * factor)
}

/// Engine statistics for queries that report an engine query id.
pub struct EngineMetricsProvider {
    client: Arc<dyn QueryInfoClient>,
}

impl EngineMetricsProvider {
    pub fn new(client: Arc<dyn QueryInfoClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MeasurementProvider for EngineMetricsProvider {
    fn name(&self) -> &'static str {
        "engine-metrics"
    }

    async fn measure(&self, subject: Measured<'_>) -> Result<Vec<Measurement>, BenchError> {
        match subject {
            Measured::Query(result) => match result.engine_query_id() {
                Some(id) => self.client.load_metrics(id).await,
                None => Ok(Vec::new()),
            },
            Measured::Benchmark(_) => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Errors propagate to the caller.
    Required,
    /// Errors are logged and the provider contributes nothing.
    Optional,
}

/// Ordered set of providers.
#[derive(Default)]
pub struct MeasurementCollector {
    providers: Vec<(Arc<dyn MeasurementProvider>, Requirement)>,
}

impl MeasurementCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration and throughput, both required.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new()
            .required(Arc::new(DurationMeasurementProvider))
            .required(Arc::new(ThroughputMeasurementProvider))
    }

    #[must_use]
    pub fn required(mut self, provider: Arc<dyn MeasurementProvider>) -> Self {
        self.providers.push((provider, Requirement::Required));
        self
    }

    #[must_use]
    pub fn optional(mut self, provider: Arc<dyn MeasurementProvider>) -> Self {
        self.providers.push((provider, Requirement::Optional));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn collect(&self, subject: Measured<'_>) -> Result<Vec<Measurement>, BenchError> {
        let mut measurements = Vec::new();
        for (provider, requirement) in &self.providers {
            match provider.measure(subject).await {
                Ok(mut found) => measurements.append(&mut found),
                Err(err) if *requirement == Requirement::Optional => {
                    let provider = provider.name();
                    let err = err.to_string();
                    warn!(
                        "Measurement provider {provider} failed, skipping: {err}",
                        provider,
                        err: err.as_str()
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(measurements)
    }
}
