// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use qbench::{
    BenchmarkListener, BenchmarkLoader, BenchmarkOrchestrator, DataFusionDataSources,
    DataSourceProvider, DriverConfig, EngineMetricsProvider, FileQueryRenderer,
    HttpQueryInfoClient, HttpResultReporter, JsonClient, ListenerSet, LoggingListener,
    MacroRunner, MacroTable, MeasurementCollector, QueryRenderer, ReportingListener,
    StatusReporter, SuiteMacros,
};
use tokio_util::sync::CancellationToken;

/// Parse a `key=value` command line variable.
pub fn parse_variable(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{text}'")),
    }
}

/// Loaded configuration plus the variables it was expanded with.
pub struct DriverContext {
    pub config_path: PathBuf,
    pub config: DriverConfig,
    pub variables: HashMap<String, String>,
}

impl DriverContext {
    pub fn load(config_path: &Path, variables: Vec<(String, String)>) -> Result<Self> {
        let variables: HashMap<_, _> = variables.into_iter().collect();
        let config = DriverConfig::load(config_path, &variables)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;
        Ok(Self {
            config_path: config_path.to_path_buf(),
            config,
            variables,
        })
    }

    #[must_use]
    pub fn loader(&self) -> BenchmarkLoader {
        BenchmarkLoader::new(self.config.benchmark_dirs.clone(), &self.config.environment)
            .variables(self.variables.clone())
    }

    /// Logging always; result reporting when a service URL is configured.
    pub fn listeners(&self) -> Result<ListenerSet> {
        let mut listeners: Vec<Arc<dyn BenchmarkListener>> = vec![Arc::new(LoggingListener)];
        if let Some(url) = &self.config.service_url {
            let client = JsonClient::new(self.config.retry)?;
            let reporter = Arc::new(HttpResultReporter::new(url.clone(), client));
            listeners.push(Arc::new(ReportingListener::new(reporter)));
        }
        Ok(ListenerSet::start(listeners))
    }

    pub async fn orchestrator(
        &self,
        status: StatusReporter,
        cancel: CancellationToken,
    ) -> Result<BenchmarkOrchestrator> {
        let config = &self.config;
        let data_sources: Arc<dyn DataSourceProvider> = Arc::new(
            DataFusionDataSources::from_definitions(&config.data_sources)
                .await
                .map_err(|e| anyhow!("Failed to prepare data sources: {e}"))?,
        );
        let renderer: Arc<dyn QueryRenderer> =
            Arc::new(FileQueryRenderer::new(config.sql_dirs.clone()));
        let macros = Arc::new(MacroRunner::new(
            Arc::new(MacroTable::new(config.macros.clone())),
            renderer.clone(),
            data_sources.clone(),
        ));

        let mut collector = MeasurementCollector::with_defaults();
        if let Some(url) = &config.query_info_url {
            let client = HttpQueryInfoClient::new(url.clone(), JsonClient::new(config.retry)?);
            collector = collector.optional(Arc::new(EngineMetricsProvider::new(Arc::new(client))));
        }

        let mut orchestrator = BenchmarkOrchestrator::new(renderer, data_sources, macros);
        if let Some(limit) = config.time_limit() {
            orchestrator = orchestrator.with_time_limit(limit);
        }
        Ok(orchestrator
            .with_collector(collector)
            .with_status(status)
            .with_failure_policy(config.failure_policy)
            .with_post_macro_policy(config.post_macro_policy)
            .with_suite_macros(SuiteMacros {
                before_all: config.before_all_macros.clone(),
                after_all: config.after_all_macros.clone(),
                health_check: config.health_check_macros.clone(),
            })
            .with_cancellation(cancel))
    }
}
