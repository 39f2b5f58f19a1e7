// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Named data sources and the connections queries run on

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use datafusion::prelude::SessionContext;
use diagnostics::*;
use futures::StreamExt;

use crate::error::BenchError;

/// What running one statement produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementOutcome {
    pub rows: u64,
    /// Engine-side identifier for fetching query statistics, if any.
    pub engine_query_id: Option<String>,
}

/// A session owned by exactly one execution at a time.
///
/// Dropping the connection releases it.
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, sql: &str) -> Result<StatementOutcome, BenchError>;
}

#[async_trait]
pub trait DataSourceProvider: Send + Sync {
    async fn connect(&self, name: &str) -> Result<Box<dyn Connection>, BenchError>;

    fn names(&self) -> Vec<String>;
}

/// In-process DataFusion catalogs, one per data source name.
///
/// Every connection gets its own `SessionContext` over the shared catalog,
/// so session settings never leak between concurrent executions.
#[derive(Default, Clone)]
pub struct DataFusionDataSources {
    contexts: HashMap<String, SessionContext>,
}

impl DataFusionDataSources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one context per entry and run its setup statements in order.
    pub async fn from_definitions(
        definitions: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, BenchError> {
        let mut sources = Self::new();
        for (name, setup) in definitions {
            let ctx = SessionContext::new();
            for statement in setup {
                debug!("Data source {name} setup: {statement}", name, statement);
                _ = run_statement(&ctx, statement).await?;
            }
            sources.insert(name.clone(), ctx);
        }
        Ok(sources)
    }

    pub fn insert(&mut self, name: impl Into<String>, ctx: SessionContext) {
        _ = self.contexts.insert(name.into(), ctx);
    }
}

#[async_trait]
impl DataSourceProvider for DataFusionDataSources {
    async fn connect(&self, name: &str) -> Result<Box<dyn Connection>, BenchError> {
        let shared = self
            .contexts
            .get(name)
            .ok_or_else(|| BenchError::UnknownDataSource(name.to_string()))?;
        Ok(Box::new(DataFusionConnection {
            ctx: SessionContext::new_with_state(shared.state()),
            session: shared.session_id(),
        }))
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.contexts.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Statement counter behind DataFusion query ids; unique per process.
static NEXT_QUERY: AtomicU64 = AtomicU64::new(0);

pub struct DataFusionConnection {
    ctx: SessionContext,
    /// Session id of the data source's catalog context.
    session: String,
}

#[async_trait]
impl Connection for DataFusionConnection {
    async fn execute(&mut self, sql: &str) -> Result<StatementOutcome, BenchError> {
        let query_id = format!("{}_{}", self.session, NEXT_QUERY.fetch_add(1, Ordering::Relaxed));
        debug!("Running {query_id}: {sql}", query_id: query_id.as_str(), sql);
        let rows = run_statement(&self.ctx, sql).await?;
        Ok(StatementOutcome {
            rows,
            engine_query_id: Some(query_id),
        })
    }
}

/// Plan and drain a statement, counting rows as batches arrive.
async fn run_statement(ctx: &SessionContext, sql: &str) -> Result<u64, BenchError> {
    let df = ctx.sql(sql).await?;
    let mut stream = df.execute_stream().await?;
    let mut rows = 0u64;
    while let Some(batch) = stream.next().await {
        rows += batch?.num_rows() as u64;
    }
    Ok(rows)
}
