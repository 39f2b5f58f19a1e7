// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Hooks run around suites, benchmarks and executions
//!
//! A macro is either a shell command from the configuration or, when its
//! name ends in `.sql`, a SQL template executed against a data source.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use diagnostics::*;
use tokio::process::Command;

use crate::benchmark::Benchmark;
use crate::datasource::{Connection, DataSourceProvider};
use crate::error::BenchError;
use crate::template::QueryRenderer;

const SHELL: &str = "bash";
const SQL_SUFFIX: &str = ".sql";
/// Template property that routes a SQL macro to another data source.
pub const DATASOURCE_PROPERTY: &str = "datasource";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroDefinition {
    /// `None` or an empty string means the macro was declared without a
    /// command.
    Shell(Option<String>),
    /// Name of a SQL template.
    Sql(String),
}

impl MacroDefinition {
    /// Pick the kind from the macro name.
    #[must_use]
    pub fn for_name(name: &str, command: Option<String>) -> Self {
        if name.ends_with(SQL_SUFFIX) {
            MacroDefinition::Sql(name.to_string())
        } else {
            MacroDefinition::Shell(command)
        }
    }
}

pub trait MacroRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<MacroDefinition>;
}

/// Shell macros declared by name; `.sql` names resolve without declaration.
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    commands: BTreeMap<String, Option<String>>,
}

impl MacroTable {
    #[must_use]
    pub fn new(commands: BTreeMap<String, Option<String>>) -> Self {
        Self { commands }
    }

    pub fn define(&mut self, name: impl Into<String>, command: Option<String>) {
        _ = self.commands.insert(name.into(), command);
    }
}

impl MacroRegistry for MacroTable {
    fn lookup(&self, name: &str) -> Option<MacroDefinition> {
        if name.ends_with(SQL_SUFFIX) {
            return Some(MacroDefinition::Sql(name.to_string()));
        }
        self.commands
            .get(name)
            .map(|command| MacroDefinition::Shell(command.clone()))
    }
}

pub struct MacroRunner {
    registry: Arc<dyn MacroRegistry>,
    renderer: Arc<dyn QueryRenderer>,
    data_sources: Arc<dyn DataSourceProvider>,
}

impl MacroRunner {
    pub fn new(
        registry: Arc<dyn MacroRegistry>,
        renderer: Arc<dyn QueryRenderer>,
        data_sources: Arc<dyn DataSourceProvider>,
    ) -> Self {
        Self {
            registry,
            renderer,
            data_sources,
        }
    }

    /// Run one macro to completion.
    ///
    /// Shell macros see the benchmark identity and the first value of each
    /// variable as environment variables.
    pub async fn run(
        &self,
        name: &str,
        benchmark: Option<&Benchmark>,
        connection: Option<&mut dyn Connection>,
    ) -> Result<(), BenchError> {
        let attributes = benchmark.map(default_attributes).unwrap_or_default();
        self.run_with_attributes(name, benchmark, &attributes, connection)
            .await
    }

    /// Run one macro with an explicit attribute map, as the execution pool
    /// does for per-execution hooks.
    pub async fn run_with_attributes(
        &self,
        name: &str,
        benchmark: Option<&Benchmark>,
        attributes: &BTreeMap<String, String>,
        connection: Option<&mut dyn Connection>,
    ) -> Result<(), BenchError> {
        let result = match self.registry.lookup(name) {
            None => Err(BenchError::UndefinedMacro(name.to_string())),
            Some(MacroDefinition::Shell(command)) => {
                run_shell(name, command.as_deref(), attributes).await
            }
            Some(MacroDefinition::Sql(template)) => {
                self.run_sql(name, &template, benchmark, attributes, connection)
                    .await
            }
        };
        if let Err(err) = &result {
            let err = err.to_string();
            error!("Macro {name} failed: {err}", name, err: err.as_str());
        }
        result
    }

    /// Run macros in order, stopping at the first failure.
    pub async fn run_all(
        &self,
        names: &[String],
        benchmark: Option<&Benchmark>,
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
            self.run(name, benchmark, reborrowed).await?;
        }
        Ok(())
    }

    async fn run_sql(
        &self,
        name: &str,
        template: &str,
        benchmark: Option<&Benchmark>,
        attributes: &BTreeMap<String, String>,
        connection: Option<&mut dyn Connection>,
    ) -> Result<(), BenchError> {
        let Some(benchmark) = benchmark else {
            return Err(BenchError::InvalidArgument(format!(
                "Benchmark is required to run query based macro {name}"
            )));
        };
        let template = self.renderer.load(template)?;
        let statements = template.render(attributes)?;

        let routed = template.property(DATASOURCE_PROPERTY);
        let mut owned;
        let target: &mut dyn Connection = match (routed, connection) {
            (None, Some(conn)) => conn,
            (routed, _) => {
                let source = routed.unwrap_or(benchmark.data_source.as_str());
                owned = self.data_sources.connect(source).await?;
                owned.as_mut()
            }
        };

        for statement in &statements {
            info!("Executing macro query: {statement}", statement);
            _ = target.execute(statement).await?;
        }
        Ok(())
    }
}

/// Identity plus the first value of every variable.
fn default_attributes(benchmark: &Benchmark) -> BTreeMap<String, String> {
    let mut attributes = benchmark.identity_attributes();
    for (key, values) in &benchmark.variables {
        if let Some(first) = values.first() {
            _ = attributes.insert(key.clone(), first.clone());
        }
    }
    attributes
}

async fn run_shell(
    name: &str,
    command: Option<&str>,
    environment: &BTreeMap<String, String>,
) -> Result<(), BenchError> {
    let command = command
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| BenchError::NoCommand(name.to_string()))?;

    info!("Executing macro {name}: {command}", name, command);
    let output = Command::new(SHELL)
        .arg("-c")
        .arg(command)
        .envs(environment)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| BenchError::MacroSpawn {
            name: name.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        if !stdout.is_empty() {
            debug!("Macro {name} stdout: {stdout}", name, stdout);
        }
        if !stderr.is_empty() {
            warn!("Macro {name} stderr: {stderr}", name, stderr);
        }
        return Ok(());
    }

    if !stdout.is_empty() {
        error!("Macro {name} stdout: {stdout}", name, stdout);
    }
    if !stderr.is_empty() {
        error!("Macro {name} stderr: {stderr}", name, stderr);
    }
    Err(BenchError::MacroExecution {
        name: name.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{DataFusionDataSources, StatementOutcome};
    use crate::template::FileQueryRenderer;

    fn runner(commands: &[(&str, Option<&str>)], sql_dir: Option<&std::path::Path>) -> MacroRunner {
        let table = MacroTable::new(
            commands
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect(),
        );
        MacroRunner::new(
            Arc::new(table),
            Arc::new(FileQueryRenderer::new(sql_dir)),
            Arc::new(DataFusionDataSources::new()),
        )
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(
            MacroDefinition::for_name("drop-caches", Some("sync".to_string())),
            MacroDefinition::Shell(Some("sync".to_string()))
        );
        assert_eq!(
            MacroDefinition::for_name("analyze.sql", None),
            MacroDefinition::Sql("analyze.sql".to_string())
        );
    }

    #[tokio::test]
    async fn test_undefined_macro() {
        let err = runner(&[], None)
            .run("nope", None, None)
            .await
            .expect_err("undefined");
        let message = err.to_string();
        assert!(message.contains("nope"));
        assert!(message.contains("is not defined"));
    }

    #[tokio::test]
    async fn test_macro_without_command() {
        let runner = runner(&[("empty", None), ("blank", Some("  "))], None);
        for name in ["empty", "blank"] {
            let err = runner.run(name, None, None).await.expect_err("no command");
            assert!(err.to_string().contains("has no command defined"));
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = runner(&[("fail", Some("exit 1"))], None)
            .run("fail", None, None)
            .await
            .expect_err("exit 1");
        assert!(err.to_string().contains("exited with code 1"));
        assert!(matches!(err, BenchError::MacroExecution { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_shell_sees_benchmark_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("env.txt");
        let command = format!(
            "echo \"$benchmark_name $scale\" > {}",
            out.display()
        );
        let benchmark = Benchmark::builder("tpch", "memory")
            .query("q1")
            .variable("scale", ["10", "100"])
            .build()
            .expect("valid benchmark");

        runner(&[("record", Some(command.as_str()))], None)
            .run("record", Some(&benchmark), None)
            .await
            .expect("macro succeeds");
        let written = std::fs::read_to_string(out).expect("macro wrote file");
        assert_eq!(written.trim(), "tpch 10");
    }

    #[tokio::test]
    async fn test_sql_macro_requires_benchmark() {
        let err = runner(&[], None)
            .run("setup.sql", None, None)
            .await
            .expect_err("no benchmark");
        assert!(matches!(err, BenchError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_sql_macro_runs_on_provided_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("setup.sql"),
            "CREATE TABLE scaled AS VALUES ({{ scale }});\nSELECT * FROM scaled;",
        )
        .expect("write");

        let mut sources = DataFusionDataSources::new();
        sources.insert("memory", datafusion::prelude::SessionContext::new());
        let sources = Arc::new(sources);
        let runner = MacroRunner::new(
            Arc::new(MacroTable::default()),
            Arc::new(FileQueryRenderer::new([dir.path()])),
            sources.clone(),
        );
        let benchmark = Benchmark::builder("b", "memory")
            .query("q1")
            .variable("scale", ["7"])
            .build()
            .expect("valid benchmark");

        let mut conn = sources.connect("memory").await.expect("connect");
        runner
            .run("setup.sql", Some(&benchmark), Some(conn.as_mut()))
            .await
            .expect("sql macro succeeds");

        let mut check = sources.connect("memory").await.expect("connect");
        assert_eq!(
            check.execute("SELECT * FROM scaled").await.expect("query").rows,
            1
        );
    }

    struct CountingConnection {
        statements: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Connection for CountingConnection {
        async fn execute(&mut self, sql: &str) -> Result<StatementOutcome, BenchError> {
            self.statements.push(sql.to_string());
            Ok(StatementOutcome {
                rows: 0,
                engine_query_id: None,
            })
        }
    }

    #[tokio::test]
    async fn test_run_all_reuses_one_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("first.sql"), "SELECT 1").expect("write");
        std::fs::write(dir.path().join("second.sql"), "SELECT {{ scale }}").expect("write");
        let runner = runner(&[], Some(dir.path()));
        let benchmark = Benchmark::builder("b", "nowhere")
            .query("q1")
            .variable("scale", ["3"])
            .build()
            .expect("valid benchmark");

        let mut conn = CountingConnection {
            statements: Vec::new(),
        };
        runner
            .run_all(
                &["first.sql".to_string(), "second.sql".to_string()],
                Some(&benchmark),
                Some(&mut conn),
            )
            .await
            .expect("both macros run on the given connection");
        assert_eq!(conn.statements, vec!["SELECT 1", "SELECT 3"]);
    }
}
