// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::Result;
use cmd::commands::{list_command, run_command};
use cmd::common::DriverContext;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write(dir: &Path, name: &str, content: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(name), content)?;
    Ok(())
}

fn project() -> Result<TempDir> {
    let root = tempfile::tempdir()?;
    write(
        root.path(),
        "qbench.yaml",
        r#"
environment: "{{ env(name='QBENCH_TEST_UNSET_ENV', default='local') }}"
data_sources:
  memory:
    - CREATE TABLE nation (id INT, name VARCHAR) AS VALUES (0, 'ALGERIA'), (1, 'ARGENTINA'), (2, 'BRAZIL')
"#,
    )?;
    let benchmarks = root.path().join("benchmarks");
    write(
        &benchmarks,
        "nations.yaml",
        "datasource: memory\nquery-names: [count, filter]\nruns: 2\nconcurrency: 2\nvariables:\n  limit: \"{{ limit }}\"\n",
    )?;
    let sql = root.path().join("sql");
    write(&sql, "count.sql", "SELECT count(*) FROM nation")?;
    write(&sql, "filter.sql", "SELECT * FROM nation WHERE id < {{ limit }}")?;
    Ok(root)
}

fn context(root: &TempDir) -> Result<DriverContext> {
    DriverContext::load(
        &root.path().join("qbench.yaml"),
        vec![("limit".to_string(), "1, 2".to_string())],
    )
}

#[tokio::test]
async fn test_run_prints_result_table() -> Result<()> {
    let root = project()?;
    let context = context(&root)?;
    assert_eq!(context.config.environment, "local");

    let mut out = Vec::new();
    let ids = ["3".to_string()];
    let results = run_command(&context, &[], &ids, CancellationToken::new(), &mut out).await?;

    assert_eq!(results.len(), 1);
    assert!(results[0].is_successful());
    assert_eq!(results[0].executions().len(), 8);

    let table = String::from_utf8(out)?;
    let lines: Vec<_> = table.lines().collect();
    assert!(lines[0].starts_with("BENCHMARK"));
    assert!(lines[1].starts_with("nations@3"));
    assert!(lines[1].contains("SUCCESS"));
    assert!(table.contains("throughput"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_benchmark_is_an_error() -> Result<()> {
    let root = project()?;
    let context = context(&root)?;
    let mut out = Vec::new();
    let err = run_command(
        &context,
        &["nope".to_string()],
        &["1".to_string()],
        CancellationToken::new(),
        &mut out,
    )
    .await
    .expect_err("unknown benchmark");
    assert!(err.to_string().contains("nope"));
    Ok(())
}

#[tokio::test]
async fn test_suite_repeats_for_each_sequence_id() -> Result<()> {
    let root = project()?;
    let context = context(&root)?;
    let ids = ["first".to_string(), "second".to_string()];
    let mut out = Vec::new();
    let results = run_command(&context, &[], &ids, CancellationToken::new(), &mut out).await?;

    let seen: Vec<_> = results
        .iter()
        .map(|r| r.benchmark().sequence_id.as_str())
        .collect();
    assert_eq!(seen, vec!["first", "second"]);
    assert!(results.iter().all(|r| r.executions().len() == 8));
    let table = String::from_utf8(out)?;
    assert!(table.contains("nations@first"));
    assert!(table.contains("nations@second"));
    Ok(())
}

#[test]
fn test_list_counts_executions() -> Result<()> {
    let root = project()?;
    let mut out = Vec::new();
    list_command(&context(&root)?, &mut out)?;
    assert_eq!(
        String::from_utf8(out)?.trim(),
        "nations datasource=memory queries=count,filter executions=8"
    );
    Ok(())
}
