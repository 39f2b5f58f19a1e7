// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Tera templating for SQL files and YAML configuration
//!
//! SQL files may start with property lines and contain several statements:
//!
//! ```text
//! --! datasource: warehouse; owner: perf
//! -- ordinary comments are dropped
//! SELECT * FROM lineitem WHERE l_quantity < {{ quantity }};
//! SELECT count(*) FROM orders
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use diagnostics::*;
use tera::{Tera, Value};

use crate::error::BenchError;

const PROPERTIES_MARKER: &str = "--!";
const COMMENT_MARKER: &str = "--";

/// A parsed SQL template file, not yet rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlTemplate {
    pub path: PathBuf,
    pub properties: BTreeMap<String, String>,
    pub body: String,
}

impl SqlTemplate {
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Render with `attributes` and split the result into statements.
    pub fn render(&self, attributes: &BTreeMap<String, String>) -> Result<Vec<String>, BenchError> {
        let mut context = tera::Context::new();
        for (key, value) in attributes {
            context.insert(key, value);
        }
        let rendered = Tera::default()
            .render_str(&self.body, &context)
            .map_err(|e| BenchError::Template {
                path: self.path.display().to_string(),
                attributes: attributes.clone(),
                message: error_chain(&e).join(": "),
            })?;
        Ok(split_statements(&rendered))
    }
}

/// Turns a query name plus attributes into SQL statements.
pub trait QueryRenderer: Send + Sync {
    fn load(&self, template_name: &str) -> Result<SqlTemplate, BenchError>;

    fn render(
        &self,
        template_name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, BenchError> {
        self.load(template_name)?.render(attributes)
    }
}

/// Loads `<name>.sql` from the first directory that has it.
#[derive(Debug, Clone)]
pub struct FileQueryRenderer {
    sql_dirs: Vec<PathBuf>,
}

impl FileQueryRenderer {
    pub fn new<I, P>(sql_dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            sql_dirs: sql_dirs.into_iter().map(Into::into).collect(),
        }
    }

    fn locate(&self, template_name: &str) -> Option<PathBuf> {
        let file_name = if template_name.ends_with(".sql") {
            template_name.to_string()
        } else {
            format!("{template_name}.sql")
        };
        self.sql_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }
}

impl QueryRenderer for FileQueryRenderer {
    fn load(&self, template_name: &str) -> Result<SqlTemplate, BenchError> {
        let Some(path) = self.locate(template_name) else {
            return Err(BenchError::Template {
                path: template_name.to_string(),
                attributes: BTreeMap::new(),
                message: format!("no such query file in {:?}", self.sql_dirs),
            });
        };
        let path_str = path.display().to_string();
        debug!("Loading query template {path_str}", path_str);
        let content = std::fs::read_to_string(&path)?;
        parse_template(&path, &content)
    }
}

/// Split property lines, comments and SQL body.
pub fn parse_template(path: &Path, content: &str) -> Result<SqlTemplate, BenchError> {
    let mut properties = BTreeMap::new();
    let mut body = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(header) = trimmed.strip_prefix(PROPERTIES_MARKER) {
            for (key, value) in parse_properties(header) {
                if let Some(existing) = properties.get(&key).filter(|e| **e != value) {
                    return Err(BenchError::Template {
                        path: path.display().to_string(),
                        attributes: BTreeMap::new(),
                        message: format!(
                            "property {key} defined twice with values {existing} and {value}"
                        ),
                    });
                }
                _ = properties.insert(key, value);
            }
        } else if !trimmed.starts_with(COMMENT_MARKER) {
            body.push(line);
        }
    }

    Ok(SqlTemplate {
        path: path.to_path_buf(),
        properties,
        body: body.join("\n"),
    })
}

fn parse_properties(header: &str) -> impl Iterator<Item = (String, String)> + '_ {
    header
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
}

/// Statements are separated by `;`; blank pieces are dropped.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand a YAML configuration file using Tera templates.
///
/// Besides `variables`, templates may call `env(name="VAR")` or
/// `env(name="VAR", default="fallback")`.
pub fn expand_yaml_template(
    yaml_content: &str,
    variables: &HashMap<String, String>,
) -> Result<String, BenchError> {
    let mut tera = Tera::default();
    tera.register_function("env", env_function());

    let mut context = tera::Context::new();
    for (key, value) in variables {
        context.insert(key, value);
    }

    tera.render_str(yaml_content, &context).map_err(|e| {
        let mut parts = error_chain(&e);
        if variables.is_empty() {
            parts.push("no template variables provided (use -v key=value)".to_string());
        } else {
            let mut keys: Vec<_> = variables.keys().collect();
            keys.sort();
            parts.push(format!("available variables: {keys:?}"));
        }
        BenchError::Config(parts.join("\n  "))
    })
}

fn error_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        chain.push(inner.to_string());
        source = inner.source();
    }
    chain
}

fn env_function() -> impl tera::Function {
    Box::new(
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let var_name = args
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| tera::Error::msg("env function requires 'name' parameter"))?;
            let default_value = args.get("default").and_then(|v| v.as_str());

            match std::env::var(var_name) {
                Ok(value) => Ok(Value::String(value)),
                Err(std::env::VarError::NotPresent) => default_value
                    .map(|d| Value::String(d.to_string()))
                    .ok_or_else(|| {
                        tera::Error::msg(format!(
                            "Environment variable '{var_name}' not set and no default provided"
                        ))
                    }),
                Err(e) => Err(tera::Error::msg(format!(
                    "Failed to read environment variable '{var_name}': {e}"
                ))),
            }
        },
    )
}
