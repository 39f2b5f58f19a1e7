// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Driver configuration
//!
//! The YAML file is expanded with Tera before parsing, so values can come
//! from `-v key=value` or from the environment:
//!
//! ```yaml
//! sql_dirs: [sql]
//! benchmark_dirs: [benchmarks]
//! environment: "{{ env(name='BENCH_ENV', default='local') }}"
//! data_sources:
//!   memory:
//!     - CREATE TABLE nation AS VALUES (0, 'ALGERIA'), (1, 'ARGENTINA')
//! macros:
//!   drop-caches: sync
//! failure_policy: abort-on-first-failure
//! retry:
//!   max_attempts: 3
//!   backoff_ms: 1000
//! time_limit_secs: 3600
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BenchError;
use crate::retry::RetryPolicy;
use crate::template::expand_yaml_template;

/// What a failed repetition means for the rest of the benchmark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Run every repetition; failures are aggregated afterwards.
    #[default]
    ContinueOnFailure,
    /// Submit nothing new after the first failure and fail the benchmark.
    AbortOnFirstFailure,
}

/// Whether after-benchmark macros run when nothing succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostMacroPolicy {
    #[default]
    Always,
    SkipOnTotalFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub sql_dirs: Vec<PathBuf>,
    pub benchmark_dirs: Vec<PathBuf>,
    /// Data source name to the statements that prepare it.
    pub data_sources: BTreeMap<String, Vec<String>>,
    /// Shell macro name to command. A null command is an error at run time.
    pub macros: BTreeMap<String, Option<String>>,
    pub before_all_macros: Vec<String>,
    pub after_all_macros: Vec<String>,
    pub health_check_macros: Vec<String>,
    pub failure_policy: FailurePolicy,
    pub post_macro_policy: PostMacroPolicy,
    pub retry: RetryPolicy,
    pub service_url: Option<String>,
    pub query_info_url: Option<String>,
    pub environment: String,
    pub listener_drain_timeout_secs: u64,
    /// Wall-clock budget for the whole suite; nothing new starts after it.
    pub time_limit_secs: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sql_dirs: vec![PathBuf::from("sql")],
            benchmark_dirs: vec![PathBuf::from("benchmarks")],
            data_sources: BTreeMap::new(),
            macros: BTreeMap::new(),
            before_all_macros: Vec::new(),
            after_all_macros: Vec::new(),
            health_check_macros: Vec::new(),
            failure_policy: FailurePolicy::default(),
            post_macro_policy: PostMacroPolicy::default(),
            retry: RetryPolicy::default(),
            service_url: None,
            query_info_url: None,
            environment: "default".to_string(),
            listener_drain_timeout_secs: 30,
            time_limit_secs: None,
        }
    }
}

impl DriverConfig {
    /// Read, expand and parse a config file. Relative directories are
    /// resolved against the file's directory.
    pub fn load(path: &Path, variables: &HashMap<String, String>) -> Result<Self, BenchError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&content, variables)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str, variables: &HashMap<String, String>) -> Result<Self, BenchError> {
        let expanded = expand_yaml_template(content, variables)?;
        let config: DriverConfig = serde_yaml_ng::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in self.sql_dirs.iter_mut().chain(self.benchmark_dirs.iter_mut()) {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        if self.retry.max_attempts < 1 {
            return Err(BenchError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.time_limit_secs == Some(0) {
            return Err(BenchError::Config(
                "time_limit_secs must be positive".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(BenchError::Config("environment must not be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn listener_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.listener_drain_timeout_secs)
    }

    #[must_use]
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs)
    }
}
