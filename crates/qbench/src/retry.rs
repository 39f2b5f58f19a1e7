// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry for calls to external services

use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use diagnostics::*;
use serde::{Deserialize, Serialize};

use crate::error::BenchError;

/// How often and how patiently to retry a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    #[serde(rename = "backoff_ms", with = "millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

/// Retries an operation while it fails with [`BenchError::TransientExternal`].
///
/// Other errors are returned on the first attempt. When the attempts run
/// out, the last transient error is returned as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingClient {
    policy: RetryPolicy,
}

impl RetryingClient {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, BenchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BenchError>>,
    {
        let backoff = ConstantBuilder::default()
            .with_delay(self.policy.backoff)
            .with_max_times(self.policy.max_attempts.saturating_sub(1));

        operation
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(BenchError::is_transient)
            .notify(|err: &BenchError, delay: Duration| {
                let err = err.to_string();
                let delay_ms = delay.as_millis() as u64;
                warn!("Transient failure, retrying in {delay_ms}ms: {err}", delay_ms, err: err.as_str());
            })
            .await
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
