// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! JSON over HTTP with retry on transient failures

use std::time::Duration;

use diagnostics::*;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BenchError;
use crate::retry::{RetryPolicy, RetryingClient};

const TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct JsonClient {
    http_client: reqwest::Client,
    retry: RetryingClient,
}

impl JsonClient {
    pub fn new(policy: RetryPolicy) -> Result<Self, BenchError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECONDS))
            .build()
            .map_err(|e| BenchError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            retry: RetryingClient::new(policy),
        })
    }

    pub async fn get_json<T>(&self, url: &str) -> Result<T, BenchError>
    where
        T: DeserializeOwned,
    {
        let http_client = &self.http_client;
        let text = self
            .retry
            .call(|| async move {
                let response = http_client
                    .get(url)
                    .send()
                    .await
                    .map_err(BenchError::from_http)?;
                read_body(url, response).await
            })
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn post_json<B>(&self, url: &str, body: &B) -> Result<(), BenchError>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        let payload = &payload;
        let http_client = &self.http_client;
        _ = self
            .retry
            .call(|| async move {
                let response = http_client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload.clone())
                    .send()
                    .await
                    .map_err(BenchError::from_http)?;
                read_body(url, response).await
            })
            .await?;
        Ok(())
    }
}

async fn read_body(url: &str, response: reqwest::Response) -> Result<String, BenchError> {
    let status = response.status();
    let text = response.text().await.map_err(BenchError::from_http)?;
    if status.is_success() {
        return Ok(text);
    }
    debug!("HTTP {status} from {url}: {text}", status: status.as_u16(), url, text);
    let message = format!("HTTP {status} from {url}: {text}");
    if status.is_server_error() {
        Err(BenchError::TransientExternal(message))
    } else {
        Err(BenchError::PermanentExternal(message))
    }
}

/// Join a base URL and path segments with single slashes.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(segment.trim_matches('/'));
    }
    url
}
