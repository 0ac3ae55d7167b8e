//! Blocking JSON-over-HTTP client used by the webhook sink and webhook action backend
//!
//! Wraps an async `reqwest` client in a private current-thread tokio runtime so
//! the synchronous evaluation pass can call it directly. Every request carries
//! the configured timeout; a timed-out request is an error, never a hang.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// POSTs JSON bodies to a single endpoint.
pub struct JsonPoster {
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    url: String,
}

impl JsonPoster {
    /// Build a poster for `url` with an optional bearer token.
    pub fn new(url: &str, api_key: Option<&str>, timeout_secs: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            runtime,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST `body` and return the parsed JSON response (or `null` for an empty body).
    pub fn post<B: Serialize>(&self, body: &B) -> Result<Value> {
        self.runtime.block_on(self.post_async(body))
    }

    async fn post_async<B: Serialize>(&self, body: &B) -> Result<Value> {
        let response = self
            .http_client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| String::new());

        if !status.is_success() {
            return Err(Error::Delivery(format!("API error ({}): {}", status, text)));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Delivery(format!("failed to parse response: {}", e)))
    }
}
