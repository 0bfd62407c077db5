//! The `http_request` strategy.
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::{ExecutionError, Perform};
use crate::job::config::{ConfigError, HttpRequestConfig};

/// Issues the HTTP request described by a job's config.
///
/// Any transport error or non-2xx response fails the execution. The response body of a failed
/// request is kept as the error's payload, decoded as JSON when possible.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Perform<HttpRequestConfig> for HttpExecutor {
    async fn perform(&self, config: &HttpRequestConfig) -> Result<(), ExecutionError> {
        let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::HttpMethod(config.method.clone()))?;

        tracing::debug!(%method, url = %config.url, "Making HTTP request to {}", config.url);

        let mut request = self
            .client
            .request(method, &config.url)
            .timeout(config.timeout());
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        request = match &config.body {
            None | Some(Value::Null) => request,
            Some(Value::String(body)) => request.body(body.clone()),
            Some(body) => request.json(body),
        };

        let response = request.send().await.map_err(|source| ExecutionError::Http {
            url: config.url.clone(),
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .ok()
            .filter(|text| !text.is_empty())
            .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)));
        Err(ExecutionError::HttpStatus {
            url: config.url.clone(),
            status: status.as_u16(),
            body,
        })
    }
}
