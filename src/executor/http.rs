use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;

use super::{WorkExecutor, WorkRequest};
use crate::error::ExecutionError;

const ACCEPT: &str = "application/sparql-results+json, application/json;q=0.9, */*;q=0.1";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_ERROR_BODY: usize = 512;

/// Sends each payload to a query endpoint over HTTP.
///
/// String payloads are posted as a form field (`query=<payload>` by default,
/// the SPARQL protocol convention); structured payloads are posted as JSON.
/// Responses that are not JSON come back as a JSON string.
pub struct HttpExecutor {
    client: Client,
    endpoint: String,
    query_param: String,
}

impl HttpExecutor {
    /// Executor with a default client (10s connect timeout, fanout user agent).
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Use a preconfigured client (proxies, TLS roots, default headers).
    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            query_param: "query".to_string(),
        }
    }

    /// Form field that carries string payloads.
    pub fn with_query_param(mut self, name: impl Into<String>) -> Self {
        self.query_param = name.into();
        self
    }
}

#[async_trait]
impl WorkExecutor for HttpExecutor {
    async fn execute(&self, request: &WorkRequest) -> Result<Value, ExecutionError> {
        let remaining = request.remaining();
        if remaining.is_zero() {
            return Err(ExecutionError::deadline_exceeded(remaining));
        }

        let builder = self
            .client
            .post(&self.endpoint)
            .header(header::ACCEPT, ACCEPT)
            .timeout(remaining);
        let builder = match &request.payload {
            Value::String(query) => builder.form(&[(self.query_param.as_str(), query.as_str())]),
            structured => builder.json(structured),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(e, remaining))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(ExecutionError::rate_limited(retry_after));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status.as_u16(), truncate(&body));
            return Err(if is_transient_status(status) {
                ExecutionError::transient(message)
            } else {
                ExecutionError::permanent(message)
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(e, remaining))?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> ExecutionError {
    if err.is_timeout() {
        ExecutionError::deadline_exceeded(timeout)
    } else if err.is_builder() {
        ExecutionError::permanent(format!("invalid request: {err}"))
    } else {
        // Connect failures, resets and truncated bodies.
        ExecutionError::transient(format!("network error: {err}"))
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
