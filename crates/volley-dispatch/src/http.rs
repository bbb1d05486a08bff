//! Single outbound HTTP request execution.
//!
//! [`HttpExecute`] is the seam between the pipeline and the network: the
//! production implementation wraps `reqwest`, tests script responses. The
//! contract lowers failures structurally: 2xx/4xx come back as
//! [`ApiResponse`] (so the pipeline can classify 4xx), while 5xx and
//! transport failures come back as [`HttpFailure`]. Duration is measured on
//! every path, including failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::time::Instant;
use volley_core::{classify_response, classify_transport, ApiError, TransportCondition};

/// Base per-attempt timeout, grown by 5s per retry and capped at 30s.
pub fn attempt_timeout(attempt: u32) -> Duration {
    let secs = 10 + 5 * u64::from(attempt.saturating_sub(1));
    Duration::from_secs(secs.min(30))
}

/// One outbound request, fully resolved.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub timeout: Duration,
}

/// A response the remote actually produced (status < 500).
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub duration_ms: u64,
}

/// A failed execution: transport-level, or a 5xx lowered to a failure.
#[derive(Clone, Debug)]
pub struct HttpFailure {
    /// Present when no HTTP response was produced.
    pub condition: Option<TransportCondition>,
    pub status: Option<u16>,
    pub message: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub duration_ms: u64,
}

impl HttpFailure {
    pub fn into_api_error(&self) -> ApiError {
        match self.status {
            Some(status) => classify_response(status, &self.headers, &self.body),
            None => classify_transport(
                self.condition.unwrap_or(TransportCondition::Other),
                self.message.clone(),
            ),
        }
    }
}

/// Executes one outbound request.
#[async_trait]
pub trait HttpExecute: Send + Sync {
    async fn execute(&self, request: &OutboundRequest) -> Result<ApiResponse, HttpFailure>;
}

/// Production executor over a shared `reqwest` client.
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    /// Builds the shared client. Timeouts are per-request, not client-wide.
    pub fn new() -> Result<Self, volley_core::DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent("POC-Excel-Formatter/1.0")
            .build()
            .map_err(|e| volley_core::DispatchError::Http(format!("client build: {}", e)))?;
        Ok(Self { client })
    }
}

fn lower_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn transport_condition(error: &reqwest::Error) -> TransportCondition {
    if error.is_timeout() {
        return TransportCondition::Timeout;
    }
    let text = format!("{:?}", error).to_ascii_lowercase();
    if text.contains("dns") {
        TransportCondition::DnsNotFound
    } else if error.is_connect() {
        TransportCondition::ConnectionRefused
    } else {
        TransportCondition::Other
    }
}

#[async_trait]
impl HttpExecute for ReqwestExecutor {
    async fn execute(&self, request: &OutboundRequest) -> Result<ApiResponse, HttpFailure> {
        let started = Instant::now();
        let fail = |condition: Option<TransportCondition>,
                    status: Option<u16>,
                    message: String,
                    headers: HashMap<String, String>,
                    body: Value,
                    started: Instant| HttpFailure {
            condition,
            status,
            message,
            headers,
            body,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            fail(
                Some(TransportCondition::Other),
                None,
                format!("invalid method {:?}: {}", request.method, e),
                HashMap::new(),
                Value::Null,
                started,
            )
        })?;
        let mut header_map = HeaderMap::new();
        for (name, value) in &request.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            header_map.insert(name, value);
        }

        let sent = self
            .client
            .request(method, &request.url)
            .headers(header_map)
            .json(&request.body)
            .timeout(request.timeout)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                return Err(fail(
                    Some(transport_condition(&e)),
                    e.status().map(|s| s.as_u16()),
                    e.to_string(),
                    HashMap::new(),
                    Value::Null,
                    started,
                ));
            }
        };

        let status = response.status().as_u16();
        let headers = lower_headers(response.headers());
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Err(fail(
                    Some(TransportCondition::Other),
                    Some(status),
                    format!("body read failed: {}", e),
                    headers,
                    Value::Null,
                    started,
                ));
            }
        };
        let body: Value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if status >= 500 {
            return Err(HttpFailure {
                condition: None,
                status: Some(status),
                message: format!("HTTP {}", status),
                headers,
                body,
                duration_ms,
            });
        }
        Ok(ApiResponse {
            status,
            headers,
            body,
            duration_ms,
        })
    }
}
