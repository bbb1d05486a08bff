//! Failure taxonomy and classification.
//!
//! Classification is the only place that inspects raw remote error shapes.
//! Everything downstream (retry policy, pipeline bookkeeping, persisted
//! user-action errors) works from the closed [`ErrorCategory`] set and the
//! structured [`ApiError`] it produces.
//!
//! Mapping (status if present, else transport condition):
//! - 400/403/404/409/422 -> RequiresUserAction (403 carries permission info)
//! - 401 -> AuthError
//! - 429 -> TemporaryFailure (honors `Retry-After`)
//! - 500 and above -> SystemError
//! - timeout / connection refused / dns -> NetworkError
//! - anything else -> UnknownError
//!
//! Only TemporaryFailure and NetworkError are retryable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed failure category set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Terminal 4xx-class failure requiring human remediation; never retried.
    RequiresUserAction,
    AuthError,
    /// Rate-limited (429); retried after `Retry-After` when present.
    TemporaryFailure,
    SystemError,
    NetworkError,
    UnknownError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RequiresUserAction => "REQUIRES_USER_ACTION",
            ErrorCategory::AuthError => "AUTH_ERROR",
            ErrorCategory::TemporaryFailure => "TEMPORARY_FAILURE",
            ErrorCategory::SystemError => "SYSTEM_ERROR",
            ErrorCategory::NetworkError => "NETWORK_ERROR",
            ErrorCategory::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Retryable iff the failure can clear on its own.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            ErrorCategory::TemporaryFailure | ErrorCategory::NetworkError
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure condition when no HTTP status was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportCondition {
    Timeout,
    ConnectionRefused,
    DnsNotFound,
    Other,
}

/// Structured API failure carried as a value through pool and pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub message: String,
    pub can_retry: bool,
    pub user_action_required: bool,
    /// Extracted from 400/422 bodies (`errors` | `validationErrors` | `details`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    /// Extracted from 403 bodies (`permission` | `requiredPermissions`) or the
    /// `required-permission` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_info: Option<Value>,
    /// From body `userAction` | `userGuidance` or the `user-action` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action_guidance: Option<String>,
    /// Server-requested delay before the next attempt (429 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Original failure text, for traces and operator inspection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
}

impl ApiError {
    fn new(category: ErrorCategory, status_code: Option<u16>, message: String) -> Self {
        Self {
            category,
            status_code,
            message,
            can_retry: category.can_retry(),
            user_action_required: category == ErrorCategory::RequiresUserAction,
            validation_errors: None,
            permission_info: None,
            user_action_guidance: None,
            retry_after_ms: None,
            raw_error: None,
        }
    }

    /// System-level failure produced by the engine itself (pool, breaker).
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::SystemError, None, message.into())
    }

    /// Network failure without a status (timeout, refused connection, dns).
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NetworkError, None, message.into())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} ({}): {}", self.category, code, self.message),
            None => write!(f, "{}: {}", self.category, self.message),
        }
    }
}

/// Classifies a non-2xx HTTP response. Headers are expected lowercased.
pub fn classify_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &Value,
) -> ApiError {
    let category = match status {
        400 | 403 | 404 | 409 | 422 => ErrorCategory::RequiresUserAction,
        401 => ErrorCategory::AuthError,
        429 => ErrorCategory::TemporaryFailure,
        s if s >= 500 => ErrorCategory::SystemError,
        _ => ErrorCategory::UnknownError,
    };

    let mut error = ApiError::new(category, Some(status), response_message(status, headers, body));
    error.user_action_guidance = extract_guidance(headers, body);
    match status {
        400 | 422 => error.validation_errors = extract_validation_errors(body),
        403 => error.permission_info = extract_permission_info(headers, body),
        429 => {
            error.retry_after_ms = headers
                .get("retry-after")
                .and_then(|raw| parse_retry_after(raw, Utc::now()));
        }
        _ => {}
    }
    if !body.is_null() {
        error.raw_error = Some(body.to_string());
    }
    error
}

/// Classifies a failure that produced no HTTP response.
pub fn classify_transport(condition: TransportCondition, message: impl Into<String>) -> ApiError {
    let message = message.into();
    let mut error = match condition {
        TransportCondition::Timeout
        | TransportCondition::ConnectionRefused
        | TransportCondition::DnsNotFound => ApiError::network(message.clone()),
        TransportCondition::Other => {
            ApiError::new(ErrorCategory::UnknownError, None, message.clone())
        }
    };
    error.raw_error = Some(message);
    error
}

/// Human-readable failure message: the `response-description` header wins,
/// then common body shapes, then a plain status line.
fn response_message(status: u16, headers: &HashMap<String, String>, body: &Value) -> String {
    if let Some(description) = headers.get("response-description") {
        if !description.is_empty() {
            return description.clone();
        }
    }
    for path in ["message", "error", "detail"] {
        if let Some(text) = body.get(path).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    format!("HTTP {}", status)
}

fn extract_validation_errors(body: &Value) -> Option<Vec<String>> {
    for path in ["errors", "validationErrors", "details"] {
        if let Some(found) = body.get(path) {
            let items = match found {
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                Value::String(s) => vec![s.clone()],
                other => vec![other.to_string()],
            };
            if !items.is_empty() {
                return Some(items);
            }
        }
    }
    None
}

fn extract_permission_info(headers: &HashMap<String, String>, body: &Value) -> Option<Value> {
    for path in ["permission", "requiredPermissions"] {
        if let Some(found) = body.get(path) {
            if !found.is_null() {
                return Some(found.clone());
            }
        }
    }
    headers
        .get("required-permission")
        .map(|raw| Value::String(raw.clone()))
}

fn extract_guidance(headers: &HashMap<String, String>, body: &Value) -> Option<String> {
    for path in ["userAction", "userGuidance"] {
        if let Some(text) = body.get(path).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    headers.get("user-action").cloned()
}

/// Parses a `Retry-After` header value into milliseconds: either integer
/// seconds or an HTTP-date. Floors the result at one second.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.max(1) * 1000);
    }
    let parsed = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta_ms = parsed
        .with_timezone(&Utc)
        .signed_duration_since(now)
        .num_milliseconds();
    Some((delta_ms.max(1000)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        let empty = HashMap::new();
        let cases = [
            (400, ErrorCategory::RequiresUserAction),
            (401, ErrorCategory::AuthError),
            (403, ErrorCategory::RequiresUserAction),
            (404, ErrorCategory::RequiresUserAction),
            (409, ErrorCategory::RequiresUserAction),
            (422, ErrorCategory::RequiresUserAction),
            (429, ErrorCategory::TemporaryFailure),
            (500, ErrorCategory::SystemError),
            (503, ErrorCategory::SystemError),
            (418, ErrorCategory::UnknownError),
        ];
        for (status, expected) in cases {
            let classified = classify_response(status, &empty, &Value::Null);
            assert_eq!(classified.category, expected, "status {}", status);
        }
    }

    #[test]
    fn only_temporary_and_network_are_retryable() {
        let empty = HashMap::new();
        assert!(classify_response(429, &empty, &Value::Null).can_retry);
        assert!(classify_transport(TransportCondition::Timeout, "timed out").can_retry);
        assert!(!classify_response(422, &empty, &Value::Null).can_retry);
        assert!(!classify_response(500, &empty, &Value::Null).can_retry);
        assert!(!classify_transport(TransportCondition::Other, "?").can_retry);
    }

    #[test]
    fn validation_errors_extracted_from_422_body() {
        let empty = HashMap::new();
        let classified = classify_response(422, &empty, &json!({"errors": ["bad date"]}));
        assert!(classified.user_action_required);
        assert_eq!(classified.validation_errors, Some(vec!["bad date".into()]));

        let classified =
            classify_response(400, &empty, &json!({"details": [{"field": "name"}]}));
        assert_eq!(
            classified.validation_errors,
            Some(vec!["{\"field\":\"name\"}".into()])
        );
    }

    #[test]
    fn permission_info_prefers_body_over_header() {
        let hdrs = headers(&[("required-permission", "records:write")]);
        let classified = classify_response(403, &hdrs, &json!({"permission": "admin"}));
        assert_eq!(classified.permission_info, Some(json!("admin")));
        assert_eq!(classified.category, ErrorCategory::RequiresUserAction);

        let classified = classify_response(403, &hdrs, &Value::Null);
        assert_eq!(classified.permission_info, Some(json!("records:write")));
    }

    #[test]
    fn guidance_from_body_or_header() {
        let hdrs = headers(&[("user-action", "re-authenticate")]);
        let classified = classify_response(409, &hdrs, &json!({"userAction": "resolve conflict"}));
        assert_eq!(
            classified.user_action_guidance.as_deref(),
            Some("resolve conflict")
        );
        let classified = classify_response(409, &hdrs, &Value::Null);
        assert_eq!(
            classified.user_action_guidance.as_deref(),
            Some("re-authenticate")
        );
    }

    #[test]
    fn response_description_header_wins_message() {
        let hdrs = headers(&[("response-description", "member already exists")]);
        let classified = classify_response(409, &hdrs, &json!({"message": "conflict"}));
        assert_eq!(classified.message, "member already exists");
    }

    #[test]
    fn retry_after_seconds_and_http_date() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("2", now), Some(2000));
        assert_eq!(parse_retry_after("0", now), Some(1000), "floors at 1s");

        let at = (now + ChronoDuration::seconds(5)).to_rfc2822();
        let ms = parse_retry_after(&at, now).expect("parses http-date");
        assert!((4000..=6000).contains(&ms), "got {}", ms);

        let past = (now - ChronoDuration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past, now), Some(1000), "floors at 1s");
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn category_serializes_screaming_snake() {
        let serialized = serde_json::to_string(&ErrorCategory::RequiresUserAction).expect("json");
        assert_eq!(serialized, "\"REQUIRES_USER_ACTION\"");
        assert_eq!(ErrorCategory::NetworkError.as_str(), "NETWORK_ERROR");
    }
}
