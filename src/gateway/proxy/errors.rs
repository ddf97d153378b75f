//! Outcome classification and the JSON error envelope.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use serde::Serialize;

use super::failover::FailoverDecision;
use super::ErrorCategory;

/// Envelope returned for every gateway-generated error response. Upstream
/// error bodies are relayed verbatim instead.
#[derive(Debug, Serialize)]
pub(crate) struct GatewayErrorResponse {
    pub trace_id: String,
    pub error_code: String,
    pub message: String,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct OutcomeClass {
    pub category: ErrorCategory,
    pub error_code: &'static str,
    pub decision: FailoverDecision,
}

/// Classifies a non-2xx upstream status.
///
/// 401/402/403 switch provider rather than abort: credentials are
/// provider-scoped, so the next provider's key may well work. Other 4xx are
/// client-input errors that no provider can fix; the error-body scan in
/// `non_retryable` confirms before the loop gives up.
pub(super) fn classify_upstream_status(status: u16) -> OutcomeClass {
    match status {
        500..=599 => OutcomeClass {
            category: ErrorCategory::ProviderError,
            error_code: "GW_UPSTREAM_5XX",
            decision: FailoverDecision::RetrySame,
        },
        408 | 429 => OutcomeClass {
            category: ErrorCategory::ProviderError,
            error_code: "GW_UPSTREAM_RETRYABLE_STATUS",
            decision: FailoverDecision::RetrySame,
        },
        401 | 402 | 403 => OutcomeClass {
            category: ErrorCategory::ProviderError,
            error_code: "GW_UPSTREAM_AUTH_FAILED",
            decision: FailoverDecision::SwitchProvider,
        },
        404 => OutcomeClass {
            category: ErrorCategory::ResourceNotFound,
            error_code: "GW_UPSTREAM_NOT_FOUND",
            decision: FailoverDecision::SwitchProvider,
        },
        400..=499 => OutcomeClass {
            category: ErrorCategory::NonRetryableClientError,
            error_code: "GW_UPSTREAM_CLIENT_ERROR",
            decision: FailoverDecision::Abort,
        },
        // 1xx/3xx from an AI API means something between us and the backend
        // is broken; relay it without burning the provider's failure streak.
        _ => OutcomeClass {
            category: ErrorCategory::SystemError,
            error_code: "GW_UPSTREAM_UNEXPECTED_STATUS",
            decision: FailoverDecision::Abort,
        },
    }
}

/// Classifies a transport-level reqwest failure. These never produced a
/// response, so they always retry on the same provider first.
pub(super) fn classify_reqwest_error(err: &reqwest::Error) -> OutcomeClass {
    let error_code = if err.is_timeout() {
        "GW_UPSTREAM_TIMEOUT"
    } else if err.is_connect() {
        "GW_UPSTREAM_CONNECT_FAILED"
    } else {
        "GW_INTERNAL_ERROR"
    };

    OutcomeClass {
        category: ErrorCategory::SystemError,
        error_code,
        decision: FailoverDecision::RetrySame,
    }
}

pub(super) fn error_response(
    status: StatusCode,
    trace_id: &str,
    error_code: &str,
    message: String,
    attempts: usize,
) -> Response {
    error_response_with_retry_after(status, trace_id, error_code, message, attempts, None)
}

pub(super) fn error_response_with_retry_after(
    status: StatusCode,
    trace_id: &str,
    error_code: &str,
    message: String,
    attempts: usize,
    retry_after_seconds: Option<i64>,
) -> Response {
    let body = GatewayErrorResponse {
        trace_id: trace_id.to_string(),
        error_code: error_code.to_string(),
        message,
        attempts,
        retry_after_seconds,
    };
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        builder = builder.header("x-trace-id", value);
    }
    if let Some(secs) = retry_after_seconds.filter(|s| *s > 0) {
        builder = builder.header(header::RETRY_AFTER, secs);
    }

    builder
        .body(axum::body::Body::from(payload))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::empty())
                .expect("empty response")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_retry_same_provider() {
        let class = classify_upstream_status(503);
        assert_eq!(class.category, ErrorCategory::ProviderError);
        assert_eq!(class.error_code, "GW_UPSTREAM_5XX");
        assert_eq!(class.decision, FailoverDecision::RetrySame);
    }

    #[test]
    fn rate_limits_retry_same_provider() {
        for status in [408, 429] {
            let class = classify_upstream_status(status);
            assert_eq!(class.category, ErrorCategory::ProviderError);
            assert_eq!(class.decision, FailoverDecision::RetrySame);
        }
    }

    #[test]
    fn auth_failures_switch_provider() {
        for status in [401, 402, 403] {
            let class = classify_upstream_status(status);
            assert_eq!(class.category, ErrorCategory::ProviderError);
            assert_eq!(class.decision, FailoverDecision::SwitchProvider);
        }
    }

    #[test]
    fn not_found_switches_without_provider_error() {
        let class = classify_upstream_status(404);
        assert_eq!(class.category, ErrorCategory::ResourceNotFound);
        assert_eq!(class.decision, FailoverDecision::SwitchProvider);
    }

    #[test]
    fn other_client_errors_abort() {
        let class = classify_upstream_status(422);
        assert_eq!(class.category, ErrorCategory::NonRetryableClientError);
        assert_eq!(class.decision, FailoverDecision::Abort);
    }

    #[test]
    fn unexpected_status_aborts_as_system_error() {
        for status in [101, 301] {
            let class = classify_upstream_status(status);
            assert_eq!(class.category, ErrorCategory::SystemError);
            assert_eq!(class.error_code, "GW_UPSTREAM_UNEXPECTED_STATUS");
            assert_eq!(class.decision, FailoverDecision::Abort);
        }
    }

    #[test]
    fn envelope_serializes_without_null_retry_after() {
        let body = GatewayErrorResponse {
            trace_id: "t1".to_string(),
            error_code: "GW_UPSTREAM_ALL_FAILED".to_string(),
            message: "all providers failed".to_string(),
            attempts: 3,
            retry_after_seconds: None,
        };
        let json = serde_json::to_string(&body).expect("json");
        assert!(!json.contains("retry_after_seconds"));
    }

    #[test]
    fn error_response_sets_trace_and_retry_after_headers() {
        let resp = error_response_with_retry_after(
            StatusCode::SERVICE_UNAVAILABLE,
            "t1",
            "GW_ALL_PROVIDERS_UNAVAILABLE",
            "no provider available".to_string(),
            0,
            Some(42),
        );
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("x-trace-id").unwrap(), "t1");
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }
}
