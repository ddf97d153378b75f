//! Request entry point: guards, introspection, provider selection, and the
//! hand-off to the failover loop.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderValue, Request, StatusCode},
    response::Response,
};
use std::time::Instant;

use crate::cli_key::is_supported_cli_key;
use crate::events::{RequestEvent, RequestStartEvent};
use crate::rectifier::{self, RectifierConfig};
use crate::session::SessionAffinity;
use crate::usage::UsageMetrics;

use super::super::manager::GatewayState;
use super::super::util::{
    body_for_introspection, ensure_cli_required_headers, infer_requested_model, new_trace_id,
    now_unix_seconds, strip_hop_headers, MAX_REQUEST_BODY_BYTES,
};
use super::abort_guard::RequestAbortGuard;
use super::errors::error_response;
use super::failover::should_reuse_provider;
use super::failover_loop::{run_failover, FailoverRequest};

pub(in crate::gateway) async fn proxy_impl(
    state: GatewayState,
    cli_key: String,
    forwarded_path: String,
    req: Request<Body>,
) -> Response {
    let started = Instant::now();
    let trace_id = new_trace_id();
    let method = req.method().clone();
    let query = req.uri().query().map(str::to_string);

    if !state.registry.cli_proxy_enabled(&cli_key) {
        return error_response(
            StatusCode::FORBIDDEN,
            &trace_id,
            "GW_CLI_PROXY_DISABLED",
            format!("gateway proxying is disabled for cli_key={cli_key}"),
            0,
        );
    }

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;

    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &trace_id,
                "GW_BODY_TOO_LARGE",
                format!("request body exceeds {MAX_REQUEST_BODY_BYTES} bytes"),
                0,
            );
        }
    };

    // The decoded view is only for parsing; the original bytes go upstream.
    let introspection = body_for_introspection(&headers, &body_bytes);
    let body_json: Option<serde_json::Value> = serde_json::from_slice(&introspection).ok();
    let requested_model =
        infer_requested_model(&forwarded_path, query.as_deref(), body_json.as_ref());

    if cli_key == "claude"
        && state.settings.intercept_anthropic_warmup_requests
        && rectifier::is_anthropic_warmup_request(&forwarded_path, &introspection)
    {
        return warmup_response(
            &state,
            &trace_id,
            &cli_key,
            &method,
            &forwarded_path,
            query,
            requested_model,
            started,
        );
    }

    // count_tokens probes fire outside the conversation and would poison the
    // deterministic-fallback session id.
    let session_id = if cli_key == "claude" && forwarded_path.contains("count_tokens") {
        None
    } else {
        SessionAffinity::extract_session_id(&headers, body_json.as_ref())
    };
    let session_reuse = should_reuse_provider(body_json.as_ref());

    if !is_supported_cli_key(&cli_key) {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "GW_INVALID_CLI_KEY",
            format!("unsupported cli_key={cli_key}"),
            0,
        );
    }

    let now_unix = now_unix_seconds() as i64;

    // A live session binding pins the sort mode the conversation started
    // with, so a mode switch mid-conversation does not reshuffle it.
    let bound_mode = session_id
        .as_deref()
        .and_then(|sid| state.session.get_bound_sort_mode_id(&cli_key, sid, now_unix));
    let selection = match bound_mode {
        Some(Some(mode_id)) => crate::registry::ProviderSelection {
            sort_mode_id: Some(mode_id),
            providers: state.registry.enabled_in_mode(&cli_key, mode_id),
        },
        _ => state.registry.enabled_using_active_mode(&cli_key),
    };

    if selection.providers.is_empty() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &trace_id,
            "GW_NO_ENABLED_PROVIDER",
            format!("no enabled provider for cli_key={cli_key}"),
            0,
        );
    }

    let mut providers = selection.providers;
    let mut session_provider_id = None;
    if session_reuse {
        if let Some(sid) = session_id.as_deref() {
            if let Some(bound) = state.session.get_bound_provider(&cli_key, sid, now_unix) {
                if let Some(idx) = providers.iter().position(|p| p.id == bound) {
                    let bound_provider = providers.remove(idx);
                    providers.insert(0, bound_provider);
                    session_provider_id = Some(bound);
                }
            }
        }
    }

    state.events.emit_request_start(RequestStartEvent {
        trace_id: trace_id.clone(),
        cli_key: cli_key.clone(),
        method: method.to_string(),
        path: forwarded_path.clone(),
        query: query.clone(),
        requested_model,
        ts: now_unix,
    });

    let mut guard = RequestAbortGuard::new(
        state.events.clone(),
        trace_id.clone(),
        cli_key.clone(),
        method.to_string(),
        forwarded_path.clone(),
        query.clone(),
    );

    strip_hop_headers(&mut headers);
    ensure_cli_required_headers(&cli_key, &mut headers);
    // reqwest derives these from the target URL and body.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let rectifier = RectifierConfig::from_settings(&state.settings);
    let sort_mode_id = selection.sort_mode_id;
    let introspection_body = Bytes::from(introspection.into_owned());

    let response = run_failover(FailoverRequest {
        state,
        trace_id,
        cli_key,
        method,
        path: forwarded_path,
        query,
        headers,
        body: body_bytes,
        introspection_body,
        providers,
        sort_mode_id,
        session_id,
        session_provider_id,
        rectifier,
        started,
    })
    .await;

    guard.disarm();
    response
}

/// Claude Code fires a tiny "warmup" request at startup. Answering it
/// locally saves an upstream round trip and keeps quota untouched.
#[allow(clippy::too_many_arguments)]
fn warmup_response(
    state: &GatewayState,
    trace_id: &str,
    cli_key: &str,
    method: &axum::http::Method,
    path: &str,
    query: Option<String>,
    requested_model: Option<String>,
    started: Instant,
) -> Response {
    let now_unix = now_unix_seconds() as i64;

    state.events.emit_request_start(RequestStartEvent {
        trace_id: trace_id.to_string(),
        cli_key: cli_key.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        query: query.clone(),
        requested_model: requested_model.clone(),
        ts: now_unix,
    });
    state.events.emit_request(RequestEvent {
        trace_id: trace_id.to_string(),
        cli_key: cli_key.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        query,
        status: Some(200),
        error_category: None,
        error_code: None,
        duration_ms: started.elapsed().as_millis(),
        ttfb_ms: Some(0),
        response_model: requested_model.clone(),
        attempts: Vec::new(),
        usage: UsageMetrics::default(),
    });

    let payload = rectifier::build_warmup_response_body(requested_model.as_deref(), trace_id);
    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        builder = builder.header("x-trace-id", value);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("empty response")
    })
}
