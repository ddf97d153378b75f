//! The failover loop: walks the provider trial order, sends upstream with
//! the configured timeouts, classifies every outcome, and settles circuit,
//! session, and event state for the attempt that ends the request.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::events::{AttemptEvent, FailoverAttempt, RequestEvent};
use crate::rectifier::{self, RectifierConfig};
use crate::registry::Provider;
use crate::usage::{parse_model_from_json_bytes, UsageMetrics};

use super::super::manager::GatewayState;
use super::super::streams::{
    spawn_usage_sse_relay_body, FirstChunkStream, GunzipStream, StreamFinalizeCtx,
    TimingOnlyTeeStream, UsageBodyBufferTeeStream,
};
use super::super::util::{build_target_url, inject_provider_auth, now_unix_seconds};
use super::errors::{
    classify_reqwest_error, classify_upstream_status, error_response_with_retry_after,
    OutcomeClass,
};
use super::failover::{retry_backoff_delay, FailoverDecision};
use super::http_util::{
    build_response, has_gzip_content_encoding, has_non_identity_content_encoding, is_event_stream,
    maybe_gunzip_response_body_bytes_with_limit,
};
use super::non_retryable::{match_non_retryable_client_error, should_attempt_non_retryable_match};
use super::ErrorCategory;

/// Bodies at or under this size are fully buffered so the response fixer and
/// usage parser can see them; larger ones are relayed through a tee.
const MAX_BUFFERED_BODY_BYTES: usize = 2 * 1024 * 1024;

type BoxedBodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct NextFuture<'a, S: Stream + Unpin>(&'a mut S);

impl<S: Stream + Unpin> Future for NextFuture<'_, S> {
    type Output = Option<S::Item>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.0).poll_next(cx)
    }
}

pub(super) struct FailoverRequest {
    pub state: GatewayState,
    pub trace_id: String,
    pub cli_key: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Decoded view of `body` for JSON parsing; identical to `body` unless
    /// the client sent a compressed request.
    pub introspection_body: Bytes,
    pub providers: Vec<Provider>,
    pub sort_mode_id: Option<i64>,
    pub session_id: Option<String>,
    pub session_provider_id: Option<i64>,
    pub rectifier: Option<RectifierConfig>,
    pub started: Instant,
}

enum SendOutcome {
    Response(reqwest::Response),
    TimedOut,
    Error(reqwest::Error),
}

enum ErrorBody {
    /// Body was buffered for the rule scan; relay the bytes.
    Buffered(HeaderMap, Bytes),
    /// Body was never read; relay the upstream response as a stream.
    Relay(Box<reqwest::Response>),
    None,
}

struct AttemptFailure {
    class: OutcomeClass,
    status: Option<u16>,
    reason: Option<String>,
    error_body: ErrorBody,
}

pub(super) async fn run_failover(mut req: FailoverRequest) -> Response {
    let settings = req.state.settings.clone();
    let max_attempts_per_provider = settings.failover_max_attempts_per_provider.max(1);
    let max_providers = settings.failover_max_providers_to_try.max(1) as usize;

    let first_byte_timeout = seconds_timeout(settings.upstream_first_byte_timeout_seconds);
    let idle_timeout = seconds_timeout(settings.upstream_stream_idle_timeout_seconds);
    let total_timeout =
        seconds_timeout(settings.upstream_request_timeout_non_streaming_seconds);
    let cooldown_secs = i64::from(settings.provider_cooldown_seconds);

    let mut attempts: Vec<FailoverAttempt> = Vec::new();
    let mut attempt_counter: u32 = 0;
    let mut last_failure: Option<(ErrorCategory, &'static str)> = None;
    let mut skipped_open: u32 = 0;
    let mut skipped_cooldown: u32 = 0;
    let mut earliest_available_unix: Option<i64> = None;
    // One replay per request after stripping thinking signatures.
    let mut thinking_retried = false;

    let providers = std::mem::take(&mut req.providers);
    for (provider_index, provider) in providers.iter().take(max_providers).enumerate() {
        let gate_base_url = provider.primary_base_url();
        let provider_name = provider.display_name();
        let session_reuse = req
            .session_provider_id
            .map(|bound| bound == provider.id);

        // Circuit gate. A stale OPEN expires here; an active OPEN or cooldown
        // skips the provider without an attempt.
        let now_unix = now_unix_seconds() as i64;
        let check = req
            .state
            .circuit
            .should_allow(&req.cli_key, provider.id, now_unix);
        if let Some(t) = &check.transition {
            req.state.events.emit_circuit_transition(
                &req.trace_id,
                &req.cli_key,
                provider.id,
                &provider_name,
                &gate_base_url,
                t,
                now_unix,
            );
        }
        if !check.allow {
            let snap = &check.after;
            let (reason, until) = if snap.state == crate::circuit::CircuitState::Open {
                skipped_open += 1;
                ("SKIP_OPEN", snap.open_until)
            } else {
                skipped_cooldown += 1;
                ("SKIP_COOLDOWN", snap.cooldown_until)
            };
            if let Some(until) = until.filter(|t| *t > now_unix) {
                earliest_available_unix =
                    Some(earliest_available_unix.map_or(until, |cur: i64| cur.min(until)));
            }
            req.state.events.emit_circuit_skip(
                &req.trace_id,
                &req.cli_key,
                provider.id,
                &provider_name,
                &gate_base_url,
                snap.state,
                snap,
                reason,
                now_unix,
            );
            continue;
        }

        let mut retry_index: u32 = 0;
        loop {
            // Retries walk the provider's configured URLs in order.
            let base_url = provider.base_url_for_retry(retry_index);
            attempt_counter += 1;
            let attempt_started = Instant::now();
            let attempt_started_ms = req.started.elapsed().as_millis();

            emit_attempt_event(
                &req,
                attempt_counter,
                provider,
                &provider_name,
                &base_url,
                session_reuse,
                "started",
                None,
                attempt_started_ms,
                0,
            );

            let outcome = send_upstream(&req, &base_url, &provider.api_key, first_byte_timeout)
                .await;

            let failure = match outcome {
                Ok(SendOutcome::Response(resp)) => {
                    let status = resp.status().as_u16();
                    if (200..300).contains(&status) {
                        let duration = attempt_started.elapsed().as_millis();
                        emit_attempt_event(
                            &req,
                            attempt_counter,
                            provider,
                            &provider_name,
                            &base_url,
                            session_reuse,
                            "success",
                            Some(status),
                            attempt_started_ms,
                            duration,
                        );
                        attempts.push(attempt_record(
                            provider,
                            &provider_name,
                            &base_url,
                            "success",
                            Some(status),
                            provider_index as u32,
                            retry_index,
                            session_reuse,
                            None,
                            None,
                            attempt_started_ms,
                            duration,
                        ));

                        return handle_success(
                            &req,
                            provider,
                            &provider_name,
                            &base_url,
                            resp,
                            attempts,
                            idle_timeout,
                            total_timeout,
                            cooldown_secs,
                        )
                        .await;
                    }

                    classify_error_response(status, resp).await
                }
                Ok(SendOutcome::TimedOut) => AttemptFailure {
                    class: OutcomeClass {
                        category: ErrorCategory::SystemError,
                        error_code: "GW_UPSTREAM_TIMEOUT",
                        decision: FailoverDecision::RetrySame,
                    },
                    status: None,
                    reason: Some("first byte timeout".to_string()),
                    error_body: ErrorBody::None,
                },
                Ok(SendOutcome::Error(err)) => AttemptFailure {
                    class: classify_reqwest_error(&err),
                    status: None,
                    reason: Some(err.to_string()),
                    error_body: ErrorBody::None,
                },
                Err(invalid_url) => AttemptFailure {
                    class: OutcomeClass {
                        category: ErrorCategory::SystemError,
                        error_code: "GW_INVALID_BASE_URL",
                        decision: FailoverDecision::SwitchProvider,
                    },
                    status: None,
                    reason: Some(invalid_url),
                    error_body: ErrorBody::None,
                },
            };

            let attempt_duration = attempt_started.elapsed().as_millis();
            let now_unix = now_unix_seconds() as i64;

            // A 400 naming thinking-block signatures usually means the
            // conversation carries signatures minted by another provider.
            // Strip them and replay once on the same provider.
            let mut stripped_retry = false;
            if !thinking_retried
                && req.cli_key == "claude"
                && settings.enable_thinking_signature_rectifier
                && failure.status == Some(400)
            {
                if let ErrorBody::Buffered(_, error_bytes) = &failure.error_body {
                    stripped_retry = try_strip_thinking_signatures(&mut req, error_bytes);
                    thinking_retried = stripped_retry;
                }
            }

            let mut decision = failure.class.decision;
            if stripped_retry {
                decision = FailoverDecision::RetrySame;
            } else if decision == FailoverDecision::RetrySame
                && retry_index + 1 >= max_attempts_per_provider
            {
                decision = FailoverDecision::SwitchProvider;
            }

            let mut circuit_after = None;
            if failure.class.category == ErrorCategory::ProviderError {
                let change = req
                    .state
                    .circuit
                    .record_failure(&req.cli_key, provider.id, now_unix);
                if let Some(t) = &change.transition {
                    req.state.events.emit_circuit_transition(
                        &req.trace_id,
                        &req.cli_key,
                        provider.id,
                        &provider_name,
                        &base_url,
                        t,
                        now_unix,
                    );
                }
                // The circuit opening overrides any retry budget left.
                if change.after.state == crate::circuit::CircuitState::Open {
                    decision = FailoverDecision::SwitchProvider;
                }
                circuit_after = Some(change.after);
            }

            if decision == FailoverDecision::SwitchProvider
                && failure.class.category == ErrorCategory::ProviderError
                && cooldown_secs > 0
            {
                req.state
                    .circuit
                    .trigger_cooldown(&req.cli_key, provider.id, now_unix, cooldown_secs);
            }

            emit_attempt_event(
                &req,
                attempt_counter,
                provider,
                &provider_name,
                &base_url,
                session_reuse,
                "failed",
                failure.status,
                attempt_started_ms,
                attempt_duration,
            );
            let mut record = attempt_record(
                provider,
                &provider_name,
                &base_url,
                "failed",
                failure.status,
                provider_index as u32,
                retry_index,
                session_reuse,
                Some(failure.class.category.as_str()),
                Some(failure.class.error_code),
                attempt_started_ms,
                attempt_duration,
            );
            record.decision = Some(decision.as_str());
            record.reason = failure.reason.clone();
            if let Some(snap) = &circuit_after {
                record.circuit_state_after = Some(snap.state.as_str());
                record.circuit_failure_count = Some(snap.failure_count);
                record.circuit_failure_threshold = Some(snap.failure_threshold);
            }
            attempts.push(record);
            last_failure = Some((failure.class.category, failure.class.error_code));

            match decision {
                FailoverDecision::Abort => {
                    return relay_aborted_error(
                        &req,
                        provider,
                        &provider_name,
                        &base_url,
                        failure,
                        attempts,
                        cooldown_secs,
                    );
                }
                FailoverDecision::SwitchProvider => break,
                FailoverDecision::RetrySame => {
                    retry_index += 1;
                    if let Some(status) = failure.status {
                        if let Some(delay) = retry_backoff_delay(status, retry_index) {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    exhaustion_response(
        &req,
        attempts,
        last_failure,
        skipped_open,
        skipped_cooldown,
        earliest_available_unix,
    )
}

fn seconds_timeout(seconds: u32) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(u64::from(seconds)))
}

/// Builds the target URL and issues the request, bounded by the first-byte
/// timeout. The outer `Err` is an unusable base URL.
async fn send_upstream(
    req: &FailoverRequest,
    base_url: &str,
    api_key: &str,
    first_byte_timeout: Option<Duration>,
) -> Result<SendOutcome, String> {
    let url = build_target_url(base_url, &req.path, req.query.as_deref())?;

    let mut headers = req.headers.clone();
    inject_provider_auth(&req.cli_key, api_key, &mut headers);

    let send = req
        .state
        .client
        .request(req.method.clone(), url)
        .headers(headers)
        .body(req.body.clone())
        .send();

    let result = match first_byte_timeout {
        Some(limit) => match tokio::time::timeout(limit, send).await {
            Ok(result) => result,
            Err(_) => return Ok(SendOutcome::TimedOut),
        },
        None => send.await,
    };

    Ok(match result {
        Ok(resp) => SendOutcome::Response(resp),
        Err(err) => SendOutcome::Error(err),
    })
}

/// Parses the buffered 400 body and, when it names a thinking-signature
/// problem, rewrites the request body without signatures. Returns whether
/// the request changed and is worth replaying.
fn try_strip_thinking_signatures(req: &mut FailoverRequest, error_body: &[u8]) -> bool {
    let message = String::from_utf8_lossy(error_body);
    let Some(trigger) = rectifier::detect_thinking_signature_trigger(&message) else {
        return false;
    };

    let Ok(mut root) = serde_json::from_slice::<serde_json::Value>(&req.introspection_body) else {
        return false;
    };
    let outcome = rectifier::strip_thinking_signatures(&mut root);
    if !outcome.applied {
        return false;
    }
    let Ok(rewritten) = serde_json::to_vec(&root) else {
        return false;
    };

    tracing::debug!(
        trace_id = %req.trace_id,
        trigger,
        removed_thinking_blocks = outcome.removed_thinking_blocks,
        removed_redacted_thinking_blocks = outcome.removed_redacted_thinking_blocks,
        removed_signature_fields = outcome.removed_signature_fields,
        removed_top_level_thinking = outcome.removed_top_level_thinking,
        "replaying request without thinking signatures"
    );

    req.body = Bytes::from(rewritten);
    // The rewritten body is plain JSON even when the client sent gzip.
    req.headers.remove(header::CONTENT_ENCODING);
    req.introspection_body = req.body.clone();
    true
}

/// Status classification plus the error-body scan for scannable 4xx. The
/// scan buffers the body (decompressed when gzip), so it is handed back for
/// relaying on abort.
async fn classify_error_response(status: u16, resp: reqwest::Response) -> AttemptFailure {
    let mut class = classify_upstream_status(status);
    let mut headers = resp.headers().clone();

    if should_attempt_non_retryable_match(status, resp.content_length()) {
        let body = resp.bytes().await.unwrap_or_default();
        let body =
            maybe_gunzip_response_body_bytes_with_limit(body, &mut headers, MAX_BUFFERED_BODY_BYTES);
        let reason = match_non_retryable_client_error(status, &body);
        if reason.is_some() {
            class = OutcomeClass {
                category: ErrorCategory::NonRetryableClientError,
                error_code: "GW_UPSTREAM_CLIENT_ERROR",
                decision: FailoverDecision::Abort,
            };
        }
        return AttemptFailure {
            class,
            status: Some(status),
            reason: reason.map(str::to_string),
            error_body: ErrorBody::Buffered(headers, body),
        };
    }

    let error_body = if class.decision == FailoverDecision::Abort {
        ErrorBody::Relay(Box::new(resp))
    } else {
        ErrorBody::None
    };

    AttemptFailure {
        class,
        status: Some(status),
        reason: None,
        error_body,
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_attempt_event(
    req: &FailoverRequest,
    attempt_index: u32,
    provider: &Provider,
    provider_name: &str,
    base_url: &str,
    session_reuse: Option<bool>,
    outcome: &str,
    status: Option<u16>,
    attempt_started_ms: u128,
    attempt_duration_ms: u128,
) {
    req.state.events.emit_attempt(AttemptEvent {
        trace_id: req.trace_id.clone(),
        cli_key: req.cli_key.clone(),
        method: req.method.to_string(),
        path: req.path.clone(),
        query: req.query.clone(),
        attempt_index,
        provider_id: provider.id,
        provider_name: provider_name.to_string(),
        base_url: base_url.to_string(),
        session_reuse,
        outcome: outcome.to_string(),
        status,
        attempt_started_ms,
        attempt_duration_ms,
        circuit_state_before: None,
        circuit_state_after: None,
        circuit_failure_count: None,
        circuit_failure_threshold: None,
    });
}

#[allow(clippy::too_many_arguments)]
fn attempt_record(
    provider: &Provider,
    provider_name: &str,
    base_url: &str,
    outcome: &str,
    status: Option<u16>,
    provider_index: u32,
    retry_index: u32,
    session_reuse: Option<bool>,
    error_category: Option<&'static str>,
    error_code: Option<&'static str>,
    attempt_started_ms: u128,
    attempt_duration_ms: u128,
) -> FailoverAttempt {
    FailoverAttempt {
        provider_id: provider.id,
        provider_name: provider_name.to_string(),
        base_url: base_url.to_string(),
        outcome: outcome.to_string(),
        status,
        provider_index: Some(provider_index),
        retry_index: Some(retry_index),
        session_reuse,
        error_category,
        error_code,
        decision: None,
        reason: None,
        attempt_started_ms: Some(attempt_started_ms),
        attempt_duration_ms: Some(attempt_duration_ms),
        circuit_state_before: None,
        circuit_state_after: None,
        circuit_failure_count: None,
        circuit_failure_threshold: None,
    }
}

#[allow(clippy::too_many_arguments)]
fn finalize_ctx(
    req: &FailoverRequest,
    provider: &Provider,
    provider_name: &str,
    base_url: &str,
    status: u16,
    error_category: Option<&'static str>,
    attempts: Vec<FailoverAttempt>,
    cooldown_secs: i64,
) -> StreamFinalizeCtx {
    StreamFinalizeCtx {
        events: req.state.events.clone(),
        circuit: req.state.circuit.clone(),
        session: req.state.session.clone(),
        session_id: req.session_id.clone(),
        sort_mode_id: req.sort_mode_id,
        trace_id: req.trace_id.clone(),
        cli_key: req.cli_key.clone(),
        method: req.method.to_string(),
        path: req.path.clone(),
        query: req.query.clone(),
        status,
        error_category,
        error_code: None,
        started: req.started,
        attempts,
        provider_cooldown_secs: cooldown_secs,
        provider_id: provider.id,
        provider_name: provider_name.to_string(),
        base_url: base_url.to_string(),
    }
}

/// 2xx handling: event streams relay through the SSE tee; non-stream bodies
/// are buffered (small) or relayed through a usage/timing tee (large).
#[allow(clippy::too_many_arguments)]
async fn handle_success(
    req: &FailoverRequest,
    provider: &Provider,
    provider_name: &str,
    base_url: &str,
    resp: reqwest::Response,
    attempts: Vec<FailoverAttempt>,
    idle_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    cooldown_secs: i64,
) -> Response {
    let status = resp.status().as_u16();
    let mut headers = resp.headers().clone();
    let headers_ttfb_ms = req.started.elapsed().as_millis();

    if is_event_stream(&headers) {
        let gzip = has_gzip_content_encoding(&headers);
        if gzip {
            // The usage tracker needs plaintext SSE; relay decompressed.
            headers.remove(header::CONTENT_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
        }

        let mut stream: BoxedBodyStream = if gzip {
            Box::pin(GunzipStream::new(Box::pin(resp.bytes_stream())))
        } else {
            Box::pin(resp.bytes_stream())
        };

        // Probe the first chunk under the first-byte timeout so a provider
        // that sends headers and then stalls is still caught before any
        // bytes reach the client.
        let first_byte_timeout =
            seconds_timeout(req.state.settings.upstream_first_byte_timeout_seconds);
        let probe = match first_byte_timeout {
            Some(limit) => match tokio::time::timeout(limit, NextFuture(&mut stream)).await {
                Ok(item) => item,
                Err(_) => {
                    let ctx = finalize_ctx(
                        req,
                        provider,
                        provider_name,
                        base_url,
                        status,
                        Some(ErrorCategory::SystemError.as_str()),
                        attempts,
                        cooldown_secs,
                    );
                    ctx.finalize_request(Some("GW_UPSTREAM_TIMEOUT"), None, None, None);
                    return error_response_with_retry_after(
                        StatusCode::GATEWAY_TIMEOUT,
                        &req.trace_id,
                        "GW_UPSTREAM_TIMEOUT",
                        format!("upstream stalled before first byte for cli_key={}", req.cli_key),
                        ctx.attempts.len(),
                        None,
                    );
                }
            },
            None => NextFuture(&mut stream).await,
        };

        let first = match probe {
            Some(Ok(chunk)) => Some(chunk),
            None => None,
            Some(Err(err)) => {
                let ctx = finalize_ctx(
                    req,
                    provider,
                    provider_name,
                    base_url,
                    status,
                    Some(ErrorCategory::ProviderError.as_str()),
                    attempts,
                    cooldown_secs,
                );
                ctx.finalize_request(Some("GW_STREAM_ERROR"), None, None, None);
                tracing::debug!(trace_id = %req.trace_id, %err, "stream failed at first chunk");
                return error_response_with_retry_after(
                    StatusCode::BAD_GATEWAY,
                    &req.trace_id,
                    "GW_STREAM_ERROR",
                    format!("upstream stream failed for cli_key={}", req.cli_key),
                    ctx.attempts.len(),
                    None,
                );
            }
        };
        let ttfb_ms = req.started.elapsed().as_millis();

        let ctx = finalize_ctx(
            req,
            provider,
            provider_name,
            base_url,
            status,
            None,
            attempts,
            cooldown_secs,
        );
        let body = spawn_usage_sse_relay_body(
            FirstChunkStream::new(first, stream),
            ctx,
            idle_timeout,
            Some(ttfb_ms),
        );
        return build_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            &headers,
            &req.trace_id,
            body,
        );
    }

    let content_length = resp.content_length();
    let buffer = match content_length {
        Some(len) if len as usize <= MAX_BUFFERED_BODY_BYTES => true,
        Some(_) => false,
        // Unknown length: relay through the buffering tee, which gives up
        // on usage extraction past the cap instead of unbounded buffering.
        None => {
            let ctx = finalize_ctx(
                req,
                provider,
                provider_name,
                base_url,
                status,
                None,
                attempts,
                cooldown_secs,
            );
            let tee = UsageBodyBufferTeeStream::new(
                Box::pin(resp.bytes_stream()) as BoxedBodyStream,
                ctx,
                MAX_BUFFERED_BODY_BYTES,
                total_timeout,
            );
            return build_response(
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                &headers,
                &req.trace_id,
                Body::from_stream(tee),
            );
        }
    };

    if !buffer {
        let ctx = finalize_ctx(
            req,
            provider,
            provider_name,
            base_url,
            status,
            None,
            attempts,
            cooldown_secs,
        );
        let tee = TimingOnlyTeeStream::new(
            Box::pin(resp.bytes_stream()) as BoxedBodyStream,
            ctx,
            total_timeout,
        );
        return build_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            &headers,
            &req.trace_id,
            Body::from_stream(tee),
        );
    }

    // Small known-length body: buffer under the remaining total timeout.
    let body_result = match total_timeout {
        Some(total) => match total.checked_sub(req.started.elapsed()) {
            Some(limit) => match tokio::time::timeout(limit, resp.bytes()).await {
                Ok(result) => result.map_err(|e| ("GW_UPSTREAM_READ_ERROR", e.to_string())),
                Err(_) => Err(("GW_UPSTREAM_TIMEOUT", "total timeout elapsed".to_string())),
            },
            None => Err(("GW_UPSTREAM_TIMEOUT", "total timeout elapsed".to_string())),
        },
        None => resp
            .bytes()
            .await
            .map_err(|e| ("GW_UPSTREAM_READ_ERROR", e.to_string())),
    };

    let ctx = finalize_ctx(
        req,
        provider,
        provider_name,
        base_url,
        status,
        None,
        attempts,
        cooldown_secs,
    );

    match body_result {
        Ok(bytes) => {
            let mut body = maybe_gunzip_response_body_bytes_with_limit(
                bytes,
                &mut headers,
                MAX_BUFFERED_BODY_BYTES,
            );

            if let Some(config) = &req.rectifier {
                if !has_non_identity_content_encoding(&headers) {
                    let outcome = rectifier::rectify_json_body(body, config);
                    headers.remove(header::CONTENT_LENGTH);
                    if let Ok(value) = outcome.header_value().parse() {
                        headers.insert(rectifier::RECTIFIER_HEADER, value);
                    }
                    body = outcome.body;
                }
            }

            let usage = UsageMetrics::from_json_bytes(&body);
            let response_model = parse_model_from_json_bytes(&body);
            ctx.finalize_request(None, Some(headers_ttfb_ms), usage, response_model);

            headers.remove(header::CONTENT_LENGTH);
            build_response(
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                &headers,
                &req.trace_id,
                Body::from(body),
            )
        }
        Err((code, detail)) => {
            tracing::debug!(trace_id = %req.trace_id, %detail, "buffered body read failed");
            ctx.finalize_request(Some(code), Some(headers_ttfb_ms), None, None);
            error_response_with_retry_after(
                StatusCode::BAD_GATEWAY,
                &req.trace_id,
                code,
                format!("upstream body read failed for cli_key={}", req.cli_key),
                ctx.attempts.len(),
                None,
            )
        }
    }
}

/// Abort path: the upstream error response is relayed to the client as-is.
fn relay_aborted_error(
    req: &FailoverRequest,
    provider: &Provider,
    provider_name: &str,
    base_url: &str,
    failure: AttemptFailure,
    attempts: Vec<FailoverAttempt>,
    cooldown_secs: i64,
) -> Response {
    let status = failure.status.unwrap_or(502);
    let http_status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut ctx = finalize_ctx(
        req,
        provider,
        provider_name,
        base_url,
        status,
        Some(failure.class.category.as_str()),
        attempts,
        cooldown_secs,
    );
    ctx.error_code = Some(failure.class.error_code);
    // Aborts are client-input or plumbing errors, not provider health
    // signals; the finalize path must not cool the provider down.
    ctx.provider_cooldown_secs = 0;

    match failure.error_body {
        ErrorBody::Buffered(mut headers, body) => {
            headers.remove(header::CONTENT_LENGTH);
            ctx.finalize_request(
                Some(failure.class.error_code),
                Some(req.started.elapsed().as_millis()),
                None,
                None,
            );
            build_response(http_status, &headers, &req.trace_id, Body::from(body))
        }
        ErrorBody::Relay(resp) => {
            let headers = resp.headers().clone();
            let tee = TimingOnlyTeeStream::new(
                Box::pin(resp.bytes_stream()) as BoxedBodyStream,
                ctx,
                None,
            );
            build_response(http_status, &headers, &req.trace_id, Body::from_stream(tee))
        }
        ErrorBody::None => {
            ctx.finalize_request(
                Some(failure.class.error_code),
                Some(req.started.elapsed().as_millis()),
                None,
                None,
            );
            error_response_with_retry_after(
                http_status,
                &req.trace_id,
                failure.class.error_code,
                format!("upstream request failed for cli_key={}", req.cli_key),
                ctx.attempts.len(),
                None,
            )
        }
    }
}

fn exhaustion_response(
    req: &FailoverRequest,
    attempts: Vec<FailoverAttempt>,
    last_failure: Option<(ErrorCategory, &'static str)>,
    skipped_open: u32,
    skipped_cooldown: u32,
    earliest_available_unix: Option<i64>,
) -> Response {
    let now_unix = now_unix_seconds() as i64;

    let (status, error_code, message, retry_after) = if attempts.is_empty() {
        let retry_after = earliest_available_unix
            .map(|t| (t - now_unix).max(1))
            .filter(|s| *s > 0);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "GW_ALL_PROVIDERS_UNAVAILABLE",
            format!(
                "no provider available (skipped: open={}, cooldown={}) for cli_key={}",
                skipped_open, skipped_cooldown, req.cli_key
            ),
            retry_after,
        )
    } else {
        (
            StatusCode::BAD_GATEWAY,
            last_failure
                .map(|(_, code)| code)
                .unwrap_or("GW_UPSTREAM_ALL_FAILED"),
            format!("all providers failed for cli_key={}", req.cli_key),
            None,
        )
    };

    let error_category = last_failure
        .map(|(category, _)| category)
        .unwrap_or(ErrorCategory::ProviderError);

    req.state.events.emit_request(RequestEvent {
        trace_id: req.trace_id.clone(),
        cli_key: req.cli_key.clone(),
        method: req.method.to_string(),
        path: req.path.clone(),
        query: req.query.clone(),
        status: Some(status.as_u16()),
        error_category: Some(error_category.as_str()),
        error_code: Some(error_code),
        duration_ms: req.started.elapsed().as_millis(),
        ttfb_ms: None,
        response_model: None,
        attempts: attempts.clone(),
        usage: UsageMetrics::default(),
    });

    error_response_with_retry_after(
        status,
        &req.trace_id,
        error_code,
        message,
        attempts.len(),
        retry_after,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
    use crate::config::ConfigFile;
    use crate::events::EventBus;
    use crate::registry::ProviderRegistry;
    use crate::session::SessionAffinity;
    use std::sync::Arc;

    fn request(body: serde_json::Value) -> FailoverRequest {
        let config = ConfigFile::default();
        let mut settings = config.settings.clone();
        settings.enable_thinking_signature_rectifier = true;
        let bytes = Bytes::from(serde_json::to_vec(&body).expect("body"));
        FailoverRequest {
            state: GatewayState {
                client: reqwest::Client::new(),
                circuit: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                    &settings,
                ))),
                settings: Arc::new(settings),
                registry: Arc::new(ProviderRegistry::from_config(&config)),
                session: Arc::new(SessionAffinity::new()),
                events: EventBus::new(),
            },
            trace_id: "t1".to_string(),
            cli_key: "claude".to_string(),
            method: Method::POST,
            path: "/v1/messages".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: bytes.clone(),
            introspection_body: bytes,
            providers: Vec::new(),
            sort_mode_id: None,
            session_id: None,
            session_provider_id: None,
            rectifier: None,
            started: Instant::now(),
        }
    }

    #[tokio::test]
    async fn matching_400_strips_signatures_and_rewrites_request() {
        let mut req = request(serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "t", "signature": "sig" },
                    { "type": "text", "text": "hi" }
                ]
            }]
        }));
        // The original request may have been gzip-encoded; the rewrite is not.
        req.headers
            .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let error = br#"{"error":{"message":"Invalid `signature` in `thinking` block"}}"#;
        assert!(try_strip_thinking_signatures(&mut req, error));

        let rewritten: serde_json::Value = serde_json::from_slice(&req.body).expect("json");
        let content = rewritten["messages"][0]["content"].as_array().expect("array");
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "text");
        assert!(req.headers.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(req.introspection_body, req.body);
    }

    #[tokio::test]
    async fn unrelated_400_body_leaves_request_untouched() {
        let mut req = request(serde_json::json!({
            "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hi" }] }]
        }));
        let before = req.body.clone();

        assert!(!try_strip_thinking_signatures(&mut req, b"upstream overloaded"));
        assert_eq!(req.body, before);
    }

    #[tokio::test]
    async fn signature_free_request_is_not_replayed() {
        // The trigger matches but there is nothing to strip, so replaying
        // would just repeat the same 400.
        let mut req = request(serde_json::json!({
            "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hi" }] }]
        }));

        let error = br#"{"error":{"message":"Invalid `signature` in `thinking` block"}}"#;
        assert!(!try_strip_thinking_signatures(&mut req, error));
    }
}
