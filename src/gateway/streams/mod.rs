//! Response relay adapters.
//!
//! A response body outlives the proxy handler, so circuit/session accounting
//! and the terminal request event are owned by a tee stream wrapped around
//! the upstream body. Each tee finalizes exactly once, including when the
//! client drops the connection mid-body.

mod gunzip;
mod relay;
mod timing;
mod usage_tee;

pub(super) use gunzip::GunzipStream;
pub(super) use relay::FirstChunkStream;
pub(super) use timing::TimingOnlyTeeStream;
pub(super) use usage_tee::{spawn_usage_sse_relay_body, UsageBodyBufferTeeStream};

use std::sync::Arc;
use std::time::Instant;

use crate::circuit::CircuitBreaker;
use crate::events::{EventBus, FailoverAttempt, RequestEvent};
use crate::session::SessionAffinity;
use crate::usage::UsageMetrics;

use super::proxy::ErrorCategory;
use super::util::now_unix_seconds;

/// Everything a tee needs to settle the request after the handler returned.
pub(in crate::gateway) struct StreamFinalizeCtx {
    pub(in crate::gateway) events: EventBus,
    pub(in crate::gateway) circuit: Arc<CircuitBreaker>,
    pub(in crate::gateway) session: Arc<SessionAffinity>,
    pub(in crate::gateway) session_id: Option<String>,
    pub(in crate::gateway) sort_mode_id: Option<i64>,
    pub(in crate::gateway) trace_id: String,
    pub(in crate::gateway) cli_key: String,
    pub(in crate::gateway) method: String,
    pub(in crate::gateway) path: String,
    pub(in crate::gateway) query: Option<String>,
    pub(in crate::gateway) status: u16,
    pub(in crate::gateway) error_category: Option<&'static str>,
    pub(in crate::gateway) error_code: Option<&'static str>,
    pub(in crate::gateway) started: Instant,
    pub(in crate::gateway) attempts: Vec<FailoverAttempt>,
    pub(in crate::gateway) provider_cooldown_secs: i64,
    pub(in crate::gateway) provider_id: i64,
    pub(in crate::gateway) provider_name: String,
    pub(in crate::gateway) base_url: String,
}

impl StreamFinalizeCtx {
    /// Settles circuit and session state for the attempt that produced this
    /// body, then emits the terminal request event. Callers guarantee this
    /// runs at most once per response.
    pub(in crate::gateway) fn finalize_request(
        &self,
        error_code: Option<&'static str>,
        ttfb_ms: Option<u128>,
        usage: Option<UsageMetrics>,
        response_model: Option<String>,
    ) {
        let duration_ms = self.started.elapsed().as_millis();
        let effective_error_category = if error_code == Some("GW_STREAM_ABORTED") {
            Some(ErrorCategory::ClientAbort.as_str())
        } else {
            self.error_category
        };

        let now_unix = now_unix_seconds() as i64;

        // A mid-body error already relayed a broken response to the client;
        // cool the provider down so the next request prefers a sibling.
        if error_code.is_some()
            && effective_error_category != Some(ErrorCategory::ClientAbort.as_str())
            && self.provider_cooldown_secs > 0
        {
            self.circuit.trigger_cooldown(
                &self.cli_key,
                self.provider_id,
                now_unix,
                self.provider_cooldown_secs,
            );
        }

        if error_code.is_none() && (200..300).contains(&self.status) {
            let change = self
                .circuit
                .record_success(&self.cli_key, self.provider_id, now_unix);
            if let Some(t) = change.transition {
                self.events.emit_circuit_transition(
                    &self.trace_id,
                    &self.cli_key,
                    self.provider_id,
                    &self.provider_name,
                    &self.base_url,
                    &t,
                    now_unix,
                );
            }
            if let Some(session_id) = self.session_id.as_deref() {
                self.session.bind_success(
                    &self.cli_key,
                    session_id,
                    self.provider_id,
                    self.sort_mode_id,
                    now_unix,
                );
            }
        } else if effective_error_category == Some(ErrorCategory::ProviderError.as_str()) {
            let change = self
                .circuit
                .record_failure(&self.cli_key, self.provider_id, now_unix);
            if let Some(t) = change.transition {
                self.events.emit_circuit_transition(
                    &self.trace_id,
                    &self.cli_key,
                    self.provider_id,
                    &self.provider_name,
                    &self.base_url,
                    &t,
                    now_unix,
                );
            }
        }

        self.events.emit_request(RequestEvent {
            trace_id: self.trace_id.clone(),
            cli_key: self.cli_key.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            status: Some(self.status),
            error_category: effective_error_category,
            error_code,
            duration_ms,
            ttfb_ms,
            response_model,
            attempts: self.attempts.clone(),
            usage: usage.unwrap_or_default(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakerConfig, CircuitState};
    use crate::events::GatewayEvent;

    fn ctx(bus: &EventBus, status: u16, error_category: Option<&'static str>) -> StreamFinalizeCtx {
        StreamFinalizeCtx {
            events: bus.clone(),
            circuit: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            session: Arc::new(SessionAffinity::new()),
            session_id: Some("sess-1".to_string()),
            sort_mode_id: None,
            trace_id: "t1".to_string(),
            cli_key: "claude".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            query: None,
            status,
            error_category,
            error_code: None,
            started: Instant::now(),
            attempts: Vec::new(),
            provider_cooldown_secs: 30,
            provider_id: 7,
            provider_name: "primary".to_string(),
            base_url: "https://api.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn success_finalize_binds_session_and_clears_circuit() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ctx = ctx(&bus, 200, None);

        ctx.circuit.record_failure("claude", 7, 1_000);
        ctx.finalize_request(None, Some(12), None, Some("claude-sonnet-4".to_string()));

        let now = now_unix_seconds() as i64;
        assert_eq!(ctx.circuit.snapshot("claude", 7, now).failure_count, 0);
        assert_eq!(
            ctx.session.get_bound_provider("claude", "sess-1", now),
            Some(7)
        );

        match rx.recv().await.expect("event") {
            GatewayEvent::Request(e) => {
                assert_eq!(e.status, Some(200));
                assert!(e.error_code.is_none());
                assert_eq!(e.ttfb_ms, Some(12));
                assert_eq!(e.response_model.as_deref(), Some("claude-sonnet-4"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_error_triggers_cooldown() {
        let bus = EventBus::new();
        let ctx = ctx(&bus, 200, None);

        ctx.finalize_request(Some("GW_STREAM_IDLE_TIMEOUT"), None, None, None);

        let now = now_unix_seconds() as i64;
        let snap = ctx.circuit.snapshot("claude", 7, now);
        assert!(snap.cooldown_until.is_some());
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn client_abort_skips_cooldown_and_recategorizes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ctx = ctx(&bus, 200, None);

        ctx.finalize_request(Some("GW_STREAM_ABORTED"), None, None, None);

        let now = now_unix_seconds() as i64;
        assert!(ctx.circuit.snapshot("claude", 7, now).cooldown_until.is_none());

        match rx.recv().await.expect("event") {
            GatewayEvent::Request(e) => {
                assert_eq!(e.error_category, Some("CLIENT_ABORT"));
                assert_eq!(e.error_code, Some("GW_STREAM_ABORTED"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_error_category_records_failure() {
        let bus = EventBus::new();
        let ctx = ctx(&bus, 502, Some("PROVIDER_ERROR"));

        ctx.finalize_request(Some("GW_STREAM_ERROR"), None, None, None);

        let now = now_unix_seconds() as i64;
        assert_eq!(ctx.circuit.snapshot("claude", 7, now).failure_count, 1);
    }
}
