//! Gateway event stream.
//!
//! Every request produces a `gateway:request_start`, zero or more
//! `gateway:attempt` events, and one terminal `gateway:request`. Circuit
//! transitions and skips publish `gateway:circuit`; server lifecycle issues
//! publish `gateway:log`. Delivery is fan-out over a tokio broadcast channel
//! and intentionally lossy for slow subscribers.

use crate::circuit::{CircuitState, CircuitTransition};
use crate::trace::TraceStore;
use crate::usage::UsageMetrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Suppression window for repeated circuit skip events. A single failover
/// pass over an open provider can probe it several times back to back.
const SKIP_EVENT_DEDUP_WINDOW_SECS: i64 = 3;
const SKIP_EVENT_DEDUP_MAX_ENTRIES: usize = 512;

#[derive(Debug, Serialize, Clone)]
pub struct RequestStartEvent {
    pub trace_id: String,
    pub cli_key: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub requested_model: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct AttemptEvent {
    pub trace_id: String,
    pub cli_key: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub attempt_index: u32,
    pub provider_id: i64,
    pub provider_name: String,
    pub base_url: String,
    pub session_reuse: Option<bool>,
    pub outcome: String,
    pub status: Option<u16>,
    pub attempt_started_ms: u128,
    pub attempt_duration_ms: u128,
    pub circuit_state_before: Option<&'static str>,
    pub circuit_state_after: Option<&'static str>,
    pub circuit_failure_count: Option<u32>,
    pub circuit_failure_threshold: Option<u32>,
}

/// Per-attempt record embedded in the terminal request event.
#[derive(Debug, Serialize, Clone)]
pub struct FailoverAttempt {
    pub provider_id: i64,
    pub provider_name: String,
    pub base_url: String,
    pub outcome: String,
    pub status: Option<u16>,
    pub provider_index: Option<u32>,
    pub retry_index: Option<u32>,
    pub session_reuse: Option<bool>,
    pub error_category: Option<&'static str>,
    pub error_code: Option<&'static str>,
    pub decision: Option<&'static str>,
    pub reason: Option<String>,
    pub attempt_started_ms: Option<u128>,
    pub attempt_duration_ms: Option<u128>,
    pub circuit_state_before: Option<&'static str>,
    pub circuit_state_after: Option<&'static str>,
    pub circuit_failure_count: Option<u32>,
    pub circuit_failure_threshold: Option<u32>,
}

#[derive(Debug, Serialize, Clone)]
pub struct RequestEvent {
    pub trace_id: String,
    pub cli_key: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub status: Option<u16>,
    pub error_category: Option<&'static str>,
    pub error_code: Option<&'static str>,
    pub duration_ms: u128,
    pub ttfb_ms: Option<u128>,
    /// Model name reported by the provider's response, which can differ from
    /// the one the client asked for.
    pub response_model: Option<String>,
    pub attempts: Vec<FailoverAttempt>,
    #[serde(flatten)]
    pub usage: UsageMetrics,
}

#[derive(Debug, Serialize, Clone)]
pub struct CircuitEvent {
    pub trace_id: String,
    pub cli_key: String,
    pub provider_id: i64,
    pub provider_name: String,
    pub base_url: String,
    pub prev_state: &'static str,
    pub next_state: &'static str,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_until: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub reason: &'static str,
    pub ts: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct LogEvent {
    pub level: &'static str,
    pub error_code: &'static str,
    pub message: String,
    pub requested_port: u16,
    pub bound_port: u16,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    RequestStart(RequestStartEvent),
    Attempt(AttemptEvent),
    Request(RequestEvent),
    Circuit(CircuitEvent),
    Log(LogEvent),
}

impl GatewayEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::RequestStart(_) => "gateway:request_start",
            Self::Attempt(_) => "gateway:attempt",
            Self::Request(_) => "gateway:request",
            Self::Circuit(_) => "gateway:circuit",
            Self::Log(_) => "gateway:log",
        }
    }

    pub fn payload_json(&self) -> serde_json::Value {
        match self {
            Self::RequestStart(p) => serde_json::to_value(p),
            Self::Attempt(p) => serde_json::to_value(p),
            Self::Request(p) => serde_json::to_value(p),
            Self::Circuit(p) => serde_json::to_value(p),
            Self::Log(p) => serde_json::to_value(p),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct SkipEventDedup {
    seen: HashMap<(String, i64, &'static str, &'static str), i64>,
}

impl SkipEventDedup {
    /// True when this skip should be published.
    fn should_emit(
        &mut self,
        cli_key: &str,
        provider_id: i64,
        reason: &'static str,
        state: &'static str,
        now_unix: i64,
    ) -> bool {
        self.seen
            .retain(|_, last| now_unix - *last < SKIP_EVENT_DEDUP_WINDOW_SECS);
        if self.seen.len() >= SKIP_EVENT_DEDUP_MAX_ENTRIES {
            self.seen.clear();
        }

        let key = (cli_key.to_string(), provider_id, reason, state);
        match self.seen.get(&key) {
            Some(last) if now_unix - *last < SKIP_EVENT_DEDUP_WINDOW_SECS => false,
            _ => {
                self.seen.insert(key, now_unix);
                true
            }
        }
    }
}

/// Fan-out hub for gateway events. Publishing also feeds the trace store so
/// recent request history survives without any subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
    traces: Arc<TraceStore>,
    skip_dedup: Arc<Mutex<SkipEventDedup>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            traces: Arc::new(TraceStore::new()),
            skip_dedup: Arc::new(Mutex::new(SkipEventDedup::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    fn publish(&self, event: GatewayEvent) {
        // No subscribers is fine; traces are recorded regardless.
        let _ = self.tx.send(event);
    }

    pub fn emit_request_start(&self, event: RequestStartEvent) {
        self.traces.record_start(&event);
        self.publish(GatewayEvent::RequestStart(event));
    }

    pub fn emit_attempt(&self, event: AttemptEvent) {
        self.traces.record_attempt(&event);
        self.publish(GatewayEvent::Attempt(event));
    }

    pub fn emit_request(&self, event: RequestEvent) {
        self.traces.record_complete(&event);
        self.publish(GatewayEvent::Request(event));
    }

    pub fn emit_circuit(&self, event: CircuitEvent) {
        self.publish(GatewayEvent::Circuit(event));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_circuit_transition(
        &self,
        trace_id: &str,
        cli_key: &str,
        provider_id: i64,
        provider_name: &str,
        base_url: &str,
        transition: &CircuitTransition,
        now_unix: i64,
    ) {
        self.emit_circuit(CircuitEvent {
            trace_id: trace_id.to_string(),
            cli_key: cli_key.to_string(),
            provider_id,
            provider_name: provider_name.to_string(),
            base_url: base_url.to_string(),
            prev_state: transition.prev_state.as_str(),
            next_state: transition.next_state.as_str(),
            failure_count: transition.snapshot.failure_count,
            failure_threshold: transition.snapshot.failure_threshold,
            open_until: transition.snapshot.open_until,
            cooldown_until: transition.snapshot.cooldown_until,
            reason: transition.reason,
            ts: now_unix,
        });
    }

    /// Publishes a SKIP_OPEN / SKIP_COOLDOWN circuit event, deduplicated over
    /// a short window so retry bursts do not flood subscribers.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_circuit_skip(
        &self,
        trace_id: &str,
        cli_key: &str,
        provider_id: i64,
        provider_name: &str,
        base_url: &str,
        state: CircuitState,
        snapshot: &crate::circuit::CircuitSnapshot,
        reason: &'static str,
        now_unix: i64,
    ) {
        let emit = self
            .skip_dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .should_emit(cli_key, provider_id, reason, state.as_str(), now_unix);
        if !emit {
            return;
        }

        self.emit_circuit(CircuitEvent {
            trace_id: trace_id.to_string(),
            cli_key: cli_key.to_string(),
            provider_id,
            provider_name: provider_name.to_string(),
            base_url: base_url.to_string(),
            prev_state: state.as_str(),
            next_state: state.as_str(),
            failure_count: snapshot.failure_count,
            failure_threshold: snapshot.failure_threshold,
            open_until: snapshot.open_until,
            cooldown_until: snapshot.cooldown_until,
            reason,
            ts: now_unix,
        });
    }

    pub fn emit_log(&self, level: &'static str, error_code: &'static str, message: String) {
        self.publish(GatewayEvent::Log(LogEvent {
            level,
            error_code,
            message,
            requested_port: 0,
            bound_port: 0,
            base_url: String::new(),
        }));
    }

    pub fn emit_port_log(
        &self,
        level: &'static str,
        error_code: &'static str,
        message: String,
        requested_port: u16,
        bound_port: u16,
        base_url: String,
    ) {
        self.publish(GatewayEvent::Log(LogEvent {
            level,
            error_code,
            message,
            requested_port,
            bound_port,
            base_url,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event(trace_id: &str) -> RequestStartEvent {
        RequestStartEvent {
            trace_id: trace_id.to_string(),
            cli_key: "claude".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            query: None,
            requested_model: Some("claude-sonnet-4".to_string()),
            ts: 1_000,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit_request_start(start_event("t1"));

        let event = rx.recv().await.expect("event");
        assert_eq!(event.channel(), "gateway:request_start");
        match event {
            GatewayEvent::RequestStart(e) => assert_eq!(e.trace_id, "t1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publishing_without_subscribers_still_records_trace() {
        let bus = EventBus::new();
        bus.emit_request_start(start_event("t1"));
        assert!(bus.traces().get("t1").is_some());
    }

    #[test]
    fn skip_dedup_suppresses_within_window() {
        let mut dedup = SkipEventDedup::default();
        assert!(dedup.should_emit("claude", 1, "SKIP_OPEN", "OPEN", 1_000));
        assert!(!dedup.should_emit("claude", 1, "SKIP_OPEN", "OPEN", 1_001));
        assert!(dedup.should_emit("claude", 1, "SKIP_OPEN", "OPEN", 1_003));
    }

    #[test]
    fn skip_dedup_keys_on_provider_and_reason() {
        let mut dedup = SkipEventDedup::default();
        assert!(dedup.should_emit("claude", 1, "SKIP_OPEN", "OPEN", 1_000));
        assert!(dedup.should_emit("claude", 2, "SKIP_OPEN", "OPEN", 1_000));
        assert!(dedup.should_emit("claude", 1, "SKIP_COOLDOWN", "CLOSED", 1_000));
        assert!(dedup.should_emit("codex", 1, "SKIP_OPEN", "OPEN", 1_000));
    }

    #[test]
    fn payload_json_carries_channel_fields() {
        let event = GatewayEvent::Log(LogEvent {
            level: "error",
            error_code: "GW_PORT_IN_USE",
            message: "port busy".to_string(),
            requested_port: 37123,
            bound_port: 37124,
            base_url: "http://127.0.0.1:37124".to_string(),
        });
        assert_eq!(event.channel(), "gateway:log");
        let json = event.payload_json();
        assert_eq!(json["error_code"], "GW_PORT_IN_USE");
        assert_eq!(json["bound_port"], 37124);
    }
}
