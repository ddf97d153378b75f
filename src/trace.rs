//! Recent-request trace ring buffer.
//!
//! Keeps the last traces in memory for diagnostics so a consumer that
//! subscribes late can still see what happened. Capacity-capped both ways:
//! old traces are evicted FIFO and attempt lists are truncated per trace.

use crate::events::{AttemptEvent, RequestEvent, RequestStartEvent};
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_TRACES: usize = 50;
const MAX_ATTEMPTS_PER_TRACE: usize = 100;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestTrace {
    pub trace_id: String,
    pub cli_key: String,
    pub method: String,
    pub path: String,
    pub started_ts: i64,
    pub attempts: Vec<AttemptEvent>,
    /// Count of attempt events seen, including those dropped by the cap.
    pub attempt_count: usize,
    pub completed: Option<RequestEvent>,
}

#[derive(Debug, Default)]
pub struct TraceStore {
    traces: Mutex<VecDeque<RequestTrace>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RequestTrace>> {
        self.traces.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_start(&self, event: &RequestStartEvent) {
        let mut guard = self.lock();
        while guard.len() >= MAX_TRACES {
            guard.pop_front();
        }
        guard.push_back(RequestTrace {
            trace_id: event.trace_id.clone(),
            cli_key: event.cli_key.clone(),
            method: event.method.clone(),
            path: event.path.clone(),
            started_ts: event.ts,
            attempts: Vec::new(),
            attempt_count: 0,
            completed: None,
        });
    }

    pub fn record_attempt(&self, event: &AttemptEvent) {
        let mut guard = self.lock();
        if let Some(trace) = guard
            .iter_mut()
            .rev()
            .find(|t| t.trace_id == event.trace_id)
        {
            trace.attempt_count = trace.attempt_count.saturating_add(1);
            if trace.attempts.len() < MAX_ATTEMPTS_PER_TRACE {
                trace.attempts.push(event.clone());
            }
        }
    }

    pub fn record_complete(&self, event: &RequestEvent) {
        let mut guard = self.lock();
        if let Some(trace) = guard
            .iter_mut()
            .rev()
            .find(|t| t.trace_id == event.trace_id)
        {
            trace.completed = Some(event.clone());
        }
    }

    pub fn get(&self, trace_id: &str) -> Option<RequestTrace> {
        self.lock()
            .iter()
            .rev()
            .find(|t| t.trace_id == trace_id)
            .cloned()
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Vec<RequestTrace> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(trace_id: &str, ts: i64) -> RequestStartEvent {
        RequestStartEvent {
            trace_id: trace_id.to_string(),
            cli_key: "claude".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            query: None,
            requested_model: None,
            ts,
        }
    }

    fn attempt(trace_id: &str, attempt_index: u32) -> AttemptEvent {
        AttemptEvent {
            trace_id: trace_id.to_string(),
            cli_key: "claude".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            query: None,
            attempt_index,
            provider_id: 1,
            provider_name: "p1".to_string(),
            base_url: String::new(),
            session_reuse: None,
            outcome: "success".to_string(),
            status: Some(200),
            attempt_started_ms: 0,
            attempt_duration_ms: 1,
            circuit_state_before: None,
            circuit_state_after: None,
            circuit_failure_count: None,
            circuit_failure_threshold: None,
        }
    }

    #[test]
    fn attaches_attempts_to_their_trace() {
        let store = TraceStore::new();
        store.record_start(&start("t1", 1_000));
        store.record_start(&start("t2", 1_001));
        store.record_attempt(&attempt("t1", 1));
        store.record_attempt(&attempt("t2", 1));
        store.record_attempt(&attempt("t2", 2));

        assert_eq!(store.get("t1").expect("t1").attempts.len(), 1);
        assert_eq!(store.get("t2").expect("t2").attempts.len(), 2);
    }

    #[test]
    fn evicts_oldest_trace_beyond_capacity() {
        let store = TraceStore::new();
        for i in 0..(MAX_TRACES + 5) {
            store.record_start(&start(&format!("t{i}"), i as i64));
        }

        assert!(store.get("t0").is_none());
        assert!(store.get("t5").is_some());
        assert_eq!(store.list(1_000).len(), MAX_TRACES);
    }

    #[test]
    fn caps_attempts_but_keeps_counting() {
        let store = TraceStore::new();
        store.record_start(&start("t1", 1_000));
        for i in 0..(MAX_ATTEMPTS_PER_TRACE + 10) {
            store.record_attempt(&attempt("t1", i as u32));
        }

        let trace = store.get("t1").expect("t1");
        assert_eq!(trace.attempts.len(), MAX_ATTEMPTS_PER_TRACE);
        assert_eq!(trace.attempt_count, MAX_ATTEMPTS_PER_TRACE + 10);
    }

    #[test]
    fn list_is_newest_first() {
        let store = TraceStore::new();
        store.record_start(&start("t1", 1_000));
        store.record_start(&start("t2", 1_001));

        let rows = store.list(10);
        assert_eq!(rows[0].trace_id, "t2");
        assert_eq!(rows[1].trace_id, "t1");
    }
}
