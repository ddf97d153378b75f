//! Drop guard that emits a terminal event when the client disconnects.
//!
//! Axum drops the handler future as soon as the connection goes away, so any
//! early return path must `disarm` the guard; the remaining drops are real
//! client aborts and would otherwise leave the trace dangling forever.

use std::time::Instant;

use crate::events::{EventBus, RequestEvent};
use crate::usage::UsageMetrics;

use super::ErrorCategory;

pub(super) struct RequestAbortGuard {
    events: EventBus,
    trace_id: String,
    cli_key: String,
    method: String,
    path: String,
    query: Option<String>,
    started: Instant,
    armed: bool,
}

impl RequestAbortGuard {
    pub(super) fn new(
        events: EventBus,
        trace_id: String,
        cli_key: String,
        method: String,
        path: String,
        query: Option<String>,
    ) -> Self {
        Self {
            events,
            trace_id,
            cli_key,
            method,
            path,
            query,
            started: Instant::now(),
            armed: true,
        }
    }

    /// Call on every path that produces a response (success or error).
    pub(super) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RequestAbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.events.emit_request(RequestEvent {
            trace_id: self.trace_id.clone(),
            cli_key: self.cli_key.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            status: None,
            error_category: Some(ErrorCategory::ClientAbort.as_str()),
            error_code: Some("GW_REQUEST_ABORTED"),
            duration_ms: self.started.elapsed().as_millis(),
            ttfb_ms: None,
            response_model: None,
            attempts: Vec::new(),
            usage: UsageMetrics::default(),
        });
    }
}
