//! Token usage extraction from upstream responses.
//!
//! Providers disagree on where usage lives: OpenAI chat completions use
//! `usage.prompt_tokens`, the Responses API uses `input_tokens`, Claude
//! splits usage across `message_start` and `message_delta` SSE events, and
//! Gemini nests everything under `usageMetadata`. This module normalizes all
//! of them into one shape.

use serde_json::{json, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct UsageMetrics {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_creation_5m_input_tokens: Option<i64>,
    pub cache_creation_1h_input_tokens: Option<i64>,
}

fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|v| i64::try_from(v).ok())),
        _ => None,
    }
}

impl UsageMetrics {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.total_tokens.is_none()
            && self.cache_read_input_tokens.is_none()
            && self.cache_creation_input_tokens.is_none()
            && self.cache_creation_5m_input_tokens.is_none()
            && self.cache_creation_1h_input_tokens.is_none()
    }

    /// Field-wise merge, `patch` wins where both are present.
    pub fn merged_with(&self, patch: &UsageMetrics) -> UsageMetrics {
        UsageMetrics {
            input_tokens: patch.input_tokens.or(self.input_tokens),
            output_tokens: patch.output_tokens.or(self.output_tokens),
            total_tokens: patch.total_tokens.or(self.total_tokens),
            cache_read_input_tokens: patch
                .cache_read_input_tokens
                .or(self.cache_read_input_tokens),
            cache_creation_input_tokens: patch
                .cache_creation_input_tokens
                .or(self.cache_creation_input_tokens),
            cache_creation_5m_input_tokens: patch
                .cache_creation_5m_input_tokens
                .or(self.cache_creation_5m_input_tokens),
            cache_creation_1h_input_tokens: patch
                .cache_creation_1h_input_tokens
                .or(self.cache_creation_1h_input_tokens),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        let fields = [
            ("input_tokens", self.input_tokens),
            ("output_tokens", self.output_tokens),
            ("total_tokens", self.total_tokens),
            ("cache_read_input_tokens", self.cache_read_input_tokens),
            (
                "cache_creation_input_tokens",
                self.cache_creation_input_tokens,
            ),
            (
                "cache_creation_5m_input_tokens",
                self.cache_creation_5m_input_tokens,
            ),
            (
                "cache_creation_1h_input_tokens",
                self.cache_creation_1h_input_tokens,
            ),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                obj.insert(key.to_string(), json!(v));
            }
        }
        Value::Object(obj)
    }

    /// Reads a usage-shaped object (the value of `usage` / `usageMetadata`,
    /// or a flat payload carrying the same keys).
    fn from_usage_object(value: &Value) -> Option<UsageMetrics> {
        let obj = value.as_object()?;
        let mut m = UsageMetrics::default();

        // OpenAI chat completions, then Responses API names.
        m.input_tokens = as_i64(obj.get("prompt_tokens")).or_else(|| as_i64(obj.get("input_tokens")));
        m.output_tokens =
            as_i64(obj.get("completion_tokens")).or_else(|| as_i64(obj.get("output_tokens")));
        m.total_tokens = as_i64(obj.get("total_tokens"));

        m.cache_read_input_tokens = obj
            .get("input_tokens_details")
            .or_else(|| obj.get("prompt_tokens_details"))
            .and_then(|v| v.as_object())
            .and_then(|d| as_i64(d.get("cached_tokens")))
            .or_else(|| as_i64(obj.get("cache_read_input_tokens")));

        // Claude cache creation, top-level or nested under cache_creation.
        m.cache_creation_input_tokens = as_i64(obj.get("cache_creation_input_tokens"));
        m.cache_creation_5m_input_tokens = as_i64(obj.get("cache_creation_5m_input_tokens"));
        m.cache_creation_1h_input_tokens = as_i64(obj.get("cache_creation_1h_input_tokens"));
        if let Some(cache) = obj.get("cache_creation").and_then(|v| v.as_object()) {
            m.cache_creation_5m_input_tokens = m
                .cache_creation_5m_input_tokens
                .or_else(|| as_i64(cache.get("ephemeral_5m_input_tokens")));
            m.cache_creation_1h_input_tokens = m
                .cache_creation_1h_input_tokens
                .or_else(|| as_i64(cache.get("ephemeral_1h_input_tokens")));
        }
        if m.cache_creation_input_tokens.is_none() {
            m.cache_creation_input_tokens = match (
                m.cache_creation_5m_input_tokens,
                m.cache_creation_1h_input_tokens,
            ) {
                (Some(a), Some(b)) => Some(a.saturating_add(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
        }

        // Gemini usageMetadata. Thought tokens count toward output.
        m.input_tokens = m.input_tokens.or_else(|| as_i64(obj.get("promptTokenCount")));
        if m.output_tokens.is_none() {
            let thoughts = as_i64(obj.get("thoughtsTokenCount")).unwrap_or(0);
            m.output_tokens =
                as_i64(obj.get("candidatesTokenCount")).map(|v| v.saturating_add(thoughts));
        }
        m.total_tokens = m.total_tokens.or_else(|| as_i64(obj.get("totalTokenCount")));
        m.cache_read_input_tokens = m
            .cache_read_input_tokens
            .or_else(|| as_i64(obj.get("cachedContentTokenCount")));

        (!m.is_empty()).then_some(m)
    }

    /// Extracts usage from an arbitrary response payload by scanning the
    /// containers the supported providers use.
    pub fn from_response_value(value: &Value) -> Option<UsageMetrics> {
        if let Some(m) = Self::from_usage_object(value) {
            return Some(m);
        }

        if let Some(obj) = value.as_object() {
            for key in ["usage", "usageMetadata"] {
                if let Some(m) = obj.get(key).and_then(Self::from_usage_object) {
                    return Some(m);
                }
            }
            if let Some(resp) = obj.get("response") {
                for key in ["usage", "usageMetadata"] {
                    if let Some(m) = resp.get(key).and_then(Self::from_usage_object) {
                        return Some(m);
                    }
                }
            }
            if let Some(output) = obj.get("output").and_then(|v| v.as_array()) {
                for item in output {
                    if let Some(m) = item.get("usage").and_then(Self::from_usage_object) {
                        return Some(m);
                    }
                }
            }
        }

        if let Some(arr) = value.as_array() {
            for item in arr {
                if let Some(m) = item.get("usage").and_then(Self::from_usage_object) {
                    return Some(m);
                }
                if let Some(m) = item
                    .get("data")
                    .and_then(|v| v.get("usage"))
                    .and_then(Self::from_usage_object)
                {
                    return Some(m);
                }
            }
        }

        None
    }

    pub fn from_json_bytes(body: &[u8]) -> Option<UsageMetrics> {
        let value: Value = serde_json::from_slice(body).ok()?;
        Self::from_response_value(&value)
    }
}

fn sanitize_model(model: &str) -> Option<String> {
    let model = model.trim();
    if model.is_empty() {
        return None;
    }
    Some(if model.len() > 200 {
        model[..200].to_string()
    } else {
        model.to_string()
    })
}

fn model_from_value(value: &Value) -> Option<String> {
    if let Some(model) = value.get("model").and_then(|v| v.as_str()) {
        return sanitize_model(model);
    }
    for key in ["message", "response"] {
        if let Some(model) = value
            .get(key)
            .and_then(|v| v.get("model"))
            .and_then(|v| v.as_str())
        {
            return sanitize_model(model);
        }
    }
    None
}

pub fn parse_model_from_json_bytes(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    model_from_value(&value)
}

/// Incremental SSE parser that collects usage while chunks are relayed.
///
/// Claude streams partial usage in `message_start` and the remainder in
/// `message_delta`; both halves are kept and merged at finalize. Other CLIs
/// report complete usage in their final event, so last-seen wins.
#[derive(Debug)]
pub struct SseUsageTracker {
    is_claude: bool,
    buffer: Vec<u8>,
    current_event: Vec<u8>,
    current_data: Vec<u8>,
    claude_start: Option<UsageMetrics>,
    claude_delta: Option<UsageMetrics>,
    last_generic: Option<UsageMetrics>,
    last_model: Option<String>,
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &bytes[start..end]
}

impl SseUsageTracker {
    pub fn new(cli_key: &str) -> Self {
        Self {
            is_claude: cli_key == "claude",
            buffer: Vec::new(),
            current_event: Vec::new(),
            current_data: Vec::new(),
            claude_start: None,
            claude_delta: None,
            last_generic: None,
            last_model: None,
        }
    }

    pub fn ingest_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        let buf = std::mem::take(&mut self.buffer);
        let mut start = 0usize;
        for (idx, b) in buf.iter().enumerate() {
            if *b != b'\n' {
                continue;
            }
            let mut line = &buf[start..idx];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            self.ingest_line(line);
            start = idx + 1;
        }
        if start < buf.len() {
            self.buffer.extend_from_slice(&buf[start..]);
        }
    }

    fn ingest_line(&mut self, line: &[u8]) {
        if line.is_empty() {
            self.flush_event();
            return;
        }
        if line[0] == b':' {
            return;
        }

        if let Some(rest) = line.strip_prefix(b"event:") {
            self.current_event.clear();
            self.current_event.extend_from_slice(trim_ascii(rest));
            return;
        }

        if let Some(rest) = line.strip_prefix(b"data:") {
            let mut rest = rest;
            if rest.first() == Some(&b' ') {
                rest = &rest[1..];
            }
            if rest == b"[DONE]" {
                return;
            }
            if !self.current_data.is_empty() {
                self.current_data.push(b'\n');
            }
            self.current_data.extend_from_slice(rest);
        }
    }

    fn flush_event(&mut self) {
        if self.current_data.is_empty() {
            self.current_event.clear();
            return;
        }

        let event_name = if self.current_event.is_empty() {
            b"message".to_vec()
        } else {
            self.current_event.clone()
        };

        if let Ok(data) = serde_json::from_slice::<Value>(&self.current_data) {
            self.ingest_event(&event_name, &data);
        }
        self.current_event.clear();
        self.current_data.clear();
    }

    fn ingest_event(&mut self, event: &[u8], data: &Value) {
        if let Some(model) = model_from_value(data) {
            self.last_model = Some(model);
        }

        if self.is_claude {
            if event == b"message_start" {
                let usage = data
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .or_else(|| data.get("usage"));
                if let Some(m) = usage.and_then(UsageMetrics::from_usage_object) {
                    self.claude_start = Some(match &self.claude_start {
                        Some(prev) => prev.merged_with(&m),
                        None => m,
                    });
                }
                return;
            }
            if event == b"message_delta" {
                let usage = data
                    .get("usage")
                    .or_else(|| data.get("delta").and_then(|d| d.get("usage")));
                if let Some(m) = usage.and_then(UsageMetrics::from_usage_object) {
                    self.claude_delta = Some(match &self.claude_delta {
                        Some(prev) => prev.merged_with(&m),
                        None => m,
                    });
                }
                return;
            }

            // Some proxies drop the `event:` line; a Claude-shaped payload may
            // still carry usage under message/delta.
            let usage = data
                .get("message")
                .and_then(|m| m.get("usage"))
                .or_else(|| data.get("usage"))
                .or_else(|| data.get("delta").and_then(|d| d.get("usage")));
            if let Some(m) = usage.and_then(UsageMetrics::from_usage_object) {
                self.last_generic = Some(match &self.last_generic {
                    Some(prev) => prev.merged_with(&m),
                    None => m,
                });
                return;
            }
        }

        if let Some(m) = UsageMetrics::from_response_value(data) {
            self.last_generic = Some(m);
        }
    }

    pub fn best_effort_model(&self) -> Option<String> {
        self.last_model.clone()
    }

    pub fn finalize(&mut self) -> Option<UsageMetrics> {
        // Trailing line without '\n', then trailing event without blank line.
        if !self.buffer.is_empty() {
            let mut tail = std::mem::take(&mut self.buffer);
            if tail.last() == Some(&b'\r') {
                tail.pop();
            }
            self.ingest_line(&tail);
        }
        self.flush_event();

        if self.is_claude {
            match (&self.claude_start, &self.claude_delta) {
                (Some(start), Some(delta)) => Some(start.merged_with(delta)),
                (Some(start), None) => Some(start.clone()),
                (None, Some(delta)) => Some(delta.clone()),
                (None, None) => self.last_generic.clone(),
            }
        } else {
            self.last_generic.clone()
        }
    }
}
