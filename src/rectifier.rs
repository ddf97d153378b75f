//! Response rectifier.
//!
//! Some third-party relays produce almost-correct output: a UTF-8 BOM in
//! front of JSON, `Data:` instead of `data:`, bodies cut off mid-object.
//! The rectifier repairs what is safely repairable on buffered bodies and
//! leaves everything else untouched. Repairs are validated before they
//! replace the original bytes.
//!
//! The warmup interceptor also lives here: Claude Code sends a fixed
//! single-message "warmup" request on startup that never needs an upstream.

use axum::body::Bytes;
use serde_json::{json, Value};

pub const RECTIFIER_HEADER: &str = "x-gateway-rectified";

const DEFAULT_MAX_JSON_DEPTH: usize = 200;
const DEFAULT_MAX_FIX_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RectifierConfig {
    pub fix_encoding: bool,
    pub fix_sse_format: bool,
    pub fix_truncated_json: bool,
    pub max_json_depth: usize,
    pub max_fix_size: usize,
}

impl Default for RectifierConfig {
    fn default() -> Self {
        Self {
            fix_encoding: true,
            fix_sse_format: true,
            fix_truncated_json: true,
            max_json_depth: DEFAULT_MAX_JSON_DEPTH,
            max_fix_size: DEFAULT_MAX_FIX_SIZE,
        }
    }
}

impl RectifierConfig {
    pub fn from_settings(settings: &crate::config::GatewaySettings) -> Option<Self> {
        if !settings.enable_response_fixer {
            return None;
        }
        Some(Self {
            fix_encoding: settings.response_fixer_fix_encoding,
            fix_sse_format: settings.response_fixer_fix_sse_format,
            fix_truncated_json: settings.response_fixer_fix_truncated_json,
            ..Self::default()
        })
    }
}

#[derive(Debug)]
pub struct RectifyOutcome {
    pub body: Bytes,
    pub applied: Vec<&'static str>,
}

impl RectifyOutcome {
    pub fn header_value(&self) -> &'static str {
        if self.applied.is_empty() {
            "not-applied"
        } else {
            "applied"
        }
    }
}

/// Repairs a buffered JSON response body.
pub fn rectify_json_body(body: Bytes, config: &RectifierConfig) -> RectifyOutcome {
    let mut applied = Vec::new();
    let mut data = body;

    if config.fix_encoding {
        if let Some(fixed) = fix_encoding(&data) {
            data = fixed;
            applied.push("encoding");
        }
    }
    if config.fix_truncated_json {
        if let Some(fixed) = fix_truncated_json(&data, config) {
            data = fixed;
            applied.push("json");
        }
    }

    RectifyOutcome { body: data, applied }
}

/// Repairs a buffered SSE body: encoding first, then per-line framing, then
/// truncated JSON inside `data:` lines.
pub fn rectify_sse_body(body: Bytes, config: &RectifierConfig) -> RectifyOutcome {
    let mut applied = Vec::new();
    let mut data = body;

    if config.fix_encoding {
        if let Some(fixed) = fix_encoding(&data) {
            data = fixed;
            applied.push("encoding");
        }
    }
    if config.fix_sse_format {
        if let Some(fixed) = fix_sse_framing(&data) {
            data = fixed;
            applied.push("sse");
        }
    }
    if config.fix_truncated_json {
        if let Some(fixed) = fix_sse_data_json(&data, config) {
            data = fixed;
            applied.push("json");
        }
    }

    RectifyOutcome { body: data, applied }
}

// ---- encoding ----

fn has_utf8_bom(data: &[u8]) -> bool {
    data.starts_with(&[0xef, 0xbb, 0xbf])
}

fn has_utf16_bom(data: &[u8]) -> bool {
    data.starts_with(&[0xfe, 0xff]) || data.starts_with(&[0xff, 0xfe])
}

/// Returns the fixed bytes, or `None` when the input needed no fix.
fn fix_encoding(data: &Bytes) -> Option<Bytes> {
    let raw = data.as_ref();
    let needs_fix = has_utf8_bom(raw)
        || has_utf16_bom(raw)
        || raw.contains(&0)
        || std::str::from_utf8(raw).is_err();
    if !needs_fix {
        return None;
    }

    let mut out = if has_utf8_bom(raw) {
        data.slice(3..)
    } else if has_utf16_bom(raw) {
        data.slice(2..)
    } else {
        data.clone()
    };

    if out.contains(&0) {
        let stripped: Vec<u8> = out.iter().copied().filter(|b| *b != 0).collect();
        out = Bytes::from(stripped);
    }

    if std::str::from_utf8(out.as_ref()).is_err() {
        // Lossy re-encode guarantees valid UTF-8 on the way out.
        let lossy = String::from_utf8_lossy(out.as_ref()).into_owned();
        out = Bytes::from(lossy.into_bytes());
    }

    Some(out)
}

// ---- SSE framing ----

fn looks_like_json_line(line: &[u8]) -> bool {
    let trimmed = trim_start_ws(line);
    matches!(trimmed.first(), Some(b'{') | Some(b'[')) || trimmed.starts_with(b"[DONE]")
}

fn trim_start_ws(line: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < line.len() && line[i].is_ascii_whitespace() {
        i += 1;
    }
    &line[i..]
}

/// Ensures exactly one space after a known field prefix.
fn fix_field_space(prefix: &[u8], line: &[u8]) -> Option<Vec<u8>> {
    if !line.starts_with(prefix) {
        return None;
    }
    let after = &line[prefix.len()..];
    if after.first() == Some(&b' ') {
        return None;
    }
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(prefix);
    out.push(b' ');
    out.extend_from_slice(after);
    Some(out)
}

fn fix_sse_line(line: &[u8]) -> Option<Vec<u8>> {
    if line.is_empty() || line[0] == b':' {
        return None;
    }

    for prefix in [b"data:".as_slice(), b"event:", b"id:", b"retry:"] {
        if line.starts_with(prefix) {
            return fix_field_space(prefix, line);
        }
    }

    // Wrong case: Data: / DATA: ...
    if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"data:") {
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(b"data:");
        let after = &line[5..];
        if after.first() != Some(&b' ') {
            out.push(b' ');
        }
        out.extend_from_slice(after);
        return Some(out);
    }

    // Space before the colon: "data : {...}"
    if line.starts_with(b"data") {
        let rest = &line[4..];
        if let Some(colon) = rest.iter().position(|b| *b == b':') {
            if rest[..colon].iter().all(|b| b.is_ascii_whitespace()) {
                let value = trim_start_ws(&rest[colon + 1..]);
                let mut out = Vec::with_capacity(6 + value.len());
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(value);
                return Some(out);
            }
        }
    }

    // Bare JSON line inside an SSE body becomes a data line.
    if looks_like_json_line(line) {
        let mut out = Vec::with_capacity(6 + line.len());
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(line);
        return Some(out);
    }

    None
}

fn fix_sse_framing(data: &Bytes) -> Option<Bytes> {
    let bytes = data.as_ref();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut changed = false;

    for segment in bytes.split_inclusive(|b| *b == b'\n') {
        let (line, terminator): (&[u8], &[u8]) = match segment.last() {
            Some(b'\n') => {
                let body = &segment[..segment.len() - 1];
                if body.last() == Some(&b'\r') {
                    (&body[..body.len() - 1], b"\n")
                } else {
                    (body, b"\n")
                }
            }
            _ => (segment, b"".as_slice()),
        };
        if segment.ends_with(b"\r\n") {
            changed = true;
        }

        match fix_sse_line(line) {
            Some(fixed) => {
                changed = true;
                out.extend_from_slice(&fixed);
            }
            None => out.extend_from_slice(line),
        }
        out.extend_from_slice(terminator);
    }

    changed.then(|| Bytes::from(out))
}

// ---- truncated JSON ----

fn looks_like_json(data: &[u8]) -> bool {
    matches!(trim_start_ws(data).first(), Some(b'{') | Some(b'['))
}

fn remove_trailing_comma(out: &mut Vec<u8>) {
    let mut idx = out.len();
    while idx > 0 && out[idx - 1].is_ascii_whitespace() {
        idx -= 1;
    }
    if idx > 0 && out[idx - 1] == b',' {
        out.truncate(idx - 1);
    }
}

/// Stack-based structural repair: closes open strings, drops trailing commas
/// and half-written escapes, fills dangling `key:` with `null`, then closes
/// every open brace/bracket.
fn repair_json(data: &[u8], max_depth: usize) -> Option<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(data.len() + 8);
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for &byte in data {
        if escape_next {
            escape_next = false;
            out.push(byte);
            continue;
        }
        if in_string && byte == b'\\' {
            escape_next = true;
            out.push(byte);
            continue;
        }
        if byte == b'"' {
            in_string = !in_string;
            out.push(byte);
            continue;
        }

        if !in_string {
            match byte {
                b'{' | b'[' => {
                    if stack.len() >= max_depth {
                        return None;
                    }
                    stack.push(if byte == b'{' { b'}' } else { b']' });
                }
                b'}' | b']' => {
                    remove_trailing_comma(&mut out);
                    if stack.last() == Some(&byte) {
                        stack.pop();
                        out.push(byte);
                    }
                    continue;
                }
                _ => {}
            }
        }
        out.push(byte);
    }

    if escape_next {
        out.pop();
    }
    if in_string {
        out.push(b'"');
    }
    remove_trailing_comma(&mut out);

    if stack.last() == Some(&b'}') {
        let mut idx = out.len();
        while idx > 0 && out[idx - 1].is_ascii_whitespace() {
            idx -= 1;
        }
        if idx > 0 && out[idx - 1] == b':' {
            out.extend_from_slice(b"null");
        }
    }

    while let Some(close) = stack.pop() {
        remove_trailing_comma(&mut out);
        out.push(close);
    }

    Some(out)
}

fn repair_if_invalid(data: &[u8], config: &RectifierConfig) -> Option<Vec<u8>> {
    if data.len() > config.max_fix_size || !looks_like_json(data) {
        return None;
    }
    if serde_json::from_slice::<Value>(data).is_ok() {
        return None;
    }
    let repaired = repair_json(data, config.max_json_depth)?;
    serde_json::from_slice::<Value>(&repaired)
        .ok()
        .map(|_| repaired)
}

fn fix_truncated_json(data: &Bytes, config: &RectifierConfig) -> Option<Bytes> {
    repair_if_invalid(data.as_ref(), config).map(Bytes::from)
}

fn fix_sse_data_json(data: &Bytes, config: &RectifierConfig) -> Option<Bytes> {
    let bytes = data.as_ref();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut changed = false;

    for segment in bytes.split_inclusive(|b| *b == b'\n') {
        let (line, terminated) = match segment.last() {
            Some(b'\n') => (&segment[..segment.len() - 1], true),
            _ => (segment, false),
        };

        let fixed = line.strip_prefix(b"data: ").and_then(|payload| {
            if payload == b"[DONE]" {
                return None;
            }
            repair_if_invalid(payload, config)
        });

        match fixed {
            Some(payload) => {
                changed = true;
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(&payload);
            }
            None => out.extend_from_slice(line),
        }
        if terminated {
            out.push(b'\n');
        }
    }

    changed.then(|| Bytes::from(out))
}

// ---- thinking signature stripping ----

pub const THINKING_TRIGGER_STALE_SIGNATURE: &str = "stale_thinking_signature";
pub const THINKING_TRIGGER_MISSING_THINKING_PREFIX: &str = "missing_thinking_prefix";
pub const THINKING_TRIGGER_GENERIC_INVALID_REQUEST: &str = "generic_invalid_request";

/// Matches a provider 400 body against the known phrasings produced by a
/// conversation carrying thinking-block signatures minted elsewhere.
pub fn detect_thinking_signature_trigger(error_message: &str) -> Option<&'static str> {
    if error_message.trim().is_empty() {
        return None;
    }
    let lower = error_message.to_lowercase();

    let missing_thinking_prefix = lower.contains("must start with a thinking block")
        || (lower.contains("expected")
            && lower.contains("thinking")
            && (lower.contains("redacted_thinking") || lower.contains("redacted thinking"))
            && lower.contains("found")
            && (lower.contains("tool_use") || lower.contains("tool use")));
    if missing_thinking_prefix {
        return Some(THINKING_TRIGGER_MISSING_THINKING_PREFIX);
    }

    if lower.contains("invalid")
        && lower.contains("signature")
        && lower.contains("thinking")
        && lower.contains("block")
    {
        return Some(THINKING_TRIGGER_STALE_SIGNATURE);
    }

    if error_message.contains("非法请求")
        || lower.contains("illegal request")
        || lower.contains("invalid request")
    {
        return Some(THINKING_TRIGGER_GENERIC_INVALID_REQUEST);
    }

    None
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThinkingStripOutcome {
    pub applied: bool,
    pub removed_thinking_blocks: usize,
    pub removed_redacted_thinking_blocks: usize,
    pub removed_signature_fields: usize,
    pub removed_top_level_thinking: bool,
}

/// Removes `thinking`/`redacted_thinking` blocks and stray `signature`
/// fields from an Anthropic messages request. Also drops the top-level
/// `thinking` object when it is enabled but the final assistant message
/// jumps straight to `tool_use`, which upstreams reject with a 400.
pub fn strip_thinking_signatures(root: &mut Value) -> ThinkingStripOutcome {
    let mut outcome = ThinkingStripOutcome::default();
    let Some(root_obj) = root.as_object_mut() else {
        return outcome;
    };

    let thinking_enabled = root_obj
        .get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(|t| t.as_str())
        == Some("enabled");

    let mut drop_top_level_thinking = false;
    if let Some(messages) = root_obj.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages.iter_mut() {
            let Some(content) = message.get_mut("content").and_then(|v| v.as_array_mut())
            else {
                continue;
            };

            let mut kept: Vec<Value> = Vec::with_capacity(content.len());
            for mut block in std::mem::take(content) {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("thinking") => {
                        outcome.removed_thinking_blocks += 1;
                        outcome.applied = true;
                    }
                    Some("redacted_thinking") => {
                        outcome.removed_redacted_thinking_blocks += 1;
                        outcome.applied = true;
                    }
                    _ => {
                        if let Some(obj) = block.as_object_mut() {
                            if obj.remove("signature").is_some() {
                                outcome.removed_signature_fields += 1;
                                outcome.applied = true;
                            }
                        }
                        kept.push(block);
                    }
                }
            }
            *content = kept;
        }

        if thinking_enabled {
            drop_top_level_thinking = last_assistant_lacks_thinking_prefix(messages);
        }
    }

    if drop_top_level_thinking && root_obj.remove("thinking").is_some() {
        outcome.removed_top_level_thinking = true;
        outcome.applied = true;
    }

    outcome
}

/// True when the last assistant message opens with something other than a
/// thinking block while also using a tool.
fn last_assistant_lacks_thinking_prefix(messages: &[Value]) -> bool {
    let Some(content) = messages.iter().rev().find_map(|message| {
        if message.get("role").and_then(|r| r.as_str()) != Some("assistant") {
            return None;
        }
        message.get("content").and_then(|c| c.as_array())
    }) else {
        return false;
    };

    let first_type = content
        .first()
        .and_then(|b| b.get("type"))
        .and_then(|t| t.as_str());
    if content.is_empty() || matches!(first_type, Some("thinking") | Some("redacted_thinking")) {
        return false;
    }

    content
        .iter()
        .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
}

// ---- warmup interception ----

/// Detects Claude Code's startup warmup: POST /v1/messages with exactly one
/// user message holding a single ephemeral-cached text block saying "warmup".
pub fn is_anthropic_warmup_request(forwarded_path: &str, body_bytes: &[u8]) -> bool {
    if forwarded_path != "/v1/messages" {
        return false;
    }
    let Ok(root) = serde_json::from_slice::<Value>(body_bytes) else {
        return false;
    };

    let Some(messages) = root.get("messages").and_then(|v| v.as_array()) else {
        return false;
    };
    if messages.len() != 1 {
        return false;
    }
    let Some(message) = messages.first().and_then(|v| v.as_object()) else {
        return false;
    };
    if message.get("role").and_then(|v| v.as_str()) != Some("user") {
        return false;
    }

    let Some(content) = message.get("content").and_then(|v| v.as_array()) else {
        return false;
    };
    if content.len() != 1 {
        return false;
    }
    let Some(block) = content.first().and_then(|v| v.as_object()) else {
        return false;
    };
    if block.get("type").and_then(|v| v.as_str()) != Some("text") {
        return false;
    }

    let text = block
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if text != "warmup" {
        return false;
    }

    block
        .get("cache_control")
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
        == Some("ephemeral")
}

pub fn build_warmup_response_body(model: Option<&str>, trace_id: &str) -> Value {
    json!({
        "model": model.unwrap_or("unknown"),
        "id": format!("msg_gw_{trace_id}"),
        "type": "message",
        "role": "assistant",
        "content": [
            { "type": "text", "text": "I'm ready to help you." }
        ],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {
            "input_tokens": 0,
            "output_tokens": 0,
            "cache_creation_input_tokens": 0,
            "cache_read_input_tokens": 0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RectifierConfig {
        RectifierConfig::default()
    }

    #[test]
    fn strips_utf8_bom() {
        let body = Bytes::from([&[0xef, 0xbb, 0xbf], br#"{"ok":true}"#.as_slice()].concat());
        let out = rectify_json_body(body, &config());
        assert_eq!(out.body.as_ref(), br#"{"ok":true}"#);
        assert_eq!(out.applied, vec!["encoding"]);
        assert_eq!(out.header_value(), "applied");
    }

    #[test]
    fn valid_body_passes_through_untouched() {
        let body = Bytes::from_static(br#"{"ok":true}"#);
        let out = rectify_json_body(body.clone(), &config());
        assert_eq!(out.body, body);
        assert!(out.applied.is_empty());
        assert_eq!(out.header_value(), "not-applied");
    }

    #[test]
    fn closes_truncated_object() {
        let body = Bytes::from_static(br#"{"message":{"content":"hi""#);
        let out = rectify_json_body(body, &config());
        assert_eq!(out.applied, vec!["json"]);
        let value: Value = serde_json::from_slice(out.body.as_ref()).expect("valid json");
        assert_eq!(value["message"]["content"], "hi");
    }

    #[test]
    fn fills_dangling_key_with_null() {
        let body = Bytes::from_static(br#"{"usage":"#);
        let out = rectify_json_body(body, &config());
        let value: Value = serde_json::from_slice(out.body.as_ref()).expect("valid json");
        assert!(value["usage"].is_null());
    }

    #[test]
    fn drops_trailing_comma_before_closing() {
        let body = Bytes::from_static(br#"{"a":1,"#);
        let out = rectify_json_body(body, &config());
        let value: Value = serde_json::from_slice(out.body.as_ref()).expect("valid json");
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn normalizes_sse_field_case_and_space() {
        let body = Bytes::from_static(b"Data:{\"x\":1}\n\ndata:{\"y\":2}\n\n");
        let out = rectify_sse_body(body, &config());
        assert!(out.applied.contains(&"sse"));
        assert_eq!(
            out.body.as_ref(),
            b"data: {\"x\":1}\n\ndata: {\"y\":2}\n\n"
        );
    }

    #[test]
    fn wraps_bare_json_lines_as_data() {
        let body = Bytes::from_static(b"{\"x\":1}\n\n");
        let out = rectify_sse_body(body, &config());
        assert_eq!(out.body.as_ref(), b"data: {\"x\":1}\n\n");
    }

    #[test]
    fn repairs_truncated_json_inside_data_line() {
        let body = Bytes::from_static(b"data: {\"delta\":{\"text\":\"hi\"\n\n");
        let out = rectify_sse_body(body, &config());
        assert!(out.applied.contains(&"json"));
        assert!(out.body.as_ref().starts_with(b"data: {\"delta\""));
        let payload = &out.body.as_ref()[6..];
        let line_end = payload.iter().position(|b| *b == b'\n').unwrap();
        assert!(serde_json::from_slice::<Value>(&payload[..line_end]).is_ok());
    }

    #[test]
    fn leaves_done_sentinel_alone() {
        let body = Bytes::from_static(b"data: [DONE]\n\n");
        let out = rectify_sse_body(body.clone(), &config());
        assert_eq!(out.body, body);
        assert!(!out.applied.contains(&"json"));
    }

    #[test]
    fn thinking_trigger_detects_stale_signature_phrasings() {
        assert_eq!(
            detect_thinking_signature_trigger(
                "messages.1.content.0: Invalid `signature` in `thinking` block"
            ),
            Some(THINKING_TRIGGER_STALE_SIGNATURE)
        );
        assert_eq!(
            detect_thinking_signature_trigger(
                "Expected `thinking` or `redacted_thinking`, but found `tool_use`. When \
                 `thinking` is enabled, a final `assistant` message must start with a thinking \
                 block."
            ),
            Some(THINKING_TRIGGER_MISSING_THINKING_PREFIX)
        );
        assert_eq!(
            detect_thinking_signature_trigger("invalid request: malformed JSON"),
            Some(THINKING_TRIGGER_GENERIC_INVALID_REQUEST)
        );
        assert_eq!(
            detect_thinking_signature_trigger("非法请求"),
            Some(THINKING_TRIGGER_GENERIC_INVALID_REQUEST)
        );
        assert_eq!(detect_thinking_signature_trigger("Request timeout"), None);
        assert_eq!(detect_thinking_signature_trigger("   "), None);
    }

    #[test]
    fn strip_removes_thinking_blocks_and_signature_fields() {
        let mut root = json!({
            "model": "claude-sonnet-4",
            "messages": [
                {
                    "role": "assistant",
                    "content": [
                        { "type": "thinking", "thinking": "t", "signature": "sig1" },
                        { "type": "text", "text": "hello", "signature": "sig2" },
                        { "type": "tool_use", "id": "toolu_1", "name": "search",
                          "input": { "q": "x" }, "signature": "sig3" },
                        { "type": "redacted_thinking", "data": "r" }
                    ]
                },
                { "role": "user", "content": [ { "type": "text", "text": "hi" } ] }
            ]
        });

        let outcome = strip_thinking_signatures(&mut root);
        assert!(outcome.applied);
        assert_eq!(outcome.removed_thinking_blocks, 1);
        assert_eq!(outcome.removed_redacted_thinking_blocks, 1);
        assert_eq!(outcome.removed_signature_fields, 2);

        let content = root["messages"][0]["content"].as_array().expect("array");
        let types: Vec<_> = content.iter().map(|b| b["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["text", "tool_use"]);
        assert!(content.iter().all(|b| b.get("signature").is_none()));
    }

    #[test]
    fn strip_without_messages_changes_nothing() {
        let mut root = json!({ "model": "claude-sonnet-4" });
        let outcome = strip_thinking_signatures(&mut root);
        assert!(!outcome.applied);
    }

    #[test]
    fn strip_drops_enabled_thinking_when_assistant_leads_with_tool_use() {
        let mut root = json!({
            "model": "claude-sonnet-4",
            "thinking": { "type": "enabled", "budget_tokens": 1024 },
            "messages": [
                {
                    "role": "assistant",
                    "content": [
                        { "type": "tool_use", "id": "toolu_1", "name": "search",
                          "input": { "q": "x" } }
                    ]
                },
                {
                    "role": "user",
                    "content": [
                        { "type": "tool_result", "tool_use_id": "toolu_1", "content": "ok" }
                    ]
                }
            ]
        });

        let outcome = strip_thinking_signatures(&mut root);
        assert!(outcome.applied);
        assert!(outcome.removed_top_level_thinking);
        assert!(root.get("thinking").is_none());
    }

    #[test]
    fn warmup_detection_requires_exact_shape() {
        let warmup = serde_json::to_vec(&json!({
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "text",
                    "text": " Warmup ",
                    "cache_control": { "type": "ephemeral" }
                }]
            }]
        }))
        .unwrap();

        assert!(is_anthropic_warmup_request("/v1/messages", &warmup));
        assert!(!is_anthropic_warmup_request("/v1/chat/completions", &warmup));

        let not_warmup = serde_json::to_vec(&json!({
            "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hello" }] }]
        }))
        .unwrap();
        assert!(!is_anthropic_warmup_request("/v1/messages", &not_warmup));
    }

    #[test]
    fn warmup_response_echoes_model_and_trace() {
        let body = build_warmup_response_body(Some("claude-sonnet-4"), "123-1");
        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["id"], "msg_gw_123-1");
        assert_eq!(body["usage"]["input_tokens"], 0);
    }
}
