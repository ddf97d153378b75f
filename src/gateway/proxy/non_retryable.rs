//! Error-body scan for non-retryable client input errors.
//!
//! A 400 caused by the client's own request (prompt over the context limit,
//! schema validation, content filter) will fail identically on every
//! provider. Matching it here aborts the failover loop early and keeps the
//! failure out of the circuit accounting.

const MAX_SCAN_BYTES: usize = 64 * 1024;

/// Whether the error body is worth buffering for a scan. Statuses with
/// dedicated handling (auth switch, 404 switch, 408/429 backoff) and
/// oversized bodies are skipped.
pub(super) fn should_attempt_non_retryable_match(status: u16, content_length: Option<u64>) -> bool {
    if !(400..=499).contains(&status) {
        return false;
    }
    if matches!(status, 401 | 402 | 403 | 404 | 408 | 429) {
        return false;
    }
    if let Some(len) = content_length {
        if len > MAX_SCAN_BYTES as u64 {
            return false;
        }
    }
    true
}

struct BodyRule {
    id: &'static str,
    any_of: &'static [&'static str],
    all_of: &'static [&'static str],
}

impl BodyRule {
    fn matches(&self, haystack_lower: &str) -> bool {
        if !self.all_of.iter().all(|n| haystack_lower.contains(n)) {
            return false;
        }
        self.any_of.is_empty() || self.any_of.iter().any(|n| haystack_lower.contains(n))
    }
}

// Kept deliberately conservative: a false positive here silently disables
// failover for the request.
const NON_RETRYABLE_RULES: &[BodyRule] = &[
    BodyRule {
        id: "parameter_alt_sse",
        any_of: &["alt=sse"],
        all_of: &[],
    },
    BodyRule {
        id: "prompt_limit",
        any_of: &["prompt is too long", "prompt too long"],
        all_of: &[],
    },
    BodyRule {
        id: "input_limit",
        any_of: &["input is too long", "content_length_exceeds_threshold"],
        all_of: &[],
    },
    BodyRule {
        id: "token_limit",
        any_of: &["max_tokens", "maximum tokens", "max tokens"],
        all_of: &["exceed"],
    },
    BodyRule {
        id: "context_limit",
        any_of: &[
            "context window",
            "context length",
            "pricing plan does not include long context",
        ],
        all_of: &[],
    },
    BodyRule {
        id: "content_filter",
        any_of: &["content filter", "blocked by content filter"],
        all_of: &[],
    },
    BodyRule {
        id: "validation_exception",
        any_of: &["validationexception"],
        all_of: &[],
    },
    BodyRule {
        id: "validation_tool_use_ids_unique",
        any_of: &["tool_use", "tool names must be unique"],
        all_of: &["must be unique"],
    },
    BodyRule {
        id: "validation_message_non_empty",
        any_of: &["all messages must have non-empty content"],
        all_of: &[],
    },
    BodyRule {
        id: "validation_server_tool_use_id",
        any_of: &["server_tool_use", "srvtoolu_"],
        all_of: &["match pattern"],
    },
    BodyRule {
        id: "validation_tool_use_id_in_tool_result",
        any_of: &["tool_use_id", "tool_result"],
        all_of: &["unexpected"],
    },
    BodyRule {
        id: "validation_tool_result_missing_tool_use",
        any_of: &["tool_result"],
        all_of: &["tool_use", "corresponding"],
    },
    BodyRule {
        id: "validation_tool_use_missing_tool_result",
        any_of: &["tool_use"],
        all_of: &["tool_result", "next message"],
    },
    BodyRule {
        id: "parameter_missing_model",
        any_of: &["model is required"],
        all_of: &[],
    },
    BodyRule {
        id: "parameter_missing_or_extra",
        any_of: &[
            "missing required parameter",
            "extra inputs",
            "not permitted",
        ],
        all_of: &[],
    },
    BodyRule {
        id: "signature_field_required",
        any_of: &["field required"],
        all_of: &["signature"],
    },
    BodyRule {
        id: "pdf_limit",
        any_of: &["pdf has too many pages"],
        all_of: &[],
    },
    BodyRule {
        id: "media_limit",
        any_of: &["too much media"],
        all_of: &[],
    },
    BodyRule {
        id: "thinking_error_missing_block_prefix",
        any_of: &["must start with a thinking block"],
        all_of: &[],
    },
    BodyRule {
        id: "thinking_error_expected_block",
        any_of: &["expected"],
        all_of: &["thinking", "tool_use"],
    },
    BodyRule {
        id: "cache_limit",
        any_of: &["cache_control"],
        all_of: &["block", "limit"],
    },
    BodyRule {
        id: "image_size_limit",
        any_of: &["image exceeds"],
        all_of: &["maximum", "bytes"],
    },
    BodyRule {
        id: "thinking_error_reasoning_effort",
        any_of: &["unsupported value"],
        all_of: &["supported values", "model"],
    },
];

/// Returns the matched rule id when the error body identifies a client input
/// error no provider can fix.
pub(super) fn match_non_retryable_client_error(status: u16, body: &[u8]) -> Option<&'static str> {
    if !should_attempt_non_retryable_match(status, Some(body.len() as u64)) {
        return None;
    }
    if body.is_empty() {
        return None;
    }

    let scan = &body[..body.len().min(MAX_SCAN_BYTES)];
    let haystack_lower = String::from_utf8_lossy(scan).to_ascii_lowercase();
    NON_RETRYABLE_RULES
        .iter()
        .find(|rule| rule.matches(&haystack_lower))
        .map(|rule| rule.id)
}
