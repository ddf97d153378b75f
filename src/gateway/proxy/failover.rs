//! Failover decisions and retry pacing.

use std::time::Duration;

/// What the loop does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FailoverDecision {
    /// Try the same provider again (until its per-provider attempt cap).
    RetrySame,
    /// Move on to the next provider in the trial order.
    SwitchProvider,
    /// Stop the loop and return the upstream response as-is.
    Abort,
}

impl FailoverDecision {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::RetrySame => "retry",
            Self::SwitchProvider => "switch",
            Self::Abort => "abort",
        }
    }
}

const RETRY_BACKOFF_STEP_MS: u64 = 80;
const RETRY_BACKOFF_CAP_MS: u64 = 800;

/// Linear backoff before re-hitting the same provider after a 408/429.
/// Other retryable statuses retry immediately: a 5xx is usually a different
/// backend instance behind the same base URL.
pub(super) fn retry_backoff_delay(status: u16, retry_index: u32) -> Option<Duration> {
    if !matches!(status, 408 | 429) {
        return None;
    }

    let millis = (RETRY_BACKOFF_STEP_MS.saturating_mul(u64::from(retry_index)))
        .min(RETRY_BACKOFF_CAP_MS);
    (millis > 0).then(|| Duration::from_millis(millis))
}

/// Session affinity only applies to requests that continue a conversation.
/// A first message carries a single entry; follow-ups carry history.
pub(super) fn should_reuse_provider(body_json: Option<&serde_json::Value>) -> bool {
    let Some(root) = body_json else {
        return false;
    };

    for key in ["messages", "input", "contents"] {
        if let Some(len) = root.get(key).and_then(|v| v.as_array()).map(|a| a.len()) {
            return len > 1;
        }
    }

    // Gemini wraps the turn list one level down.
    if let Some(len) = root
        .get("request")
        .and_then(|v| v.get("contents"))
        .and_then(|v| v.as_array())
        .map(|a| a.len())
    {
        return len > 1;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_only_for_rate_limit_statuses() {
        assert_eq!(retry_backoff_delay(500, 3), None);
        assert_eq!(retry_backoff_delay(502, 1), None);
        assert_eq!(
            retry_backoff_delay(429, 1),
            Some(Duration::from_millis(80))
        );
        assert_eq!(
            retry_backoff_delay(408, 3),
            Some(Duration::from_millis(240))
        );
    }

    #[test]
    fn backoff_caps_at_800ms() {
        assert_eq!(
            retry_backoff_delay(429, 50),
            Some(Duration::from_millis(800))
        );
    }

    #[test]
    fn backoff_skips_zero_delay() {
        assert_eq!(retry_backoff_delay(429, 0), None);
    }

    #[test]
    fn first_message_does_not_reuse_provider() {
        let body = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        assert!(!should_reuse_provider(Some(&body)));
    }

    #[test]
    fn conversation_history_reuses_provider() {
        let body = json!({ "messages": [
            { "role": "user", "content": "hi" },
            { "role": "assistant", "content": "hello" },
        ]});
        assert!(should_reuse_provider(Some(&body)));

        let gemini = json!({ "request": { "contents": [{}, {}] } });
        assert!(should_reuse_provider(Some(&gemini)));
    }

    #[test]
    fn missing_body_does_not_reuse_provider() {
        assert!(!should_reuse_provider(None));
        assert!(!should_reuse_provider(Some(&json!({ "model": "gpt-5" }))));
    }
}
