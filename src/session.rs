//! Session affinity cache.
//!
//! Binds `(cli_key, session_id)` to the provider that last served the
//! conversation so follow-up turns land on the same upstream (prompt caches
//! stay warm). Bindings are in-memory only, TTL-bounded, and capacity-capped.

use axum::http::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

const DEFAULT_SESSION_TTL_SECS: i64 = 300;
const MAX_SESSION_ID_LEN: usize = 256;
const MAX_BINDINGS: usize = 5000;
const SESSION_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveSessionSnapshot {
    pub cli_key: String,
    pub session_id: String,
    pub session_suffix: String,
    pub provider_id: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
struct SessionBinding {
    provider_id: i64,
    sort_mode_id: Option<i64>,
    expires_at: i64,
}

#[derive(Debug)]
pub struct SessionAffinity {
    ttl_secs: i64,
    bindings: Mutex<HashMap<(String, String), SessionBinding>>,
}

impl Default for SessionAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Best-effort session id from headers and request JSON. Falls back to a
    /// deterministic hash of stable client headers so CLIs that send no id at
    /// all still get affinity.
    pub fn extract_session_id(headers: &HeaderMap, root: Option<&Value>) -> Option<String> {
        for header in ["session_id", "x-session-id"] {
            if let Some(id) = header_string(headers, header).and_then(|v| sanitize_session_id(&v))
            {
                return Some(id);
            }
        }

        if let Some(root) = root {
            for key in ["session_id", "conversation_id", "thread_id", "chat_id"] {
                if let Some(id) = root
                    .get(key)
                    .and_then(|v| v.as_str())
                    .and_then(sanitize_session_id)
                {
                    return Some(id);
                }
            }

            // Codex sends a UUID-like prompt_cache_key; short values are
            // model aliases, not session ids.
            if let Some(id) = root.get("prompt_cache_key").and_then(|v| v.as_str()) {
                let trimmed = id.trim();
                if trimmed.len() > 20 {
                    if let Some(id) = sanitize_session_id(trimmed) {
                        return Some(id);
                    }
                }
            }

            if let Some(meta) = root.get("metadata").and_then(|v| v.as_object()) {
                if let Some(id) = meta
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .and_then(sanitize_session_id)
                {
                    return Some(id);
                }

                // Claude Code encodes the session inside metadata.user_id.
                if let Some(user_id) = meta.get("user_id").and_then(|v| v.as_str()) {
                    let marker = "_session_";
                    if let Some(idx) = user_id.find(marker) {
                        if let Some(id) = sanitize_session_id(&user_id[idx + marker.len()..]) {
                            return Some(id);
                        }
                    }
                }
            }

            if let Some(prev) = root
                .get("previous_response_id")
                .and_then(|v| v.as_str())
                .and_then(sanitize_session_id)
            {
                return sanitize_session_id(&format!("codex_prev_{prev}"));
            }
        }

        deterministic_session_id(headers).and_then(|id| sanitize_session_id(&id))
    }

    pub fn get_bound_provider(
        &self,
        cli_key: &str,
        session_id: &str,
        now_unix: i64,
    ) -> Option<i64> {
        let key = (cli_key.to_string(), session_id.to_string());
        let mut guard = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(&key) {
            Some(binding) if binding.expires_at > now_unix => {
                (binding.provider_id > 0).then_some(binding.provider_id)
            }
            Some(_) => {
                guard.remove(&key);
                None
            }
            None => None,
        }
    }

    /// `Some(bound_mode)` when a live binding exists, even if the bound mode
    /// itself is `None` (config order).
    pub fn get_bound_sort_mode_id(
        &self,
        cli_key: &str,
        session_id: &str,
        now_unix: i64,
    ) -> Option<Option<i64>> {
        let key = (cli_key.to_string(), session_id.to_string());
        let mut guard = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(&key) {
            Some(binding) if binding.expires_at > now_unix => Some(binding.sort_mode_id),
            Some(_) => {
                guard.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Binds (or refreshes) the session to the provider that just completed
    /// a successful response.
    pub fn bind_success(
        &self,
        cli_key: &str,
        session_id: &str,
        provider_id: i64,
        sort_mode_id: Option<i64>,
        now_unix: i64,
    ) {
        if cli_key.trim().is_empty() || session_id.trim().is_empty() || provider_id <= 0 {
            return;
        }

        let key = (cli_key.to_string(), session_id.to_string());
        let mut guard = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= MAX_BINDINGS {
            drop_expired(&mut guard, now_unix);
            if guard.len() >= MAX_BINDINGS {
                guard.clear();
            }
        }

        let expires_at = now_unix.saturating_add(self.ttl_secs.max(1));
        if let Some(existing) = guard.get_mut(&key) {
            if existing.expires_at > now_unix {
                existing.provider_id = provider_id;
                existing.expires_at = expires_at;
                if existing.sort_mode_id.is_none() {
                    existing.sort_mode_id = sort_mode_id;
                }
                return;
            }
            guard.remove(&key);
        }

        guard.insert(
            key,
            SessionBinding {
                provider_id,
                sort_mode_id,
                expires_at,
            },
        );
    }

    pub fn list_active(&self, now_unix: i64, limit: usize) -> Vec<ActiveSessionSnapshot> {
        if limit == 0 {
            return Vec::new();
        }

        let mut guard = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        drop_expired(&mut guard, now_unix);

        let mut rows: Vec<ActiveSessionSnapshot> = guard
            .iter()
            .map(|((cli_key, session_id), v)| ActiveSessionSnapshot {
                cli_key: cli_key.clone(),
                session_id: session_id.clone(),
                session_suffix: session_suffix(session_id),
                provider_id: v.provider_id,
                expires_at: v.expires_at,
            })
            .collect();

        rows.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        rows.truncate(limit);
        rows
    }
}

fn header_string(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn deterministic_session_id(headers: &HeaderMap) -> Option<String> {
    let api_key_prefix = header_string(headers, "x-api-key")
        .or_else(|| header_string(headers, "x-goog-api-key"))
        .and_then(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            let prefix: String = trimmed.chars().take(10).collect();
            sanitize_deterministic_part(&prefix)
        });

    let user_agent =
        header_string(headers, "user-agent").and_then(|v| sanitize_deterministic_part(&v));

    let forwarded_for = header_string(headers, "x-forwarded-for").and_then(|raw| {
        raw.split(',')
            .map(str::trim)
            .find(|v| !v.is_empty())
            .and_then(sanitize_deterministic_part)
    });
    let real_ip = header_string(headers, "x-real-ip").and_then(|v| sanitize_deterministic_part(&v));
    let ip = forwarded_for.or(real_ip);

    let parts: Vec<String> = [user_agent, ip, api_key_prefix]
        .into_iter()
        .flatten()
        .collect();
    if parts.is_empty() {
        return None;
    }

    let joined = parts.join(":");
    let hash = Sha256::digest(joined.as_bytes());
    let hex = format!("{hash:x}");
    let short = hex.get(..32)?;
    Some(format!("sess_{short}"))
}

fn sanitize_deterministic_part(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut out = trimmed.to_string();
    out.retain(|c| c != '\n' && c != '\r' && c != '\t');
    if out.is_empty() {
        return None;
    }
    Some(out)
}

fn sanitize_session_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut out = if trimmed.len() > MAX_SESSION_ID_LEN {
        trimmed[..MAX_SESSION_ID_LEN].to_string()
    } else {
        trimmed.to_string()
    };
    // Strip control whitespace so a logged id cannot inject lines.
    out.retain(|c| c != '\n' && c != '\r' && c != '\t');
    if out.is_empty() {
        return None;
    }
    Some(out)
}

fn session_suffix(session_id: &str) -> String {
    let suffix: Vec<char> = session_id.chars().rev().take(SESSION_SUFFIX_LEN).collect();
    suffix.into_iter().rev().collect()
}

fn drop_expired(map: &mut HashMap<(String, String), SessionBinding>, now_unix: i64) {
    map.retain(|_, v| v.expires_at > now_unix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bind_and_lookup_within_ttl() {
        let sessions = SessionAffinity::new();
        sessions.bind_success("claude", "sess-a", 7, Some(10), 1_000);

        assert_eq!(
            sessions.get_bound_provider("claude", "sess-a", 1_100),
            Some(7)
        );
        assert_eq!(
            sessions.get_bound_sort_mode_id("claude", "sess-a", 1_100),
            Some(Some(10))
        );
        // TTL is 300s.
        assert_eq!(sessions.get_bound_provider("claude", "sess-a", 1_300), None);
    }

    #[test]
    fn bindings_are_scoped_per_cli_key() {
        let sessions = SessionAffinity::new();
        sessions.bind_success("claude", "sess-a", 7, None, 1_000);
        assert_eq!(sessions.get_bound_provider("codex", "sess-a", 1_001), None);
    }

    #[test]
    fn rebind_moves_provider_and_keeps_sort_mode() {
        let sessions = SessionAffinity::new();
        sessions.bind_success("claude", "sess-a", 7, Some(10), 1_000);
        sessions.bind_success("claude", "sess-a", 9, None, 1_010);

        assert_eq!(
            sessions.get_bound_provider("claude", "sess-a", 1_020),
            Some(9)
        );
        assert_eq!(
            sessions.get_bound_sort_mode_id("claude", "sess-a", 1_020),
            Some(Some(10))
        );
    }

    #[test]
    fn extract_prefers_headers_over_body() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "header-session".parse().unwrap());
        let body = json!({ "session_id": "body-session" });

        assert_eq!(
            SessionAffinity::extract_session_id(&headers, Some(&body)),
            Some("header-session".to_string())
        );
    }

    #[test]
    fn extract_from_metadata_user_id_marker() {
        let headers = HeaderMap::new();
        let body = json!({
            "metadata": { "user_id": "user_abc_session_deadbeef-1234" }
        });

        assert_eq!(
            SessionAffinity::extract_session_id(&headers, Some(&body)),
            Some("deadbeef-1234".to_string())
        );
    }

    #[test]
    fn extract_ignores_short_prompt_cache_key() {
        let headers = HeaderMap::new();
        let body = json!({ "prompt_cache_key": "gpt-5" });
        assert_eq!(SessionAffinity::extract_session_id(&headers, Some(&body)), None);
    }

    #[test]
    fn deterministic_fallback_is_stable() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "claude-cli/1.0".parse().unwrap());
        headers.insert("x-api-key", "sk-ant-1234567890".parse().unwrap());

        let a = SessionAffinity::extract_session_id(&headers, None).expect("id");
        let b = SessionAffinity::extract_session_id(&headers, None).expect("id");
        assert_eq!(a, b);
        assert!(a.starts_with("sess_"));
        assert_eq!(a.len(), "sess_".len() + 32);
    }

    #[test]
    fn list_active_sorts_newest_first() {
        let sessions = SessionAffinity::new();
        sessions.bind_success("claude", "sess-a", 1, None, 1_000);
        sessions.bind_success("claude", "sess-b", 2, None, 1_050);

        let rows = sessions.list_active(1_060, 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].session_id, "sess-b");
        assert_eq!(rows[0].session_suffix, "sess-b");
    }
}
