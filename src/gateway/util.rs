//! Shared helpers for the gateway: clocks, trace ids, URL building, header
//! rewriting, and request-body introspection.

use axum::http::{header, HeaderMap, HeaderValue};
use std::borrow::Cow;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub(super) const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
pub(super) const MAX_INTROSPECTION_BODY_BYTES: usize = 2 * 1024 * 1024;

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(super) fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(super) fn new_trace_id() -> String {
    let ts = now_unix_seconds();
    let seq = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{ts}-{seq}")
}

fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .any(|enc| enc.eq_ignore_ascii_case("gzip"))
        })
        .unwrap_or(false)
}

fn gunzip_with_limit(input: &[u8], max_output_bytes: usize) -> Result<Vec<u8>, String> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut out: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| format!("failed to gunzip request body: {e}"))?;
        if n == 0 {
            break;
        }
        if out.len().saturating_add(n) > max_output_bytes {
            return Err(format!(
                "request body gunzip exceeded limit: limit={max_output_bytes} bytes"
            ));
        }
        out.extend_from_slice(&buf[..n]);
    }

    Ok(out)
}

/// Returns the bytes to use for session/model introspection. CLIs may gzip
/// the request body; the decoded form is only used for parsing, the original
/// bytes still go upstream untouched.
pub(super) fn body_for_introspection<'a>(
    headers: &HeaderMap,
    body_bytes: &'a [u8],
) -> Cow<'a, [u8]> {
    if !is_gzip_encoded(headers) {
        return Cow::Borrowed(body_bytes);
    }

    match gunzip_with_limit(body_bytes, MAX_INTROSPECTION_BODY_BYTES) {
        Ok(decoded) => Cow::Owned(decoded),
        Err(_) => Cow::Borrowed(body_bytes),
    }
}

fn url_decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hi = bytes[i + 1];
                let lo = bytes[i + 2];
                let hex = |b: u8| -> Option<u8> {
                    match b {
                        b'0'..=b'9' => Some(b - b'0'),
                        b'a'..=b'f' => Some(b - b'a' + 10),
                        b'A'..=b'F' => Some(b - b'A' + 10),
                        _ => None,
                    }
                };

                if let (Some(hi), Some(lo)) = (hex(hi), hex(lo)) {
                    out.push(hi * 16 + lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).to_string()
}

fn sanitize_model(model: &str) -> Option<String> {
    let model = model.trim();
    if model.is_empty() {
        return None;
    }
    let model = if model.len() > 200 {
        model[..200].to_string()
    } else {
        model.to_string()
    };
    Some(model)
}

fn extract_model_from_query(query: &str) -> Option<String> {
    for part in query.split('&') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        if key != "model" {
            continue;
        }
        let decoded = url_decode_component(value);
        return sanitize_model(&decoded);
    }
    None
}

fn extract_model_from_path(path: &str) -> Option<String> {
    let needle = "/models/";
    let idx = path.find(needle)?;
    let rest = &path[idx + needle.len()..];
    if rest.is_empty() {
        return None;
    }

    let end = rest.find(['/', ':', '?']).unwrap_or(rest.len());
    sanitize_model(&rest[..end])
}

/// Best-effort requested model: JSON body first (`model` as string, or
/// `model.name` / `model.id` for Gemini-style objects), then `?model=`, then
/// a `/models/{name}` path segment.
pub(super) fn infer_requested_model(
    forwarded_path: &str,
    query: Option<&str>,
    body_json: Option<&serde_json::Value>,
) -> Option<String> {
    if let Some(value) = body_json {
        if let Some(model) = value.get("model") {
            if let Some(s) = model.as_str() {
                return sanitize_model(s);
            }
            if let Some(obj) = model.as_object() {
                if let Some(s) = obj.get("name").and_then(|v| v.as_str()) {
                    return sanitize_model(s);
                }
                if let Some(s) = obj.get("id").and_then(|v| v.as_str()) {
                    return sanitize_model(s);
                }
            }
        }
    }

    if let Some(q) = query {
        if let Some(model) = extract_model_from_query(q) {
            return Some(model);
        }
    }

    extract_model_from_path(forwarded_path)
}

pub(super) fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONNECTION);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
}

/// Joins a provider base URL with the forwarded path. When the base already
/// ends in `/v1` (or `/v1beta`) and the forwarded path starts with the same
/// prefix, the duplicate segment is dropped so clients configured against
/// either shape work.
pub(super) fn build_target_url(
    base_url: &str,
    forwarded_path: &str,
    query: Option<&str>,
) -> Result<reqwest::Url, String> {
    let mut url = reqwest::Url::parse(base_url).map_err(|e| format!("GW_INVALID_BASE_URL: {e}"))?;

    let base_path = url.path().trim_end_matches('/');
    let forwarded_path = if base_path.ends_with("/v1")
        && (forwarded_path == "/v1" || forwarded_path.starts_with("/v1/"))
    {
        forwarded_path.strip_prefix("/v1").unwrap_or(forwarded_path)
    } else if base_path.ends_with("/v1beta")
        && (forwarded_path == "/v1beta" || forwarded_path.starts_with("/v1beta/"))
    {
        forwarded_path
            .strip_prefix("/v1beta")
            .unwrap_or(forwarded_path)
    } else {
        forwarded_path
    };
    let mut combined_path = String::new();
    combined_path.push_str(base_path);
    combined_path.push_str(forwarded_path);

    if combined_path.is_empty() {
        combined_path.push('/');
    }
    if !combined_path.starts_with('/') {
        combined_path.insert(0, '/');
    }

    url.set_path(&combined_path);
    url.set_query(query);
    Ok(url)
}

/// Replaces any client-sent auth with the provider's key. Always overrides
/// so an official OAuth token never leaks to a third-party relay.
pub(super) fn inject_provider_auth(cli_key: &str, api_key: &str, headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
    headers.remove("x-goog-api-client");

    match cli_key {
        "codex" => {
            let value = format!("Bearer {api_key}");
            if let Ok(header_value) = HeaderValue::from_str(&value) {
                headers.insert(header::AUTHORIZATION, header_value);
            }
        }
        "claude" => {
            let value = format!("Bearer {api_key}");
            if let Ok(header_value) = HeaderValue::from_str(&value) {
                headers.insert(header::AUTHORIZATION, header_value);
            }
            if let Ok(header_value) = HeaderValue::from_str(api_key) {
                headers.insert("x-api-key", header_value);
            }
            if !headers.contains_key("anthropic-version") {
                headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            }
        }
        "gemini" => {
            // A `ya29.`-prefixed value or a JSON credential blob means OAuth;
            // anything else is a plain API key.
            let trimmed = api_key.trim();
            let oauth_access_token = if trimmed.starts_with("ya29.") {
                Some(trimmed.to_string())
            } else if trimmed.starts_with('{') {
                serde_json::from_str::<serde_json::Value>(trimmed)
                    .ok()
                    .and_then(|v| {
                        v.get("access_token")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    })
            } else {
                None
            };

            if let Some(token) = oauth_access_token {
                let value = format!("Bearer {token}");
                if let Ok(header_value) = HeaderValue::from_str(&value) {
                    headers.insert(header::AUTHORIZATION, header_value);
                }
                if !headers.contains_key("x-goog-api-client") {
                    headers
                        .insert("x-goog-api-client", HeaderValue::from_static("GeminiCLI/1.0"));
                }
            } else if let Ok(header_value) = HeaderValue::from_str(trimmed) {
                headers.insert("x-goog-api-key", header_value);
            }
        }
        _ => {}
    }
}

pub(super) fn ensure_cli_required_headers(cli_key: &str, headers: &mut HeaderMap) {
    if cli_key == "claude" && !headers.contains_key("anthropic-version") {
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_target_url_dedups_v1_prefix() {
        let url = build_target_url("https://api.example.com/v1", "/v1/messages", None).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/messages");

        let url = build_target_url("https://api.example.com", "/v1/messages", None).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/messages");
    }

    #[test]
    fn build_target_url_dedups_v1beta_prefix() {
        let url = build_target_url(
            "https://gen.example.com/v1beta",
            "/v1beta/models/gemini-pro:streamGenerateContent",
            Some("alt=sse"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://gen.example.com/v1beta/models/gemini-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn build_target_url_rejects_invalid_base() {
        assert!(build_target_url("not a url", "/v1/messages", None).is_err());
    }

    #[test]
    fn infer_model_prefers_body_then_query_then_path() {
        let body = json!({ "model": "claude-sonnet-4" });
        assert_eq!(
            infer_requested_model("/v1/messages", None, Some(&body)),
            Some("claude-sonnet-4".to_string())
        );

        assert_eq!(
            infer_requested_model("/v1/responses", Some("model=gpt-5"), None),
            Some("gpt-5".to_string())
        );

        assert_eq!(
            infer_requested_model("/v1beta/models/gemini-pro:generateContent", None, None),
            Some("gemini-pro".to_string())
        );
    }

    #[test]
    fn infer_model_reads_gemini_object_form() {
        let body = json!({ "model": { "name": "gemini-2.5-pro" } });
        assert_eq!(
            infer_requested_model("/v1beta/x", None, Some(&body)),
            Some("gemini-2.5-pro".to_string())
        );
    }

    #[test]
    fn inject_auth_overrides_client_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk-official".parse().unwrap());

        inject_provider_auth("claude", "sk-relay-key", &mut headers);
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer sk-relay-key"
        );
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-relay-key");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn inject_auth_gemini_oauth_vs_api_key() {
        let mut headers = HeaderMap::new();
        inject_provider_auth("gemini", "ya29.token", &mut headers);
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer ya29.token");
        assert_eq!(headers.get("x-goog-api-client").unwrap(), "GeminiCLI/1.0");

        let mut headers = HeaderMap::new();
        inject_provider_auth("gemini", "AIza-plain-key", &mut headers);
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "AIza-plain-key");
    }

    #[test]
    fn introspection_body_gunzips_gzipped_requests() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"model\":\"gpt-5\"}").unwrap();
        let gz = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let decoded = body_for_introspection(&headers, &gz);
        assert_eq!(decoded.as_ref(), b"{\"model\":\"gpt-5\"}");
    }

    #[test]
    fn trace_ids_are_unique() {
        let a = new_trace_id();
        let b = new_trace_id();
        assert_ne!(a, b);
    }
}
