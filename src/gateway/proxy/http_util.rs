//! Low-level HTTP helpers shared by the proxy handler and stream tees.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::io::Read;

pub(in crate::gateway) fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

pub(super) fn has_gzip_content_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|enc| !enc.is_empty())
                .any(|enc| enc.eq_ignore_ascii_case("gzip"))
        })
        .unwrap_or(false)
}

pub(super) fn has_non_identity_content_encoding(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .any(|enc| !enc.eq_ignore_ascii_case("identity"))
}

/// Decompresses a buffered gzip body so usage parsing and the response fixer
/// can see JSON. Falls back to the original bytes when the output would
/// exceed `max_output_bytes` or the stream is unreadable from the start; a
/// truncated gzip stream still yields the bytes decoded so far.
pub(super) fn maybe_gunzip_response_body_bytes_with_limit(
    body: Bytes,
    headers: &mut HeaderMap,
    max_output_bytes: usize,
) -> Bytes {
    if !has_gzip_content_encoding(headers) {
        return body;
    }

    if body.is_empty() {
        headers.remove(header::CONTENT_ENCODING);
        headers.remove(header::CONTENT_LENGTH);
        return body;
    }

    let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
    let mut out: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut had_any_output = false;
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                had_any_output = true;
                if out.len().saturating_add(n) > max_output_bytes {
                    return body;
                }
                out.extend_from_slice(&buf[..n]);
            }
            Err(_) => {
                if !had_any_output {
                    return body;
                }
                break;
            }
        }
    }

    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
    Bytes::from(out)
}

pub(in crate::gateway) fn build_response(
    status: StatusCode,
    headers: &HeaderMap,
    trace_id: &str,
    body: Body,
) -> Response {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder = builder.header("x-trace-id", trace_id);

    match builder.body(body) {
        Ok(r) => r,
        Err(_) => {
            let mut fallback =
                (StatusCode::INTERNAL_SERVER_ERROR, "GW_RESPONSE_BUILD_ERROR").into_response();
            fallback.headers_mut().insert(
                "x-trace-id",
                HeaderValue::from_str(trace_id).unwrap_or(HeaderValue::from_static("unknown")),
            );
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_stream_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "Text/Event-Stream; charset=utf-8".parse().unwrap(),
        );
        assert!(is_event_stream(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn content_encoding_checks() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        assert!(has_gzip_content_encoding(&headers));
        assert!(has_non_identity_content_encoding(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "identity".parse().unwrap());
        assert!(!has_gzip_content_encoding(&headers));
        assert!(!has_non_identity_content_encoding(&headers));

        assert!(!has_non_identity_content_encoding(&HeaderMap::new()));
    }

    #[test]
    fn gunzip_strips_encoding_headers() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let gz = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, "11".parse().unwrap());

        let out =
            maybe_gunzip_response_body_bytes_with_limit(Bytes::from(gz), &mut headers, 1024 * 1024);
        assert_eq!(out.as_ref(), b"{\"ok\":true}");
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn gunzip_returns_original_on_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let body = Bytes::from_static(b"not gzip at all");
        let out = maybe_gunzip_response_body_bytes_with_limit(body.clone(), &mut headers, 1024);
        assert_eq!(out, body);
        // Headers stay untouched when we give up.
        assert!(headers.get(header::CONTENT_ENCODING).is_some());
    }

    #[test]
    fn build_response_carries_trace_header() {
        let resp = build_response(
            StatusCode::OK,
            &HeaderMap::new(),
            "t-42",
            Body::from("hello"),
        );
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-trace-id").unwrap(), "t-42");
    }
}
