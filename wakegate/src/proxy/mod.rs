//! Proxy Engine (spec §4.6, §4.7): HTTP forwarding and WebSocket bridging.

pub mod http;
pub mod ws;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Headers whose scope is a single network hop; never forwarded across the
/// proxy (spec glossary).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Strip CR and LF bytes from a header value — CRLF-injection defense
/// (spec §4.6 rule 2).
pub fn sanitize_header_value(value: &HeaderValue) -> Option<HeaderValue> {
    let bytes = value.as_bytes();
    if !bytes.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Some(value.clone());
    }
    let cleaned: Vec<u8> = bytes.iter().copied().filter(|&b| b != b'\r' && b != b'\n').collect();
    HeaderValue::from_bytes(&cleaned).ok()
}

/// Copy all non-hop-by-hop headers from `src` into `dst`, CRLF-sanitizing
/// every value, preserving repeated headers (e.g. cookies) with the same
/// multiplicity.
pub fn copy_forwarded_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        if is_hop_by_hop(name) || name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if let Some(clean) = sanitize_header_value(value) {
            dst.append(name.clone(), clean);
        }
    }
}

pub fn extract_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
