//! Header manipulation for forwarded exchanges.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//! - Carry trailer announcements across the proxy
//!
//! # Design Decisions
//! - Headers named by `Connection` are stripped along with the fixed set, so a
//!   client cannot smuggle a header past the proxy by declaring it hop-by-hop
//! - Prior X-Forwarded-For values are kept and the client IP appended
//! - `HeaderMap` is the ordered, case-insensitive multimap for every stage

use std::net::IpAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Connection-scoped headers that never cross the proxy.
pub const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    PROXY_CONNECTION,
    KEEP_ALIVE,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .flat_map(tokens)
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Whether a comma-separated header contains `token` (case-insensitive).
pub fn contains_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .flat_map(tokens)
        .any(|t| t.eq_ignore_ascii_case(token))
}

/// Prepare an outbound request's headers.
///
/// `headers` is the outbound copy. `TE: trailers` survives stripping when the
/// client asked for it so the origin may still send trailers.
pub fn prepare_request_headers(headers: &mut HeaderMap) {
    let wants_trailers = contains_token(headers, &header::TE, "trailers");

    strip_hop_by_hop(headers);
    headers.remove(header::HOST);

    if wants_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

/// Record who the request is being forwarded for.
///
/// Forwarding headers supplied by the client are replaced, except that prior
/// X-Forwarded-For values are kept in front of the client address.
pub fn set_forwarded(
    headers: &mut HeaderMap,
    client_ip: IpAddr,
    original_host: Option<&HeaderValue>,
) {
    let mut chain: Vec<u8> = Vec::new();
    for value in headers.get_all(&X_FORWARDED_FOR) {
        chain.extend_from_slice(value.as_bytes());
        chain.extend_from_slice(b", ");
    }
    chain.extend_from_slice(client_ip.to_string().as_bytes());

    headers.remove(header::FORWARDED);
    headers.remove(&X_FORWARDED_FOR);
    headers.remove(&X_FORWARDED_HOST);
    headers.remove(&X_FORWARDED_PROTO);

    // Prior values were valid header bytes, so the joined chain is too.
    if let Ok(value) = HeaderValue::from_bytes(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Prepare an origin response's headers for the client.
///
/// Returns the trailer names the origin announced; they are re-announced to
/// the client after stripping so the trailers can follow the body.
pub fn prepare_response_headers(headers: &mut HeaderMap) -> Vec<HeaderName> {
    let announced: Vec<HeaderName> = headers
        .get_all(header::TRAILER)
        .iter()
        .flat_map(tokens)
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    strip_hop_by_hop(headers);

    if !announced.is_empty() {
        let joined = announced
            .iter()
            .map(HeaderName::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(header::TRAILER, value);
        }
    }

    announced
}

fn tokens(value: &HeaderValue) -> Vec<String> {
    value
        .to_str()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
