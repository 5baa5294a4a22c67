//! Protocol-independent pieces of request forwarding: classification, upstream URL
//! composition, redirect rewriting and header hygiene.
use http::{HeaderMap, StatusCode, header};
use thiserror::Error;

use crate::{core::registry::RegistryError, ports::http_client::HttpClientError};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    /// No service link answers for the request host
    #[error("No service is routed for host '{0}'")]
    RouteNotFound(String),

    /// The upstream could not be reached or failed mid-exchange
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed upgrade handshake or otherwise unusable client request
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid upstream URL '{url}': {message}")]
    InvalidUpstreamUrl { url: String, message: String },

    /// Reading or buffering a body failed
    #[error("Body error: {0}")]
    Body(String),
}

impl ForwardError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ForwardError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ForwardError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Protocol(_) => StatusCode::BAD_REQUEST,
            ForwardError::InvalidUpstreamUrl { .. } | ForwardError::Body(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<RegistryError> for ForwardError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(host) => ForwardError::RouteNotFound(host),
            other => ForwardError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<HttpClientError> for ForwardError {
    fn from(err: HttpClientError) -> Self {
        match err {
            HttpClientError::InvalidRequest(message) => ForwardError::Protocol(message),
            other => ForwardError::UpstreamUnavailable(other.to_string()),
        }
    }
}

/// How an inbound request is relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    WebSocket,
    EventStream,
    Rest,
}

impl RequestKind {
    /// WebSocket upgrade headers win over `Accept: text/event-stream`.
    pub fn classify(headers: &HeaderMap) -> Self {
        if is_websocket_upgrade(headers) {
            RequestKind::WebSocket
        } else if header_contains(headers, header::ACCEPT, "text/event-stream") {
            RequestKind::EventStream
        } else {
            RequestKind::Rest
        }
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_contains(headers, header::CONNECTION, "upgrade")
        && header_contains(headers, header::UPGRADE, "websocket")
}

fn header_contains(headers: &HeaderMap, name: header::HeaderName, needle: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    })
}

/// `base` + `path` with exactly one slash between them, plus the untouched query.
pub fn compose_upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(base.len() + path.len() + 2);
    url.push_str(base.trim_end_matches('/'));
    url.push('/');
    url.push_str(path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Absolute form of a relative `Location`, rooted at the client-facing origin.
/// Returns `None` when the value is already absolute and must pass through.
pub fn rewrite_location(location: &str, scheme: &str, host: &str) -> Option<String> {
    if location.starts_with("//") || url::Url::parse(location).is_ok() {
        return None;
    }
    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{location}")
    };
    Some(format!("{scheme}://{host}{path}"))
}

/// Headers that belong to the client's own WebSocket handshake.
pub const WEBSOCKET_HANDSHAKE_HEADERS: [&str; 6] = [
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "host",
];

/// Drop the client's handshake headers so the upstream dial negotiates its own.
pub fn strip_websocket_handshake(headers: &mut HeaderMap) {
    for name in WEBSOCKET_HANDSHAKE_HEADERS {
        headers.remove(name);
    }
}

/// Connection-scoped headers that must not be relayed between hops.
pub const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
