use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if host_is_trusted(host, &state.config.trusted_hosts) {
        return next.run(request).await;
    }

    tracing::warn!(host, "Rejected request from untrusted host");
    AppError::Forbidden("Host not allowed.".to_string()).into_response()
}

/// A host matches when the allow-list contains `*`, the bare hostname, or a
/// `.suffix` entry the hostname ends with. The port is ignored.
fn host_is_trusted(host_header: &str, trusted: &[String]) -> bool {
    if trusted.is_empty() {
        return true;
    }

    let host = host_header
        .rsplit_once(':')
        .map_or(host_header, |(name, _port)| name)
        .trim()
        .to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }

    trusted.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if entry == "*" {
            return true;
        }
        if let Some(suffix) = entry.strip_prefix('.') {
            return host.ends_with(suffix);
        }
        host == entry
    })
}

#[cfg(test)]
mod tests {
    use super::host_is_trusted;

    fn hosts(entries: &[&str]) -> Vec<String> {
        entries.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn matches_exact_hosts_ignoring_port() {
        let trusted = hosts(&["localhost", "api.rentora.io"]);
        assert!(host_is_trusted("localhost:8000", &trusted));
        assert!(host_is_trusted("api.rentora.io", &trusted));
        assert!(!host_is_trusted("evil.example.com", &trusted));
    }

    #[test]
    fn matches_dot_suffix_entries() {
        let trusted = hosts(&[".rentora.io"]);
        assert!(host_is_trusted("api.rentora.io", &trusted));
        assert!(host_is_trusted("staging.rentora.io:443", &trusted));
        assert!(!host_is_trusted("rentora.evil.com", &trusted));
    }

    #[test]
    fn wildcard_and_empty_list_allow_everything() {
        assert!(host_is_trusted("anything", &hosts(&["*"])));
        assert!(host_is_trusted("anything", &[]));
        assert!(!host_is_trusted("", &hosts(&["localhost"])));
    }
}
