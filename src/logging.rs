use std::time::Instant;

use axum::{
    extract::Request,
    http::{StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::http::{MCP_PATH, SSE_MESSAGE_PATH, SSE_PATH};

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_logging(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Which surface a request hit, for grouping log lines.
fn endpoint_of(path: &str) -> &'static str {
    match path {
        MCP_PATH => "rpc",
        SSE_PATH => "sse_stream",
        SSE_MESSAGE_PATH => "sse_message",
        "/health" => "health",
        "/.well-known/mcp" => "discovery",
        _ => "other",
    }
}

/// The SSE session a side-channel POST belongs to.
fn session_of(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("session="))
        .filter(|session| !session.is_empty())
        .map(str::to_string)
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let endpoint = endpoint_of(&path);
    let session = session_of(request.uri());
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        endpoint,
        session = session.as_deref().unwrap_or("-"),
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    if status.is_client_error() && status != StatusCode::NOT_FOUND {
        warn!(
            method = %method,
            endpoint,
            session = session.as_deref().unwrap_or("-"),
            status = status.as_u16(),
            "client error"
        );
    } else if status == StatusCode::NOT_FOUND && session.is_some() {
        warn!(endpoint, session = session.as_deref().unwrap_or("-"), "unknown sse session");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_endpoints() {
        assert_eq!(endpoint_of(MCP_PATH), "rpc");
        assert_eq!(endpoint_of(SSE_PATH), "sse_stream");
        assert_eq!(endpoint_of(SSE_MESSAGE_PATH), "sse_message");
        assert_eq!(endpoint_of("/health"), "health");
        assert_eq!(endpoint_of("/nope"), "other");
    }

    #[test]
    fn extracts_session_from_query() {
        let uri: Uri = "/message?foo=1&session=abc-123".parse().expect("uri");
        assert_eq!(session_of(&uri).as_deref(), Some("abc-123"));

        let uri: Uri = "/message?session=".parse().expect("uri");
        assert_eq!(session_of(&uri), None);

        let uri: Uri = "/mcp".parse().expect("uri");
        assert_eq!(session_of(&uri), None);
    }
}
