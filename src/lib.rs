use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{any, get, post},
    Router,
};

pub mod catalog;
pub mod config;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod transport;

use catalog::Catalog;
use config::Config;
use errors::ProtocolError;
use http::{sessions::SessionRegistry, MCP_PATH, SSE_MESSAGE_PATH, SSE_PATH};
use mcp::server::{Server, ServerOptions};
use transport::http::HttpServerTransport;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub server_options: ServerOptions,
    pub http_transport: Arc<HttpServerTransport>,
    pub http_server: Server,
    pub sessions: SessionRegistry,
    pub max_body_bytes: usize,
    pub sse_buffer: usize,
}

impl AppState {
    /// Builds the shared state and connects the stateless HTTP server.
    pub async fn new(catalog: Arc<Catalog>, config: &Config) -> Result<Self, ProtocolError> {
        let server_options = ServerOptions {
            page_size: config.page_size,
            request_timeout: config.request_timeout,
            ..ServerOptions::default()
        };

        let http_transport = Arc::new(HttpServerTransport::new(config.request_timeout));
        let http_server = Server::new(catalog.clone(), server_options.clone());
        http_server.connect(http_transport.clone()).await?;

        Ok(Self {
            catalog,
            server_options,
            http_transport,
            http_server,
            sessions: SessionRegistry::new(),
            max_body_bytes: config.max_body_bytes,
            sse_buffer: config.sse_buffer,
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(MCP_PATH, post(http::handlers::mcp_endpoint))
        .route(SSE_PATH, get(http::handlers::sse_connect))
        .route(SSE_MESSAGE_PATH, any(http::handlers::sse_message))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
