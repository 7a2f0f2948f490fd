//! Axum HTTP handlers for the web server
//!
//! Provides the stateless JSON-RPC endpoint, the SSE session endpoints and
//! general metadata endpoints.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::{headers::ContentType, TypedHeader};
use futures::{future::join_all, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, info, warn};

use super::{MCP_PATH, SSE_MESSAGE_PATH, SSE_PATH};
use crate::errors::{AppError, TransportError};
use crate::mcp::rpc::{Message, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR};
use crate::mcp::server::Server;
use crate::transport::{http::HttpServerTransport, sse::SseServerTransport};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub sse_endpoint: &'static str,
    pub sse_message_endpoint: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: MCP_PATH,
        sse_endpoint: SSE_PATH,
        sse_message_endpoint: SSE_MESSAGE_PATH,
    })
}

/// Stateless JSON-RPC over HTTP: one envelope or a batch per POST, answered
/// in the response body.
pub async fn mcp_endpoint(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return (
                StatusCode::OK,
                Json(Message::error(None, PARSE_ERROR, "Parse error")),
            )
                .into_response()
        }
    };

    let Value::Array(batch) = payload else {
        return match answer(&state.http_transport, &body).await {
            Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        };
    };

    if batch.is_empty() {
        return (
            StatusCode::OK,
            Json(vec![Message::error(None, INVALID_REQUEST, "Invalid Request")]),
        )
            .into_response();
    }

    let transport = &state.http_transport;
    let replies = join_all(batch.iter().map(|item| async move {
        match serde_json::to_vec(item) {
            Ok(raw) => answer(transport, &raw).await,
            Err(err) => Some(Message::error(None, INTERNAL_ERROR, err.to_string())),
        }
    }))
    .await;
    let replies: Vec<Message> = replies.into_iter().flatten().collect();

    if replies.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    (StatusCode::OK, Json(replies)).into_response()
}

async fn answer(transport: &HttpServerTransport, raw: &[u8]) -> Option<Message> {
    match transport.handle_message(raw).await {
        Ok(reply) => reply,
        Err(TransportError::Decode(err)) => Some(Message::error(None, err.code(), err.to_string())),
        Err(TransportError::Unanswered { id, source }) => {
            warn!(id = %id, error = %source, "http request went unanswered");
            Some(Message::error(Some(id), INTERNAL_ERROR, source.to_string()))
        }
        Err(err) => {
            warn!(error = %err, "http exchange failed");
            Some(Message::error(None, INTERNAL_ERROR, err.to_string()))
        }
    }
}

/// Shuts the session down when the event stream is dropped, which is how a
/// client disconnect shows up.
struct CloseOnDrop(Arc<SseServerTransport>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Opens an SSE session backed by its own server connection over the shared
/// catalog.
pub async fn sse_connect(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (sink, events) = mpsc::channel(state.sse_buffer);
    let transport = Arc::new(SseServerTransport::new(
        SSE_MESSAGE_PATH,
        sink,
        state.max_body_bytes,
    )?);
    let session_id = transport.session_id().to_string();

    let server = Server::new(state.catalog.clone(), state.server_options.clone());
    state.sessions.insert(transport.clone());
    if let Err(err) = server.connect(transport.clone()).await {
        state.sessions.remove(&session_id);
        return Err(AppError::internal(err.to_string()));
    }
    info!(session = %session_id, "sse session opened");

    let sessions = state.sessions.clone();
    let protocol = server.protocol().clone();
    let closed_session = session_id.clone();
    tokio::spawn(async move {
        protocol.closed().await;
        sessions.remove(&closed_session);
        info!(session = %closed_session, "sse session closed");
    });

    let guard = CloseOnDrop(transport);
    let stream = ReceiverStream::new(events).map(move |event| {
        let _ = &guard;
        Ok::<_, Infallible>(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Side channel of an SSE session. Replies travel over the event stream, so
/// an accepted envelope is answered with `202 Accepted` and no body.
pub async fn sse_message(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<SessionQuery>,
    content_type: Option<TypedHeader<ContentType>>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let transport = state.sessions.get(&query.session).ok_or_else(|| {
        AppError::not_found("session_not_found", format!("unknown session {}", query.session))
    })?;

    let content_type = content_type.map(|TypedHeader(content_type)| content_type.to_string());
    transport
        .handle_post_message(&method, content_type.as_deref(), &body)
        .await?;
    debug!(session = %query.session, "sse message accepted");
    Ok(StatusCode::ACCEPTED)
}
