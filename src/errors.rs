use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::rpc::{
    DecodeError, RequestId, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    REQUEST_CANCELLED,
};

/// Faults raised while moving envelopes between peers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport not started")]
    NotStarted,
    #[error("transport already started")]
    AlreadyStarted,
    #[error("no delivery slot for correlation key {0}")]
    NoDeliverySlot(i64),
    #[error("no counterpart to deliver {0} frame to")]
    NoCounterpart(&'static str),
    #[error("no message handler installed")]
    NoMessageHandler,
    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),
    #[error("request {id} went unanswered: {source}")]
    Unanswered {
        id: RequestId,
        #[source]
        source: Box<TransportError>,
    },
    #[error("event sink does not support streaming")]
    StreamingUnsupported,
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("unsupported content type: {0}")]
    UnsupportedMediaType(String),
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Faults surfaced by the protocol engine and the server façade.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("request {method} cancelled")]
    Cancelled { method: String },
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("{message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not connected to a transport")]
    NotConnected,
    #[error("already connected to a transport")]
    AlreadyConnected,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    /// JSON-RPC error code used when this error is sent as an Error frame.
    pub fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_)
            | Self::UnknownTool(_)
            | Self::UnknownPrompt(_)
            | Self::UnknownResource(_)
            | Self::InvalidCursor(_) => INVALID_PARAMS,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::Cancelled { .. } => REQUEST_CANCELLED,
            Self::Rpc { code, .. } => *code,
            _ => INTERNAL_ERROR,
        }
    }

    /// Structured `data` member attached to the Error frame.
    pub fn data(&self) -> Option<Value> {
        let (code, details) = match self {
            Self::UnknownTool(name) => ("tool_not_found", json!({ "name": name })),
            Self::UnknownPrompt(name) => ("prompt_not_found", json!({ "name": name })),
            Self::UnknownResource(uri) => ("resource_not_found", json!({ "uri": uri })),
            Self::InvalidCursor(_) => ("invalid_cursor", json!({})),
            Self::Rpc { data, .. } => return data.clone(),
            _ => return None,
        };

        Some(json!({
            "code": code,
            "message": self.to_string(),
            "details": details,
        }))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String },
    #[error("method not allowed: {message}")]
    MethodNotAllowed { code: &'static str, message: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { code: &'static str, message: String },
    #[error("payload too large: {message}")]
    PayloadTooLarge { code: &'static str, message: String },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        let message = err.to_string();
        match err {
            TransportError::MethodNotAllowed(_) => Self::MethodNotAllowed {
                code: "method_not_allowed",
                message,
            },
            TransportError::UnsupportedMediaType(_) => Self::UnsupportedMediaType {
                code: "unsupported_media_type",
                message,
            },
            TransportError::PayloadTooLarge { .. } => Self::PayloadTooLarge {
                code: "payload_too_large",
                message,
            },
            TransportError::Decode(_) => Self::bad_request("invalid_message", message),
            TransportError::Closed | TransportError::NotStarted => {
                Self::not_found("session_closed", message)
            }
            _ => Self::internal(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            Self::MethodNotAllowed { code, message } => {
                (StatusCode::METHOD_NOT_ALLOWED, code, message)
            }
            Self::UnsupportedMediaType { code, message } => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, code, message)
            }
            Self::PayloadTooLarge { code, message } => {
                (StatusCode::PAYLOAD_TOO_LARGE, code, message)
            }
            Self::Internal { code, message } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    "internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_json_rpc_codes() {
        assert_eq!(ProtocolError::MethodNotFound("x".into()).code(), METHOD_NOT_FOUND);
        assert_eq!(ProtocolError::UnknownTool("x".into()).code(), INVALID_PARAMS);
        assert_eq!(ProtocolError::ConnectionClosed.code(), INTERNAL_ERROR);
        assert_eq!(
            ProtocolError::Rpc {
                code: -32000,
                message: "custom".into(),
                data: None
            }
            .code(),
            -32000
        );
    }

    #[test]
    fn unknown_tool_carries_machine_readable_data() {
        let error = ProtocolError::UnknownTool("missing".into());
        assert_eq!(error.to_string(), "unknown tool: missing");

        let data = error.data().expect("data");
        assert_eq!(data["code"], "tool_not_found");
        assert_eq!(data["details"]["name"], "missing");
    }

    #[test]
    fn transport_validation_errors_map_to_http_statuses() {
        let response = AppError::from(TransportError::PayloadTooLarge { size: 10, limit: 5 })
            .into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response =
            AppError::from(TransportError::MethodNotAllowed("GET".into())).into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = AppError::from(TransportError::Closed).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
