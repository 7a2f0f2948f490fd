//! JSON-RPC 2.0 envelope representations
//!
//! Every wire frame is exactly one [`Message`] variant. Inbound payloads are
//! classified in two passes: a probe over the raw object decides the variant
//! from the members that are present, then the concrete variant is decoded.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Answer to a request the peer cancelled before it finished.
pub const REQUEST_CANCELLED: i32 = -32800;

/// Correlation token linking a request to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<RequestId> for Value {
    fn from(id: RequestId) -> Self {
        match id {
            RequestId::Number(n) => Value::from(n),
            RequestId::String(s) => Value::String(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

/// One JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

impl DecodeError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidEnvelope(_) | Self::Malformed { .. } => INVALID_REQUEST,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Serialize)]
struct Wire<'a, T> {
    jsonrpc: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(body) => Wire { jsonrpc: JSONRPC_VERSION, body }.serialize(serializer),
            Self::Notification(body) => {
                Wire { jsonrpc: JSONRPC_VERSION, body }.serialize(serializer)
            }
            Self::Response(body) => Wire { jsonrpc: JSONRPC_VERSION, body }.serialize(serializer),
            Self::Error(body) => Wire { jsonrpc: JSONRPC_VERSION, body }.serialize(serializer),
        }
    }
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response(Response { id, result })
    }

    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Option<RequestId>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self::Error(ErrorResponse {
            id,
            error: ErrorObject {
                code,
                message: message.into(),
                data,
            },
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) | Self::Error(_) => None,
        }
    }

    /// Correlation id of the frame, if it carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Response(response) => Some(&response.id),
            Self::Error(error) => error.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Replaces the correlation id of a request or reply. Notifications are untouched.
    pub fn set_id(&mut self, id: RequestId) {
        match self {
            Self::Request(request) => request.id = id,
            Self::Response(response) => response.id = id,
            Self::Error(error) => error.id = Some(id),
            Self::Notification(_) => {}
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(object) = value else {
            return Err(DecodeError::InvalidEnvelope("frame must be a JSON object"));
        };

        let kind = classify(&object)?;
        let object = Value::Object(object);
        match kind {
            Kind::Request => decode(object, "request").map(Self::Request),
            Kind::Notification => decode(object, "notification").map(Self::Notification),
            Kind::Response => decode(object, "response").map(Self::Response),
            Kind::Error => decode(object, "error").map(Self::Error),
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value, kind: &'static str) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|err| DecodeError::Malformed {
        kind,
        reason: err.to_string(),
    })
}

enum Kind {
    Request,
    Notification,
    Response,
    Error,
}

fn classify(object: &Map<String, Value>) -> Result<Kind, DecodeError> {
    match object.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(_) => return Err(DecodeError::InvalidEnvelope("jsonrpc must be \"2.0\"")),
        None => return Err(DecodeError::InvalidEnvelope("missing jsonrpc member")),
    }

    let has_id = object.get("id").is_some_and(|id| !id.is_null());
    let method = object.get("method");

    match (method, has_id) {
        (Some(Value::String(name)), _) if name.trim().is_empty() => {
            Err(DecodeError::InvalidEnvelope("method must not be empty"))
        }
        (Some(Value::String(_)), true) => Ok(Kind::Request),
        (Some(Value::String(_)), false) => Ok(Kind::Notification),
        (Some(_), _) => Err(DecodeError::InvalidEnvelope("method must be a string")),
        (None, _) if object.contains_key("error") => Ok(Kind::Error),
        (None, true) if object.contains_key("result") => Ok(Kind::Response),
        (None, _) => Err(DecodeError::InvalidEnvelope(
            "frame has neither method nor result/error",
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classifies_by_present_members() {
        let request = Message::from_slice(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .expect("request");
        assert!(matches!(request, Message::Request(ref r) if r.id == RequestId::Number(1)));

        let notification =
            Message::from_slice(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .expect("notification");
        assert!(matches!(notification, Message::Notification(_)));

        let response = Message::from_slice(br#"{"jsonrpc":"2.0","id":"a","result":{"ok":true}}"#)
            .expect("response");
        assert!(matches!(response, Message::Response(ref r) if r.id == RequestId::from("a")));

        let error = Message::from_slice(
            br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .expect("error");
        assert!(matches!(error, Message::Error(ref e) if e.id.is_none()));
    }

    #[test]
    fn response_whose_result_looks_like_a_request_is_still_a_response() {
        let message = Message::from_slice(
            br#"{"jsonrpc":"2.0","id":7,"result":{"jsonrpc":"2.0","id":1,"method":"x"}}"#,
        )
        .expect("response");

        let Message::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.result["method"], "x");
    }

    #[test]
    fn rejects_malformed_frames() {
        let parse = Message::from_slice(b"{").expect_err("parse error");
        assert_eq!(parse.code(), PARSE_ERROR);

        let version = Message::from_slice(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#)
            .expect_err("bad version");
        assert_eq!(version.code(), INVALID_REQUEST);

        let empty = Message::from_slice(br#"{"jsonrpc":"2.0","id":1}"#).expect_err("no members");
        assert_eq!(empty.code(), INVALID_REQUEST);

        let array = Message::from_slice(b"[]").expect_err("not an object");
        assert_eq!(array.code(), INVALID_REQUEST);
    }

    #[test]
    fn serializes_with_version_tag() {
        let value = serde_json::to_value(Message::error_with_data(
            Some(RequestId::Number(3)),
            METHOD_NOT_FOUND,
            "Method not found: nope",
            Some(json!({"code": "method_not_found"})),
        ))
        .expect("serialize");

        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "error": {
                    "code": -32601,
                    "message": "Method not found: nope",
                    "data": {"code": "method_not_found"}
                }
            })
        );

        let notification =
            serde_json::to_value(Message::notification("ping", None)).expect("serialize");
        assert_eq!(notification, json!({"jsonrpc": "2.0", "method": "ping"}));
    }

    #[test]
    fn set_id_leaves_notifications_alone() {
        let mut message = Message::notification("x", None);
        message.set_id(RequestId::Number(9));
        assert!(message.id().is_none());

        let mut reply = Message::response(RequestId::Number(1), json!({}));
        reply.set_id(RequestId::from("caller"));
        assert_eq!(reply.id(), Some(&RequestId::from("caller")));
    }
}
