//! JSON-RPC 2.0 message validation and proxy error replies
//!
//! The proxy passes messages through; it never synthesizes ids except
//! for the error responses it returns to a client itself. Validation
//! is structural only — method dispatch belongs to the downstream
//! server.

use serde_json::{json, Value};

/// Invalid UTF-8 or invalid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Structurally invalid JSON-RPC message.
pub const INVALID_MESSAGE: i64 = -32600;
/// Rate limit, forbidden content, or downstream unavailable — the
/// message text disambiguates.
pub const INTERNAL_ERROR: i64 = -32603;

pub const MSG_INVALID_JSON: &str = "Invalid JSON format";
pub const MSG_INVALID_RPC: &str = "Invalid JSON-RPC message";
pub const MSG_RATE_LIMITED: &str = "Rate limit exceeded";
pub const MSG_FORBIDDEN: &str = "Message contains forbidden content";
pub const MSG_SERVER_UNAVAILABLE: &str = "MCP server not connected";

/// Structural classification of a valid message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NotAnObject,
    WrongVersion,
    MethodNotAString,
    MissingResultOrError,
}

/// Validate the JSON-RPC 2.0 envelope:
/// - `jsonrpc` must equal "2.0"
/// - a present `method` must be a string (request or notification)
/// - without `method`, either `result` or `error` must be present
pub fn validate(msg: &Value) -> Result<MessageKind, ValidationError> {
    let obj = msg.as_object().ok_or(ValidationError::NotAnObject)?;
    match obj.get("jsonrpc").and_then(|v| v.as_str()) {
        Some("2.0") => {}
        _ => return Err(ValidationError::WrongVersion),
    }
    match obj.get("method") {
        Some(method) => {
            if !method.is_string() {
                return Err(ValidationError::MethodNotAString);
            }
            if obj.contains_key("id") {
                Ok(MessageKind::Request)
            } else {
                Ok(MessageKind::Notification)
            }
        }
        None => {
            if obj.contains_key("result") || obj.contains_key("error") {
                Ok(MessageKind::Response)
            } else {
                Err(ValidationError::MissingResultOrError)
            }
        }
    }
}

/// Method name of a request/notification, if any.
pub fn method(msg: &Value) -> Option<&str> {
    msg.get("method").and_then(|m| m.as_str())
}

/// The id to echo in an error reply. Only scalar ids are recoverable;
/// anything else degrades to null.
pub fn recoverable_id(msg: &Value) -> Value {
    match msg.get("id") {
        Some(id) if id.is_string() || id.is_number() || id.is_null() => id.clone(),
        _ => Value::Null,
    }
}

/// Build a JSON-RPC error reply from the proxy itself.
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

pub fn parse_error() -> Value {
    error_response(Value::Null, PARSE_ERROR, MSG_INVALID_JSON)
}

pub fn invalid_message(id: Value) -> Value {
    error_response(id, INVALID_MESSAGE, MSG_INVALID_RPC)
}
