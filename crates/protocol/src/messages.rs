//! Command and result messages.
//!
//! Both travel as JSON inside a sealed envelope. A [`Command`] names an
//! action as `module.action` and carries a parameter mapping; an
//! [`ActionResult`] carries a payload, a success flag and a numeric status.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter mapping of a command: string keys, arbitrary JSON values.
pub type Parameters = serde_json::Map<String, Value>;

/// A client-initiated request for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Dotted `module.action` address.
    pub action: String,
    /// Action parameters; omitted parameters decode as an empty mapping.
    #[serde(default)]
    pub parameters: Parameters,
}

impl Command {
    /// Create a new command.
    pub fn new(action: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            action: action.into(),
            parameters,
        }
    }
}

/// The outcome of executing a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Action-specific payload.
    pub data: Value,
    /// Whether the action succeeded.
    pub success: bool,
    /// Numeric status. Protocol failures use the [`StatusCode`] vocabulary;
    /// handlers report their own value.
    pub status: u16,
    /// Short human-readable message.
    #[serde(default)]
    pub message: String,
}

impl ActionResult {
    /// Create a result with the given payload and success flag.
    ///
    /// The status mirrors the success flag (1 on success, 0 on failure),
    /// which is what action handlers report.
    pub fn new(data: Value, success: bool) -> Self {
        Self {
            data,
            success,
            status: u16::from(success),
            message: String::new(),
        }
    }

    /// Create a protocol-level error result with an empty payload.
    pub fn error(status: StatusCode) -> Self {
        Self {
            data: Value::Object(Parameters::new()),
            success: false,
            status: status.as_u16(),
            message: status.reason().to_string(),
        }
    }

    /// Replace the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Protocol status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Request handled.
    Ok,
    /// Malformed or missing parameters.
    BadRequest,
    /// Authentication failure.
    Forbidden,
    /// Unknown action.
    MethodNotAllowed,
    /// Request body too large.
    PayloadTooLarge,
    /// Oversized request line.
    UriTooLong,
    /// The handler failed.
    InternalServerError,
    /// Unknown module.
    NotImplemented,
}

impl StatusCode {
    /// Numeric code.
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UriTooLong => 414,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
        }
    }

    /// Look up a status by its numeric code.
    pub fn from_u16(code: u16) -> Option<Self> {
        let status = match code {
            200 => StatusCode::Ok,
            400 => StatusCode::BadRequest,
            403 => StatusCode::Forbidden,
            405 => StatusCode::MethodNotAllowed,
            413 => StatusCode::PayloadTooLarge,
            414 => StatusCode::UriTooLong,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::NotImplemented,
            _ => return None,
        };
        Some(status)
    }

    /// Standard reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::UriTooLong => "URI Too Long",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}
