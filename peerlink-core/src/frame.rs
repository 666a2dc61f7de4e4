//! Transport-level frames.
//!
//! The persistent connection carries JSON text frames of three shapes:
//! requests issued by the client, responses correlated to them by id, and
//! unsolicited signals pushed by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Request {
        id: String,
        method: Method,
        path: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        body: Value,
    },
    Response {
        id: String,
        status: u16,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        body: Value,
    },
    /// Inbound signal. The body is parsed into a
    /// [`SignalEnvelope`](crate::SignalEnvelope) by the router so that a
    /// malformed envelope does not poison the whole frame.
    Signal {
        #[serde(default)]
        body: Value,
    },
}

impl Frame {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Response status classes the client treats specially.
pub mod status {
    pub const OK: u16 = 200;
    pub const NO_CONTENT: u16 = 204;
    pub const UNAUTHORIZED: u16 = 401;
    pub const TOO_MANY_REQUESTS: u16 = 429;

    pub fn is_success(status: u16) -> bool {
        (200..300).contains(&status)
    }
}
