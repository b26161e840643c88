//! The thin slice of CDP the relay actually inspects.
//!
//! Command payloads and responses are opaque `serde_json::Value`s so the
//! relay stays forward-compatible with protocol additions; only `id`,
//! `method`, `sessionId` and the extension's wrapper envelope are parsed.

use serde_json::{json, Map, Value};

/// JSON-RPC style error codes used on the CDP wire.
pub const INVALID_REQUEST: i64 = -32600;
pub const NO_SUCH_TARGET: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;
pub const SESSION_NOT_OWNED: i64 = -32001;

/// Methods that get the long deadline: navigation, evaluation and capture
/// can legitimately outlive the 30 s default.
const LONG_METHODS: &[&str] = &[
    "Page.navigate",
    "Runtime.evaluate",
    "Page.captureScreenshot",
    "Page.captureSnapshot",
    "Page.printToPDF",
];

pub fn is_long_method(method: &str) -> bool {
    LONG_METHODS.contains(&method)
}

/// The inspected subset of a client command. `id` is kept verbatim (any
/// JSON value a client chooses) and restored untouched on the response.
#[derive(Clone, Debug)]
pub struct CommandFrame {
    pub id: Value,
    pub method: String,
    pub session_id: Option<String>,
    pub params: Option<Value>,
}

/// Outcome of parsing a client text frame.
#[derive(Clone, Debug)]
pub enum ClientFrame {
    Command(CommandFrame),
    /// Not a well-formed command. `id` is whatever could be recovered so a
    /// best-effort error reply can still be correlated.
    Malformed { id: Option<Value> },
}

pub fn parse_client_frame(text: &str) -> ClientFrame {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) else {
        return ClientFrame::Malformed { id: None };
    };
    let id = obj.get("id").cloned();
    let Some(Value::Number(_)) = id.as_ref() else {
        return ClientFrame::Malformed { id: None };
    };
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return ClientFrame::Malformed { id };
    };
    let session_id = match obj.get("sessionId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return ClientFrame::Malformed { id },
    };
    ClientFrame::Command(CommandFrame {
        id: id.unwrap_or(Value::Null),
        method: method.to_string(),
        session_id,
        params: obj.get("params").cloned(),
    })
}

/// A frame received from the extension.
#[derive(Clone, Debug)]
pub enum ExtensionFrame {
    /// Command response carrying the relay-scoped id. The full object is
    /// retained so `result`/`error` forward verbatim.
    Response { relay_id: u64, raw: Map<String, Value> },
    /// Unwrapped `forwardCDPEvent`.
    Event {
        method: String,
        session_id: Option<String>,
        params: Value,
    },
    /// Out-of-band log line from the extension.
    Log { level: String, args: Vec<Value> },
    /// Keepalive reply.
    Pong,
    /// Handshake / target metadata announcement.
    TargetInfo(Value),
    /// Structurally valid but unrecognized; ignored.
    Unknown { method: String },
    /// Not JSON, not an object, or missing required fields. The extension
    /// is a trusted producer, so this is grounds for closing it.
    Malformed,
}

pub fn parse_extension_frame(text: &str) -> ExtensionFrame {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) else {
        return ExtensionFrame::Malformed;
    };
    if let Some(id) = obj.get("id") {
        let Some(relay_id) = id.as_u64() else {
            return ExtensionFrame::Malformed;
        };
        return ExtensionFrame::Response { relay_id, raw: obj };
    }
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return ExtensionFrame::Malformed;
    };
    match method {
        "forwardCDPEvent" => {
            let Some(params) = obj.get("params").and_then(Value::as_object) else {
                return ExtensionFrame::Malformed;
            };
            let Some(inner_method) = params.get("method").and_then(Value::as_str) else {
                return ExtensionFrame::Malformed;
            };
            let session_id = params
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string);
            ExtensionFrame::Event {
                method: inner_method.to_string(),
                session_id,
                params: params.get("params").cloned().unwrap_or(json!({})),
            }
        }
        "log" => {
            let params = obj.get("params").and_then(Value::as_object);
            let level = params
                .and_then(|p| p.get("level"))
                .and_then(Value::as_str)
                .unwrap_or("log")
                .to_string();
            let args = params
                .and_then(|p| p.get("args"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            ExtensionFrame::Log { level, args }
        }
        "pong" => ExtensionFrame::Pong,
        "targetInfo" => ExtensionFrame::TargetInfo(obj.get("params").cloned().unwrap_or(json!({}))),
        other => ExtensionFrame::Unknown {
            method: other.to_string(),
        },
    }
}

/// Serialize a CDP error response.
pub fn error_frame(id: &Value, code: i64, message: &str) -> String {
    json!({
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

/// Serialize a CDP success response.
pub fn result_frame(id: &Value, result: Value) -> String {
    json!({ "id": id, "result": result }).to_string()
}

/// Serialize a CDP event frame as a client expects it (no wrapper).
pub fn event_frame(method: &str, session_id: Option<&str>, params: Value) -> String {
    let mut obj = Map::new();
    obj.insert("method".to_string(), Value::String(method.to_string()));
    if let Some(session) = session_id {
        obj.insert("sessionId".to_string(), Value::String(session.to_string()));
    }
    obj.insert("params".to_string(), params);
    Value::Object(obj).to_string()
}

/// Rewrite a client command for the extension: relay-scoped id, everything
/// else verbatim.
pub fn forward_frame(relay_id: u64, frame: &CommandFrame) -> String {
    let mut obj = Map::new();
    obj.insert("id".to_string(), json!(relay_id));
    obj.insert("method".to_string(), Value::String(frame.method.clone()));
    if let Some(session) = &frame.session_id {
        obj.insert("sessionId".to_string(), Value::String(session.clone()));
    }
    if let Some(params) = &frame.params {
        obj.insert("params".to_string(), params.clone());
    }
    Value::Object(obj).to_string()
}

/// Rewrite an extension response back to the client's original id.
pub fn restore_response(mut raw: Map<String, Value>, original_id: Value) -> String {
    raw.insert("id".to_string(), original_id);
    Value::Object(raw).to_string()
}
