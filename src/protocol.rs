//! Tool-call envelopes exchanged with workers
//!
//! Envelopes are JSON objects framed one per line. Requests carry a
//! correlation id chosen by the caller; responses echo it back with either a
//! `result` payload or an `error`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_READ: &str = "resources/read";

/// Correlation token carried by a request and echoed by its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Fresh unique id for an outgoing request
    pub fn generate() -> Self {
        RequestId::String(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// An outgoing request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// `tools/call` with `{name, arguments}` params
    pub fn tool_call(id: RequestId, tool: &str, arguments: Map<String, Value>) -> Self {
        Self::new(
            id,
            METHOD_TOOLS_CALL,
            Some(json!({ "name": tool, "arguments": arguments })),
        )
    }

    pub fn initialize(id: RequestId) -> Self {
        Self::new(id, METHOD_INITIALIZE, Some(json!({})))
    }

    pub fn read_resource(id: RequestId, uri: &str) -> Self {
        Self::new(id, METHOD_RESOURCES_READ, Some(json!({ "uri": uri })))
    }

    /// Serialize to a single line, without the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// What a response carries besides its id
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(String),
}

/// A decoded response envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success(result),
        }
    }

    pub fn failure(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(message.into()),
        }
    }

    pub fn to_line(&self) -> String {
        let body = match &self.outcome {
            Outcome::Success(result) => {
                json!({ "jsonrpc": JSONRPC_VERSION, "id": self.id, "result": result })
            }
            Outcome::Failure(message) => {
                json!({ "jsonrpc": JSONRPC_VERSION, "id": self.id, "error": message })
            }
        };
        body.to_string()
    }
}

/// A line read back from a worker
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    /// Worker-initiated message (notification or request); not routed
    Notification { method: String },
}

/// Decode one line read from a worker channel.
///
/// `result: null` counts as a successful empty result. The error member may be
/// a plain string or a `{code, message}` object.
pub fn parse_incoming(line: &str) -> Result<Incoming, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(mut obj) = value else {
        return Err("envelope is not a JSON object".to_string());
    };

    let has_outcome = obj.contains_key("result") || obj.contains_key("error");
    if !has_outcome {
        if let Some(Value::String(method)) = obj.remove("method") {
            return Ok(Incoming::Notification { method });
        }
    }

    let id = match obj.remove("id") {
        Some(Value::Null) | None => return Err("envelope has no id".to_string()),
        Some(raw) => serde_json::from_value::<RequestId>(raw)
            .map_err(|_| "id is neither a string nor an integer".to_string())?,
    };

    let outcome = match (obj.remove("result"), obj.remove("error")) {
        (Some(result), None) => Outcome::Success(result),
        (None, Some(error)) => Outcome::Failure(error_message(error)),
        (Some(_), Some(_)) => return Err("envelope has both result and error".to_string()),
        (None, None) => return Err("envelope has neither result nor error".to_string()),
    };

    Ok(Incoming::Response(Response { id, outcome }))
}

fn error_message(error: Value) -> String {
    match error {
        Value::String(message) => message,
        Value::Object(mut obj) => match obj.remove("message") {
            Some(Value::String(message)) => match obj.get("code") {
                Some(code) => format!("{message} (code {code})"),
                None => message,
            },
            _ => Value::Object(obj).to_string(),
        },
        other => other.to_string(),
    }
}

/// Capability descriptor answered to `initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,
}

impl Capabilities {
    /// Names of the advertised tools, for tools described as `{name, ...}`
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_envelope_shape() {
        let mut args = Map::new();
        args.insert("message".to_string(), json!("hi"));
        let request = Request::tool_call(RequestId::from(7), "echo", args);
        let value: Value = serde_json::from_str(&request.to_line().unwrap()).unwrap();

        assert_eq!(value["id"], json!(7));
        assert_eq!(value["method"], json!("tools/call"));
        assert_eq!(value["params"]["name"], json!("echo"));
        assert_eq!(value["params"]["arguments"]["message"], json!("hi"));
    }

    #[test]
    fn test_parse_success_response() {
        let incoming = parse_incoming(r#"{"id":"abc","result":{"ok":true}}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Response(Response::success(RequestId::from("abc"), json!({"ok": true})))
        );
    }

    #[test]
    fn test_parse_null_result_is_success() {
        let incoming = parse_incoming(r#"{"id":1,"result":null}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Response(Response::success(RequestId::from(1), Value::Null))
        );
    }

    #[test]
    fn test_parse_string_and_object_errors() {
        let plain = parse_incoming(r#"{"id":1,"error":"boom"}"#).unwrap();
        assert_eq!(
            plain,
            Incoming::Response(Response::failure(RequestId::from(1), "boom"))
        );

        let object =
            parse_incoming(r#"{"id":1,"error":{"code":-32601,"message":"Method not found"}}"#)
                .unwrap();
        match object {
            Incoming::Response(Response {
                outcome: Outcome::Failure(message),
                ..
            }) => {
                assert!(message.contains("Method not found"));
                assert!(message.contains("-32601"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_notification() {
        let incoming =
            parse_incoming(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#)
                .unwrap();
        assert_eq!(
            incoming,
            Incoming::Notification {
                method: "notifications/progress".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_incoming("not json").is_err());
        assert!(parse_incoming("[1,2]").is_err());
        assert!(parse_incoming(r#"{"result":1}"#).is_err());
        assert!(parse_incoming(r#"{"id":1}"#).is_err());
        assert!(parse_incoming(r#"{"id":1,"result":1,"error":"x"}"#).is_err());
        assert!(parse_incoming(r#"{"id":[1],"result":1}"#).is_err());
    }

    #[test]
    fn test_response_line_roundtrips_through_parser() {
        let line = Response::failure(RequestId::from("r1"), "nope").to_line();
        assert_eq!(
            parse_incoming(&line).unwrap(),
            Incoming::Response(Response::failure(RequestId::from("r1"), "nope"))
        );
    }

    #[test]
    fn test_capabilities_defaults_missing_lists() {
        let caps: Capabilities =
            serde_json::from_value(json!({ "tools": [{"name": "echo"}, {"name": "add"}] }))
                .unwrap();
        assert_eq!(caps.tool_names(), vec!["echo", "add"]);
        assert!(caps.resources.is_empty());
        assert!(caps.prompts.is_empty());
    }
}
