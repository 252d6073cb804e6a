use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker_actor::Method;

/// JSON‑RPC 2.0 core types spoken between a flowbot client and its worker
/// over the worker's stdin/stdout, one message per line.
///
/// These structs mirror the [JSON‑RPC 2.0 spec](https://www.jsonrpc.org/specification)
/// and do not know anything about the transport underneath.
///
/// Usage example (with `serde_json`):
/// ```ignore
/// use worker_protocol::jsonrpc::{Id, Request};
/// use worker_protocol::worker_actor::Method;
///
/// let req = Request::call(Id::Number(1), Method::ListFlows, None);
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
/// The requested flow id is not known to the worker.
pub const UNKNOWN_FLOW: i64 = -32001;
/// The worker is already running a flow.
pub const WORKER_BUSY: i64 = -32002;
/// The execution id does not match the worker's active execution.
pub const UNKNOWN_EXECUTION: i64 = -32003;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Lets callers `serde_json::from_str::<Message>()` a line without inspecting it first.
/// `Request` must stay first: only requests carry `method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------
impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification<M: Into<Method>>(method: M, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into().to_string(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call<M: Into<Method>>(id: Id, method: M, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into().to_string(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_method_name() {
        let req = Request::call(Id::Number(1), Method::ListFlows, None);
        let s = serde_json::to_string(&req).unwrap();
        assert!(s.contains("\"method\":\"listFlows\""));
        assert!(!s.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let req = Request::notification(Method::Shutdown, None);
        assert!(req.is_notification());
        let s = serde_json::to_string(&req).unwrap();
        assert!(!s.contains("\"id\""));
    }

    #[test]
    fn message_distinguishes_response_from_request() {
        let line = r#"{"jsonrpc":"2.0","result":{"accepted":true},"id":"abc"}"#;
        match serde_json::from_str::<Message>(line).unwrap() {
            Message::Response(rsp) => {
                assert_eq!(rsp.id, Id::String("abc".into()));
                assert_eq!(rsp.result.unwrap()["accepted"], json!(true));
            }
            Message::Request(_) => panic!("expected a response"),
        }

        let line = r#"{"jsonrpc":"2.0","method":"status","params":{"seq":1}}"#;
        match serde_json::from_str::<Message>(line).unwrap() {
            Message::Request(req) => assert_eq!(req.method, "status"),
            Message::Response(_) => panic!("expected a notification"),
        }
    }

    #[test]
    fn failure_carries_code() {
        let rsp = Response::fail(Id::Null, UNKNOWN_FLOW, "unknown flow", None);
        let s = serde_json::to_string(&rsp).unwrap();
        let de: Response = serde_json::from_str(&s).unwrap();
        assert_eq!(de.error.unwrap().code, UNKNOWN_FLOW);
        assert!(de.result.is_none());
    }
}
