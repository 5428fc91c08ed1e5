//! Control-plane RPC: JSON-RPC 2.0 over a single TCP client connection.
//!
//! [`RpcLink`] is the outbound half: a cloneable handle every module uses to
//! push notifications to the connected orchestrator. Notifications produced
//! before a client attaches are buffered and flushed on attach.

pub mod server;
pub mod status;

use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::ice::candidates::CandidatesMessage;

/// Bound on buffered notifications while no client is attached.
const MAX_PENDING_NOTIFICATIONS: usize = 1024;

// ============================================================================
// Request / Response Documents
// ============================================================================

/// A parsed inbound request (or notification, when `id` is absent).
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: Option<Value>,
}

#[derive(Debug)]
pub enum RpcParseError {
    /// The line is not valid JSON.
    Json(String),
    /// The document is not a JSON-RPC request shape.
    Shape(String),
}

impl std::fmt::Display for RpcParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcParseError::Json(e) => write!(f, "invalid json: {}", e),
            RpcParseError::Shape(e) => write!(f, "invalid request: {}", e),
        }
    }
}

impl std::error::Error for RpcParseError {}

/// Parse one JSON-RPC request document.
pub fn parse_request(line: &str) -> Result<RpcRequest, RpcParseError> {
    let doc: Value =
        serde_json::from_str(line).map_err(|e| RpcParseError::Json(e.to_string()))?;
    let method = doc
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcParseError::Shape("missing method".to_string()))?
        .to_string();
    let params = match doc.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(RpcParseError::Shape("params must be an array".to_string())),
    };
    let id = doc.get("id").filter(|v| !v.is_null()).cloned();
    Ok(RpcRequest { method, params, id })
}

pub fn response_ok(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn response_error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub fn notification(method: &str, params: Vec<Value>) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

// ============================================================================
// Outbound Link
// ============================================================================

struct LinkInner {
    stream: Option<TcpStream>,
    pending: VecDeque<String>,
}

/// Cloneable writer handle for the RPC client connection.
#[derive(Clone)]
pub struct RpcLink {
    inner: Arc<Mutex<LinkInner>>,
}

impl RpcLink {
    pub fn new() -> Self {
        RpcLink {
            inner: Arc::new(Mutex::new(LinkInner {
                stream: None,
                pending: VecDeque::new(),
            })),
        }
    }

    /// Adopt `stream` as the active client and flush buffered notifications.
    pub fn attach(&self, stream: TcpStream) {
        let mut inner = self.inner.lock().unwrap();
        inner.stream = Some(stream);
        let backlog: Vec<String> = inner.pending.drain(..).collect();
        for line in backlog {
            Self::write_line(&mut inner, &line);
        }
    }

    /// Drop the active client; subsequent notifications buffer again.
    pub fn detach(&self) {
        self.inner.lock().unwrap().stream = None;
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().stream.is_some()
    }

    /// Send one document to the client, or buffer it when detached.
    pub fn send(&self, doc: &Value) {
        let line = doc.to_string();
        let mut inner = self.inner.lock().unwrap();
        Self::write_line(&mut inner, &line);
    }

    fn write_line(inner: &mut LinkInner, line: &str) {
        if let Some(stream) = inner.stream.as_mut() {
            let mut framed = line.as_bytes().to_vec();
            framed.push(b'\n');
            if let Err(e) = stream.write_all(&framed) {
                log::warn!("Rpc client write failed, detaching: {}", e);
                inner.stream = None;
                Self::buffer(inner, line);
            }
        } else {
            Self::buffer(inner, line);
        }
    }

    fn buffer(inner: &mut LinkInner, line: &str) {
        if inner.pending.len() >= MAX_PENDING_NOTIFICATIONS {
            inner.pending.pop_front();
        }
        inner.pending.push_back(line.to_string());
    }

    /// Drain the buffered backlog without a client attached.
    #[allow(dead_code)]
    pub(crate) fn take_pending(&self) -> Vec<String> {
        self.inner.lock().unwrap().pending.drain(..).collect()
    }

    pub fn notify(&self, method: &str, params: Vec<Value>) {
        self.send(&notification(method, params));
    }

    // ------------------------------------------------------------------
    // Notification surface used by the rest of the adapter
    // ------------------------------------------------------------------

    pub fn on_connection_state_changed(&self, state: &str) {
        self.notify("onConnectionStateChanged", vec![json!(state)]);
    }

    pub fn on_gpgnet_message(&self, header: &str, chunks: Vec<Value>) {
        self.notify("onGpgNetMessageReceived", vec![json!(header), json!(chunks)]);
    }

    /// Forward an outgoing candidates message. The payload travels as a JSON
    /// string; the paired adapter instance expects it that way.
    pub fn on_ice_msg(&self, message: &CandidatesMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                log::error!("Could not encode candidates message: {}", e);
                return;
            }
        };
        self.notify(
            "onIceMsg",
            vec![json!(message.src_id), json!(message.dest_id), json!(payload)],
        );
    }

    pub fn on_ice_state_changed(&self, local_id: i64, remote_id: i64, state: &str) {
        self.notify(
            "onIceConnectionStateChanged",
            vec![json!(local_id), json!(remote_id), json!(state)],
        );
    }

    pub fn on_connected(&self, local_id: i64, remote_id: i64, connected: bool) {
        self.notify(
            "onConnected",
            vec![json!(local_id), json!(remote_id), json!(connected)],
        );
    }
}

impl Default for RpcLink {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_with_id() {
        let req = parse_request(r#"{"jsonrpc":"2.0","method":"status","params":[],"id":1}"#)
            .unwrap();
        assert_eq!(req.method, "status");
        assert!(req.params.is_empty());
        assert_eq!(req.id, Some(json!(1)));
    }

    #[test]
    fn test_parse_notification_without_id() {
        let req = parse_request(r#"{"method":"quit"}"#).unwrap();
        assert_eq!(req.method, "quit");
        assert_eq!(req.id, None);
    }

    #[test]
    fn test_parse_positional_params() {
        let req = parse_request(
            r#"{"method":"connectToPeer","params":["Rhiza",42,true],"id":"a"}"#,
        )
        .unwrap();
        assert_eq!(req.params, vec![json!("Rhiza"), json!(42), json!(true)]);
    }

    #[test]
    fn test_parse_rejects_object_params() {
        let err = parse_request(r#"{"method":"x","params":{"a":1}}"#).unwrap_err();
        assert!(matches!(err, RpcParseError::Shape(_)));
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        let err = parse_request("{nope").unwrap_err();
        assert!(matches!(err, RpcParseError::Json(_)));
    }

    #[test]
    fn test_link_buffers_until_attached() {
        let link = RpcLink::new();
        link.on_connection_state_changed("Connected");
        link.on_connected(1, 2, true);

        let pending = link.take_pending();
        assert_eq!(pending.len(), 2);
        let first: Value = serde_json::from_str(&pending[0]).unwrap();
        assert_eq!(first["method"], "onConnectionStateChanged");
        assert_eq!(first["params"][0], "Connected");
        let second: Value = serde_json::from_str(&pending[1]).unwrap();
        assert_eq!(second["method"], "onConnected");
        assert_eq!(second["params"], json!([1, 2, true]));
    }

    #[test]
    fn test_link_backlog_is_bounded() {
        let link = RpcLink::new();
        for i in 0..(MAX_PENDING_NOTIFICATIONS + 10) {
            link.notify("tick", vec![json!(i)]);
        }
        let pending = link.take_pending();
        assert_eq!(pending.len(), MAX_PENDING_NOTIFICATIONS);
        // Oldest entries were dropped.
        let first: Value = serde_json::from_str(&pending[0]).unwrap();
        assert_eq!(first["params"][0], 10);
    }

    #[test]
    fn test_on_ice_msg_wraps_payload_as_string() {
        let link = RpcLink::new();
        let message = CandidatesMessage {
            src_id: 3,
            dest_id: 5,
            password: "pw".to_string(),
            ufrag: "uf".to_string(),
            candidates: vec![],
        };
        link.on_ice_msg(&message);
        let pending = link.take_pending();
        let doc: Value = serde_json::from_str(&pending[0]).unwrap();
        assert_eq!(doc["method"], "onIceMsg");
        assert_eq!(doc["params"][0], 3);
        assert_eq!(doc["params"][1], 5);
        let inner: CandidatesMessage =
            serde_json::from_str(doc["params"][2].as_str().unwrap()).unwrap();
        assert_eq!(inner, message);
    }

    #[test]
    fn test_response_documents() {
        let ok = response_ok(json!(4), json!("done"));
        assert_eq!(ok["jsonrpc"], "2.0");
        assert_eq!(ok["result"], "done");
        let err = response_error(json!(4), -32601, "method not found");
        assert_eq!(err["error"]["code"], -32601);
    }
}
