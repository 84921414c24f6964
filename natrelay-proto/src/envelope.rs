//! Accessors for the few fields of backend messages the relay cares about.

use crate::correlation::CorrelationId;
use serde_json::{json, Value};

/// Method the backend understands for releasing a page.
pub const CLOSE_PAGE_METHOD: &str = "closePage";

const ATTACHED_EVENT: &str = "Target.attachedToTarget";
const DETACHED_EVENT: &str = "Target.detachedFromTarget";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Attached(String),
    Detached(String),
}

pub fn method(value: &Value) -> Option<&str> {
    value.get("method").and_then(Value::as_str)
}

/// Requests and notifications carry a method; responses never do.
pub fn is_response(value: &Value) -> bool {
    value.is_object() && method(value).is_none()
}

/// Session a message is addressed to, if any.
pub fn session_id(value: &Value) -> Option<&str> {
    value
        .get("sessionId")
        .or_else(|| value.get("params").and_then(|p| p.get("sessionId")))
        .and_then(Value::as_str)
}

/// Resource a response reports as newly created.
pub fn created_resource(value: &Value) -> Option<String> {
    let result = value.get("result")?;
    result
        .get("pageId")
        .or_else(|| result.get("resourceId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Resource a client request asks the backend to release.
pub fn closed_resource(value: &Value) -> Option<String> {
    if method(value)? != CLOSE_PAGE_METHOD {
        return None;
    }
    value
        .get("params")?
        .get("pageId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Session lifecycle events, either emitted directly or wrapped in a
/// `forwardCDPEvent` envelope by the browser extension.
pub fn session_event(value: &Value) -> Option<SessionEvent> {
    let (method, params) = match method(value)? {
        "forwardCDPEvent" => {
            let params = value.get("params")?;
            (params.get("method")?.as_str()?, params.get("params")?)
        }
        other => (other, value.get("params")?),
    };
    let session = params.get("sessionId")?.as_str()?.to_string();
    match method {
        ATTACHED_EVENT => Some(SessionEvent::Attached(session)),
        DETACHED_EVENT => Some(SessionEvent::Detached(session)),
        _ => None,
    }
}

/// Newline-terminated request asking the backend to release `page_id`.
pub fn release_request(id: &CorrelationId, page_id: &str) -> Vec<u8> {
    let msg = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": CLOSE_PAGE_METHOD,
        "params": { "pageId": page_id },
    });
    let mut out = msg.to_string().into_bytes();
    out.push(b'\n');
    out
}
