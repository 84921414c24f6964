use crate::assembler::ProtocolFrame;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Identifier tying a response to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(u64),
    Text(String),
}

impl CorrelationId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(CorrelationId::Number),
            Value::String(s) => Some(CorrelationId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{n}"),
            CorrelationId::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(n: u64) -> Self {
        CorrelationId::Number(n)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId::Text(s.to_string())
    }
}

static NUMERIC_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""id"\s*:\s*(\d+)"#).expect("numeric id pattern is valid"));

/// Correlation ids carried by a frame, in order of appearance.
///
/// Parsed frames contribute the top-level `id` of each message (one for an
/// object, one per element for a batch). Opaque frames fall back to a scan
/// for `"id": <digits>`, which can also match nested fields; structured
/// frames never take that path.
pub fn correlation_ids(frame: &ProtocolFrame) -> Vec<CorrelationId> {
    match frame {
        ProtocolFrame::Json { value, .. } => match value {
            Value::Array(items) => items.iter().filter_map(message_id).collect(),
            other => message_id(other).into_iter().collect(),
        },
        ProtocolFrame::Opaque(raw) => scan_numeric_ids(raw),
        ProtocolFrame::Continuation(_) => Vec::new(),
    }
}

fn message_id(value: &Value) -> Option<CorrelationId> {
    value.get("id").and_then(CorrelationId::from_value)
}

fn scan_numeric_ids(bytes: &[u8]) -> Vec<CorrelationId> {
    NUMERIC_ID
        .captures_iter(bytes)
        .filter_map(|caps| {
            let digits = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
            digits.parse::<u64>().ok().map(CorrelationId::Number)
        })
        .collect()
}
