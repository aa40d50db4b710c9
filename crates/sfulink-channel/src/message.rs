use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::method::Method;

/// Where inside the worker a request is routed.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RoutingContext {
    /// Handled by the worker itself.
    #[default]
    Worker,
    /// Addressed to the entity registered under this handler id.
    Handler(String),
    /// Legacy routing document (`internal`) naming the target entities.
    Internal(Value),
}

impl RoutingContext {
    fn into_fields(self) -> (Option<String>, Option<Value>) {
        match self {
            RoutingContext::Worker => (None, None),
            RoutingContext::Handler(id) => (Some(id), None),
            RoutingContext::Internal(value) => (None, Some(value)),
        }
    }
}

/// One request as sent on the wire: `{id, method, handlerId|internal, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub id: u32,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RequestMessage {
    pub fn new(id: u32, method: Method, routing: RoutingContext, data: Option<Value>) -> Self {
        let (handler_id, internal) = routing.into_fields();
        Self {
            id,
            method,
            handler_id,
            internal,
            data,
        }
    }
}

/// A fire-and-forget message from the host to the worker:
/// `{event, handlerId|internal, data?}`. Carries no id and gets no answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostNotification {
    pub event: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl HostNotification {
    pub fn new(event: Method, routing: RoutingContext, data: Option<Value>) -> Self {
        let (handler_id, internal) = routing.into_fields();
        Self {
            event,
            handler_id,
            internal,
            data,
        }
    }
}

/// A fire-and-forget message from the worker to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target_id: String,
    pub event: String,
    pub data: Option<Value>,
}

/// How the worker answered a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Accepted(Option<Value>),
    Rejected { error: String, reason: String },
    /// Neither `accepted: true` nor an `error` was present.
    Malformed,
}

/// A response correlated to a request by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub outcome: ResponseOutcome,
}

/// Severity of a log line the worker wrote on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    Dump,
}

/// A classified inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(Response),
    Notification(Notification),
    Log { level: WorkerLogLevel, line: String },
    /// Well-formed JSON that is neither a response nor a notification.
    Unexpected(String),
    /// Payload that could not be parsed at all.
    Invalid(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: Option<Value>,
    accepted: Option<bool>,
    error: Option<String>,
    reason: Option<String>,
    target_id: Option<Value>,
    event: Option<String>,
    data: Option<Value>,
}

/// Classify one inbound payload by its leading byte and field presence.
///
/// A JSON document carrying `id` is a response; one carrying `targetId` and
/// `event` is a notification. Payloads starting with `D`, `W`, `E` or `X` are
/// log lines emitted by the worker.
pub fn classify(payload: &[u8]) -> InboundMessage {
    match payload.first() {
        Some(b'{') => classify_json(payload),
        Some(b'D') => log_line(WorkerLogLevel::Debug, payload),
        Some(b'W') => log_line(WorkerLogLevel::Warn, payload),
        Some(b'E') => log_line(WorkerLogLevel::Error, payload),
        Some(b'X') => log_line(WorkerLogLevel::Dump, payload),
        _ => InboundMessage::Invalid(String::from_utf8_lossy(payload).into_owned()),
    }
}

fn log_line(level: WorkerLogLevel, payload: &[u8]) -> InboundMessage {
    InboundMessage::Log {
        level,
        line: String::from_utf8_lossy(&payload[1..]).into_owned(),
    }
}

fn classify_json(payload: &[u8]) -> InboundMessage {
    let raw: RawMessage = match serde_json::from_slice(payload) {
        Ok(raw) => raw,
        Err(_) => return InboundMessage::Invalid(String::from_utf8_lossy(payload).into_owned()),
    };

    if let Some(id) = raw.id.as_ref().and_then(Value::as_u64) {
        let Ok(id) = u32::try_from(id) else {
            return InboundMessage::Unexpected(String::from_utf8_lossy(payload).into_owned());
        };
        let outcome = if raw.accepted == Some(true) {
            ResponseOutcome::Accepted(raw.data)
        } else if let Some(error) = raw.error.filter(|e| !e.trim().is_empty()) {
            ResponseOutcome::Rejected {
                error,
                reason: raw.reason.unwrap_or_default(),
            }
        } else {
            ResponseOutcome::Malformed
        };
        return InboundMessage::Response(Response { id, outcome });
    }

    // targetId is a string in most messages but a number for some entities.
    let target_id = match raw.target_id {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    match (target_id, raw.event) {
        (Some(target_id), Some(event)) if !target_id.is_empty() && !event.is_empty() => {
            InboundMessage::Notification(Notification {
                target_id,
                event,
                data: raw.data,
            })
        }
        _ => InboundMessage::Unexpected(String::from_utf8_lossy(payload).into_owned()),
    }
}
